//! Realtime connection facade.
//!
//! [`Connection`] is the user-facing object. It validates the options,
//! spawns the worker task owning all connection state, and forwards every
//! operation as a command answered over a oneshot channel. Current state is
//! observed through a watch channel without a worker round trip; state
//! changes stream through a broadcast channel in transition order.

mod acks;
mod command;
pub(crate) mod recovery;
pub(crate) mod state;
mod worker;

pub mod test_support;

use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub use command::ConnectionInfo;
pub use state::{ConnectionState, StateChange};

use crate::{
    bus::SubscriptionToken,
    error::Error,
    options::ClientOptions,
    protocol::{ErrorInfo, ProtocolMessage},
    transport::{Connector, TcpConnector},
};

use self::{
    command::Command,
    recovery::RecoverInfo,
    state::StateMachine,
    worker::ConnectionWorker,
};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Handle for a frame accepted by [`Connection::send`].
///
/// For ack-required frames, [`acknowledged`](Self::acknowledged) resolves
/// when the server settles the frame; for anything else it resolves
/// immediately.
#[must_use]
#[derive(Debug)]
pub struct Delivery {
    pub(crate) ack: Option<oneshot::Receiver<Result<(), ErrorInfo>>>,
}

impl Delivery {
    /// Whether the frame awaits a server `Ack`/`Nack`.
    #[must_use]
    pub fn ack_required(&self) -> bool {
        self.ack.is_some()
    }

    /// Wait for the frame's fate.
    ///
    /// # Errors
    ///
    /// Returns the `Nack` error, a reset/terminal rejection, or
    /// [`Error::Dropped`] when the connection went away entirely.
    pub async fn acknowledged(self) -> Result<(), Error> {
        match self.ack {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(info)) => Err(Error::from_info(info)),
                Err(_) => Err(Error::Dropped),
            },
        }
    }
}

/// A realtime connection to the messaging endpoint.
///
/// # Examples
///
/// ```no_run
/// use livewire::{Auth, ClientOptions, Connection};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), livewire::Error> {
/// let options = ClientOptions::builder(Auth::Key("app.keyid:secret".into())).build();
/// let connection = Connection::new(options)?;
/// connection.connect().await?;
/// println!("latency: {:?}", connection.ping().await?);
/// connection.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<StateChange>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a connection using the default TCP/TLS transport.
    ///
    /// The worker task starts immediately but nothing touches the network
    /// until [`connect`](Self::connect) is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the options fail validation.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Self::with_connector(options, Arc::new(TcpConnector::new()))
    }

    /// Create a connection with a custom transport connector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the options fail validation.
    pub fn with_connector(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, Error> {
        options.validate()?;
        log::set_max_level(options.log_level);
        let recover = options
            .recover
            .as_deref()
            .map(RecoverInfo::parse)
            .transpose()?;

        let machine = StateMachine::new();
        let state_rx = machine.watch();
        let events = machine.events();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let worker = ConnectionWorker::new(
            options,
            connector,
            machine,
            recover,
            cmd_rx,
            shutdown.clone(),
        );
        tokio::spawn(worker.run());

        Ok(Self {
            cmd_tx,
            state_rx,
            events,
            shutdown,
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Dropped)?;
        rx.await.map_err(|_| Error::Dropped)
    }

    /// Open the connection, resolving once `Connected` is reached.
    ///
    /// Already being `Connecting` or `Connected` is not an error: the call
    /// resolves with the in-flight attempt.
    ///
    /// # Errors
    ///
    /// Rejects when the connection instead reaches a terminal state, or with
    /// [`Error::InvalidStateTransition`] while `Closing`.
    pub async fn connect(&self) -> Result<(), Error> {
        self.request(|notify| Command::Connect { notify }).await?
    }

    /// Close the connection, resolving once `Closed` is reached.
    ///
    /// A no-op when already `Closing` or `Closed`; disallowed from `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] from `Failed`.
    pub async fn close(&self) -> Result<(), Error> {
        self.request(|notify| Command::Close { notify }).await?
    }

    /// Measure the round trip to the server with a heartbeat exchange.
    ///
    /// No implicit timeout applies; callers arm their own deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] outside `Connecting`/`Connected`.
    pub async fn ping(&self) -> Result<Duration, Error> {
        self.request(|notify| Command::Ping { notify }).await?
    }

    /// Queue a frame for delivery.
    ///
    /// Ack-required frames receive the next serial for this connection
    /// generation; the returned [`Delivery`] resolves when the server
    /// settles them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] in states that cannot accept traffic
    /// (or outside `Connected` when message queueing is disabled).
    pub async fn send(&self, message: ProtocolMessage) -> Result<Delivery, Error> {
        self.request(|notify| Command::Send { message, notify })
            .await?
    }

    /// Current connection state, without a worker round trip.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state-change events in transition order.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Register a handler for every inbound protocol frame routed to
    /// subscribers (messages, presence, channel traffic, heartbeats).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn subscribe_incoming<H>(&self, handler: H) -> Result<SubscriptionToken, Error>
    where
        H: FnMut(&ProtocolMessage) + Send + 'static,
    {
        self.request(|notify| Command::SubscribeIncoming {
            handler: Box::new(handler),
            notify,
        })
        .await
    }

    /// Register a handler observing every frame accepted for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn subscribe_outgoing<H>(&self, handler: H) -> Result<SubscriptionToken, Error>
    where
        H: FnMut(&ProtocolMessage) + Send + 'static,
    {
        self.request(|notify| Command::SubscribeOutgoing {
            handler: Box::new(handler),
            notify,
        })
        .await
    }

    /// Remove a bus subscription; returns whether the token was registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn unsubscribe(&self, token: SubscriptionToken) -> Result<bool, Error> {
        self.request(|notify| Command::Unsubscribe { token, notify })
            .await
    }

    /// Portable recovery key, present while resume state is held.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn recovery_key(&self) -> Result<Option<String>, Error> {
        self.request(|notify| Command::RecoveryKey { notify }).await
    }

    /// Snapshot of connection identity and terminal error state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn info(&self) -> Result<ConnectionInfo, Error> {
        self.request(|notify| Command::Info { notify }).await
    }

    /// Server-assigned connection id, present while connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn id(&self) -> Result<Option<String>, Error> {
        Ok(self.info().await?.id)
    }

    /// Private connection key used for resume, present while connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn key(&self) -> Result<Option<String>, Error> {
        Ok(self.info().await?.key)
    }

    /// Error behind the last terminal transition, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dropped`] when the worker has exited.
    pub async fn error_reason(&self) -> Result<Option<ErrorInfo>, Error> {
        Ok(self.info().await?.error_reason)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
