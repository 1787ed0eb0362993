//! Connection worker: manager and dispatch loop.
//!
//! A single task owns every piece of mutable connection state: the state
//! machine, both queues, the serial counter, the buses, and the transport.
//! The facade talks to it over a command channel, so queue mutations, bus
//! publishes and transitions are never subject to parallel access. Blocking
//! work (auth parameter fetch, dial, TLS) runs on spawned tasks and re-enters
//! the loop through the open-outcome channel, tagged with the attempt it was
//! scheduled under; stale outcomes are discarded.

use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Duration, Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::AuthProvider,
    bus::MessageBus,
    codec::{self, WireFormat},
    endpoint::Endpoint,
    error::Error,
    options::ClientOptions,
    protocol::{Action, ErrorInfo, ProtocolMessage},
    transport::{ConnectRequest, Connector, Transport},
};

use super::{
    Delivery,
    acks::{OutboundMessage, PendingQueue, SerialCounter},
    command::{Command, ConnectionInfo},
    recovery::{RecoverInfo, ResumeTracker},
    state::{ConnectionState, StateChange, StateMachine},
};

/// Stand-in deadline for timer slots that are not armed.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Result of one transport open attempt, tagged with its attempt token.
struct OpenOutcome {
    attempt: u64,
    result: Result<Box<dyn Transport>, ErrorInfo>,
}

struct ConnectionIdentity {
    id: String,
    key: Option<String>,
}

pub(crate) struct ConnectionWorker {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    format: WireFormat,
    machine: StateMachine,
    endpoint: Endpoint,
    resume: ResumeTracker,
    recover: Option<RecoverInfo>,
    identity: Option<ConnectionIdentity>,
    serials: SerialCounter,
    outgoing: VecDeque<OutboundMessage>,
    pending: PendingQueue,
    incoming_bus: MessageBus,
    outgoing_bus: MessageBus,
    transport: Option<Box<dyn Transport>>,
    attempt: u64,
    opened_tx: mpsc::Sender<OpenOutcome>,
    opened_rx: mpsc::Receiver<OpenOutcome>,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    /// Degraded state of the current reconnect series, if any.
    last_degraded: Option<ConnectionState>,
    /// Connect attempts made from the degraded state in this series.
    degraded_retries: u32,
    deferred_pings: Vec<oneshot::Sender<Result<Duration, Error>>>,
}

impl ConnectionWorker {
    pub(crate) fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        machine: StateMachine,
        recover: Option<RecoverInfo>,
        cmd_rx: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        let (opened_tx, opened_rx) = mpsc::channel(4);
        let endpoint = Endpoint::from_options(&options);
        let format = options.format;
        Self {
            options,
            connector,
            format,
            machine,
            endpoint,
            resume: ResumeTracker::default(),
            recover,
            identity: None,
            serials: SerialCounter::new(),
            outgoing: VecDeque::new(),
            pending: PendingQueue::default(),
            incoming_bus: MessageBus::new("incoming", 0, 2),
            outgoing_bus: MessageBus::new("outgoing", 1, 2),
            transport: None,
            attempt: 0,
            opened_tx,
            opened_rx,
            cmd_rx,
            shutdown,
            retry_at: None,
            connect_deadline: None,
            close_deadline: None,
            last_degraded: None,
            degraded_retries: 0,
            deferred_pings: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let shutdown = self.shutdown.clone();
            let retry_sleep = sleep_until(self.retry_at.unwrap_or_else(far_future));
            let connect_sleep = sleep_until(self.connect_deadline.unwrap_or_else(far_future));
            let close_sleep = sleep_until(self.close_deadline.unwrap_or_else(far_future));
            tokio::pin!(retry_sleep, connect_sleep, close_sleep);

            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    self.abort().await;
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.abort().await;
                        return;
                    }
                },
                Some(outcome) = self.opened_rx.recv() => {
                    self.handle_open_outcome(outcome).await;
                }
                frame = recv_frame(self.transport.as_mut()), if self.transport.is_some() => {
                    self.handle_transport_event(frame).await;
                }
                () = &mut retry_sleep, if self.retry_at.is_some() => {
                    self.handle_retry_due().await;
                }
                () = &mut connect_sleep, if self.connect_deadline.is_some() => {
                    self.handle_connect_deadline().await;
                }
                () = &mut close_sleep, if self.close_deadline.is_some() => {
                    self.handle_close_deadline().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { notify } => self.handle_connect(notify),
            Command::Close { notify } => self.handle_close(notify).await,
            Command::Ping { notify } => self.handle_ping(notify).await,
            Command::Send { message, notify } => self.handle_send(message, notify).await,
            Command::SubscribeIncoming { handler, notify } => {
                let _ = notify.send(self.incoming_bus.subscribe(handler));
            }
            Command::SubscribeOutgoing { handler, notify } => {
                let _ = notify.send(self.outgoing_bus.subscribe(handler));
            }
            Command::Unsubscribe { token, notify } => {
                let removed = self.incoming_bus.unsubscribe(token) || self.outgoing_bus.unsubscribe(token);
                let _ = notify.send(removed);
            }
            Command::RecoveryKey { notify } => {
                let _ = notify.send(self.resume.recovery_key());
            }
            Command::Info { notify } => {
                let info = ConnectionInfo {
                    id: self.identity.as_ref().map(|identity| identity.id.clone()),
                    key: self.identity.as_ref().and_then(|identity| identity.key.clone()),
                    error_reason: self.machine.error_reason().cloned(),
                };
                let _ = notify.send(info);
            }
        }
    }

    fn handle_connect(&mut self, notify: oneshot::Sender<Result<(), Error>>) {
        use ConnectionState as S;
        match self.machine.current() {
            S::Connected => {
                let _ = notify.send(Ok(()));
            }
            S::Connecting => self.machine.wait_for(S::Connected, notify),
            S::Closing => {
                let _ = notify.send(Err(Error::InvalidStateTransition {
                    from: S::Closing,
                    to: S::Connecting,
                }));
            }
            state @ (S::Initialized | S::Disconnected | S::Suspended | S::Closed | S::Failed) => {
                if state == S::Failed {
                    self.reset_session();
                }
                if state == S::Initialized || state.is_terminal() {
                    self.last_degraded = None;
                    self.degraded_retries = 0;
                }
                self.retry_at = None;
                match self.machine.transition(S::Connecting, None) {
                    Ok(change) => {
                        self.finish_transition(&change);
                        self.machine.wait_for(S::Connected, notify);
                        self.begin_attempt();
                    }
                    Err(err) => {
                        let _ = notify.send(Err(err));
                    }
                }
            }
        }
    }

    async fn handle_close(&mut self, notify: oneshot::Sender<Result<(), Error>>) {
        use ConnectionState as S;
        match self.machine.current() {
            S::Closed => {
                let _ = notify.send(Ok(()));
            }
            S::Closing => self.machine.wait_for(S::Closed, notify),
            S::Failed => {
                let _ = notify.send(Err(Error::InvalidStateTransition {
                    from: S::Failed,
                    to: S::Closing,
                }));
            }
            S::Initialized => match self.machine.transition(S::Closed, None) {
                Ok(change) => {
                    self.finish_transition(&change);
                    let _ = notify.send(Ok(()));
                }
                Err(err) => {
                    let _ = notify.send(Err(err));
                }
            },
            S::Connecting | S::Connected | S::Disconnected | S::Suspended => {
                self.retry_at = None;
                self.connect_deadline = None;
                match self.machine.transition(S::Closing, None) {
                    Ok(change) => self.finish_transition(&change),
                    Err(err) => {
                        let _ = notify.send(Err(err));
                        return;
                    }
                }
                self.machine.wait_for(S::Closed, notify);
                if self.transport.is_some() {
                    self.send_close_frame().await;
                } else {
                    self.force_closed(None).await;
                }
            }
        }
    }

    async fn handle_ping(&mut self, notify: oneshot::Sender<Result<Duration, Error>>) {
        use ConnectionState as S;
        match self.machine.current() {
            S::Connected => self.start_ping(notify).await,
            S::Connecting => self.deferred_pings.push(notify),
            state => {
                let _ = notify.send(Err(Error::NotConnected(state)));
            }
        }
    }

    async fn start_ping(&mut self, notify: oneshot::Sender<Result<Duration, Error>>) {
        let started = Instant::now();
        let mut slot = Some(notify);
        self.incoming_bus.subscribe_once(move |frame| {
            if frame.action == Action::Heartbeat {
                if let Some(notify) = slot.take() {
                    let _ = notify.send(Ok(started.elapsed()));
                }
                true
            } else {
                false
            }
        });
        let heartbeat = ProtocolMessage::new(Action::Heartbeat);
        self.outgoing.push_back(OutboundMessage {
            message: heartbeat.clone(),
            ack: None,
        });
        self.outgoing_bus.publish(&heartbeat);
        self.drain_outgoing().await;
    }

    async fn handle_send(
        &mut self,
        message: ProtocolMessage,
        notify: oneshot::Sender<Result<Delivery, Error>>,
    ) {
        use ConnectionState as S;
        let state = self.machine.current();
        if matches!(state, S::Suspended | S::Closing | S::Closed | S::Failed) {
            let _ = notify.send(Err(Error::NotConnected(state)));
            return;
        }
        if !self.options.queue_messages && state != S::Connected {
            let _ = notify.send(Err(Error::NotConnected(state)));
            return;
        }

        let mut message = message;
        let (delivery, outbound) = if message.action.ack_required() {
            let serial = self.serials.assign();
            message.msg_serial = Some(serial);
            let (ack_tx, ack_rx) = oneshot::channel();
            (
                Delivery { ack: Some(ack_rx) },
                OutboundMessage {
                    message,
                    ack: Some(ack_tx),
                },
            )
        } else {
            (
                Delivery { ack: None },
                OutboundMessage { message, ack: None },
            )
        };

        let published = outbound.message.clone();
        self.outgoing.push_back(outbound);
        self.outgoing_bus.publish(&published);
        let _ = notify.send(Ok(delivery));
        if self.machine.current() == S::Connected {
            self.drain_outgoing().await;
        }
    }

    /// Drain the outgoing queue to the transport while connected.
    ///
    /// Ack-required frames enter the pending queue before the write, so a
    /// server ack can never observe a frame with no pending entry. A failed
    /// write stops the drain; the written frame stays pending for replay and
    /// the rest stays queued.
    async fn drain_outgoing(&mut self) {
        while self.machine.current() == ConnectionState::Connected && self.transport.is_some() {
            let Some(outbound) = self.outgoing.pop_front() else {
                break;
            };
            let bytes = match codec::encode(self.format, &outbound.message) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("dropping undeliverable frame: {err}");
                    if outbound.message.msg_serial == Some(self.serials.last()) {
                        self.serials.rollback();
                    }
                    if let Some(ack) = outbound.ack {
                        let _ = ack.send(Err(ErrorInfo::bad_request(format!(
                            "frame encoding failed: {err}"
                        ))));
                    }
                    continue;
                }
            };
            if outbound.message.action.ack_required() {
                match outbound.message.msg_serial {
                    Some(serial) => self.pending.push(serial, outbound),
                    None => warn!("protocol violation: ack-required frame without serial"),
                }
            }
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            if let Err(err) = transport.send(bytes).await {
                warn!("transport write failed mid-drain: {err}");
                self.connection_lost(ErrorInfo::connection(format!(
                    "transport write failed: {err}"
                )))
                .await;
                break;
            }
            // Explicit suspension point between frames so a long backlog
            // cannot monopolise the loop.
            tokio::task::yield_now().await;
        }
    }

    /// Start one transport open attempt for the current `Connecting` entry.
    fn begin_attempt(&mut self) {
        self.attempt = self.attempt.wrapping_add(1);
        let attempt = self.attempt;
        let use_fallback = matches!(
            self.last_degraded,
            Some(ConnectionState::Disconnected | ConnectionState::Suspended)
        ) && self.degraded_retries >= 1;
        let host = self.endpoint.host_for_attempt(use_fallback);
        info!("opening transport attempt={attempt} host={host} fallback={use_fallback}");

        let mut params: Vec<(String, String)> = vec![
            ("format".into(), self.format.query_value().into()),
            (
                "echo".into(),
                if self.options.echo_messages { "true" } else { "false" }.into(),
            ),
            ("timestamp".into(), now_ms().to_string()),
        ];
        if let Some(client_id) = &self.options.client_id {
            params.push(("client_id".into(), client_id.clone()));
        }
        if let Some((key, serial)) = self.resume.resume_params() {
            params.push(("resume".into(), key.to_string()));
            params.push(("connection_serial".into(), serial.to_string()));
        } else if let Some(recover) = &self.recover {
            params.push(("recover".into(), recover.key.clone()));
            params.push(("connection_serial".into(), recover.serial.to_string()));
        }

        let request = ConnectRequest {
            host,
            port: self.endpoint.port(),
            tls: self.endpoint.tls(),
            format: self.format,
            params,
        };
        let provider = self.options.auth.provider();
        let connector = Arc::clone(&self.connector);
        let opened_tx = self.opened_tx.clone();
        let open_timeout = self.options.http_open_timeout;
        let auth_retries = self.options.http_max_retry_count;
        let auth_budget = self.options.http_max_retry_duration;
        tokio::spawn(async move {
            let result =
                open_transport(connector, provider, request, open_timeout, auth_retries, auth_budget)
                    .await;
            let _ = opened_tx.send(OpenOutcome { attempt, result }).await;
        });
        self.connect_deadline =
            Some(Instant::now() + open_timeout + self.options.http_request_timeout);
    }

    async fn handle_open_outcome(&mut self, outcome: OpenOutcome) {
        if outcome.attempt != self.attempt
            || self.machine.current() != ConnectionState::Connecting
        {
            if let Ok(mut transport) = outcome.result {
                debug!("discarding transport from superseded attempt={}", outcome.attempt);
                transport.close().await;
            }
            return;
        }
        match outcome.result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.connect_deadline =
                    Some(Instant::now() + self.options.http_request_timeout);
                debug!("transport open, awaiting connection acknowledgement");
            }
            Err(info) => self.degrade(info).await,
        }
    }

    async fn handle_retry_due(&mut self) {
        self.retry_at = None;
        if !matches!(
            self.machine.current(),
            ConnectionState::Disconnected | ConnectionState::Suspended
        ) {
            return;
        }
        match self.machine.transition(ConnectionState::Connecting, None) {
            Ok(change) => {
                self.finish_transition(&change);
                self.begin_attempt();
                self.degraded_retries += 1;
            }
            Err(err) => warn!("retry transition rejected: {err}"),
        }
    }

    async fn handle_connect_deadline(&mut self) {
        self.connect_deadline = None;
        if self.machine.current() == ConnectionState::Connecting {
            self.degrade(ErrorInfo::timeout("connection establishment timed out"))
                .await;
        }
    }

    async fn handle_close_deadline(&mut self) {
        self.close_deadline = None;
        if self.machine.current() == ConnectionState::Closing {
            info!("close acknowledgement timed out; forcing closed");
            self.force_closed(Some(ErrorInfo::timeout("close handshake timed out")))
                .await;
        }
    }

    async fn handle_transport_event(&mut self, frame: Option<io::Result<Bytes>>) {
        match frame {
            Some(Ok(bytes)) => match codec::decode(self.format, &bytes) {
                Ok(message) => self.dispatch_incoming(message).await,
                Err(err) => warn!("{err}"),
            },
            Some(Err(err)) => {
                self.connection_lost(ErrorInfo::connection(format!(
                    "transport read failed: {err}"
                )))
                .await;
            }
            None => {
                self.connection_lost(ErrorInfo::disconnected("transport closed by peer"))
                    .await;
            }
        }
    }

    /// Route one inbound frame per the dispatch rules.
    async fn dispatch_incoming(&mut self, message: ProtocolMessage) {
        if let Some(serial) = message.connection_serial {
            self.resume.note_serial(serial);
        }
        match message.action {
            Action::Connected => self.handle_connected_frame(message).await,
            Action::Ack => self.handle_ack(&message, true),
            Action::Nack => self.handle_ack(&message, false),
            Action::Error if message.channel.is_none() => {
                let info = message
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::server("connection error"));
                self.fail(info).await;
            }
            Action::Disconnected => {
                let info = message
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::disconnected("server requested disconnect"));
                self.release_transport().await;
                if self.machine.current() == ConnectionState::Closing {
                    self.force_closed(Some(info)).await;
                } else {
                    self.degrade(info).await;
                }
            }
            Action::Closed => {
                self.close_deadline = None;
                self.release_transport().await;
                let reason = message
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::closed("connection closed"));
                self.pending.reject_all(&reason);
                match self.machine.transition(ConnectionState::Closed, message.error.clone()) {
                    Ok(change) => self.finish_transition(&change),
                    Err(err) => warn!("protocol violation: unexpected Closed frame: {err}"),
                }
            }
            Action::Heartbeat => self.incoming_bus.publish(&message),
            Action::Unknown(code) => warn!("ignoring frame with unknown action code={code}"),
            _ => self.incoming_bus.publish(&message),
        }
    }

    async fn handle_connected_frame(&mut self, message: ProtocolMessage) {
        use ConnectionState as S;
        let state = self.machine.current();
        if !matches!(state, S::Connecting | S::Connected) {
            warn!("protocol violation: Connected frame in state {state:?}");
            return;
        }
        self.connect_deadline = None;
        let resumed = match (&self.identity, &message.connection_id) {
            (Some(identity), Some(id)) => identity.id == *id,
            _ => false,
        };
        if self.identity.is_some() && !resumed {
            info!("connection id changed; starting a fresh delivery generation");
            self.reset_delivery_state();
            self.resume.clear_serial();
            if let Some(serial) = message.connection_serial {
                self.resume.note_serial(serial);
            }
        }
        if let Some(error) = &message.error {
            // The server reports a denied resume this way while still
            // accepting the connection.
            warn!("connection established with warning: {error}");
        }
        if let Some(id) = message.connection_id.clone() {
            self.identity = Some(ConnectionIdentity {
                id,
                key: message.connection_key.clone(),
            });
        }
        self.resume.set_key(message.connection_key.clone());
        self.last_degraded = None;
        self.degraded_retries = 0;
        self.endpoint.reset();

        if state == S::Connected {
            debug!("connection details refreshed in place");
        } else {
            match self.machine.transition(S::Connected, message.error.clone()) {
                Ok(change) => self.finish_transition(&change),
                Err(err) => {
                    warn!("connected transition rejected: {err}");
                    return;
                }
            }
            let waiting: Vec<_> = self.deferred_pings.drain(..).collect();
            for notify in waiting {
                self.start_ping(notify).await;
            }
        }
        self.drain_outgoing().await;
    }

    fn handle_ack(&mut self, message: &ProtocolMessage, ok: bool) {
        let Some(first) = message.msg_serial else {
            warn!("protocol violation: ack frame without serial");
            return;
        };
        let count = message.count.unwrap_or(1);
        let outcome = if ok {
            Ok(())
        } else {
            Err(message
                .error
                .clone()
                .unwrap_or_else(|| ErrorInfo::server("message delivery refused")))
        };
        let report = self.pending.complete(first, count, &outcome);
        debug!(
            "ack window first={first} count={count} settled={}",
            report.settled
        );
        for violation in &report.violations {
            warn!("protocol violation: {violation}");
        }
    }

    async fn send_close_frame(&mut self) {
        let serial = self.serials.assign();
        let mut message = ProtocolMessage::new(Action::Close);
        message.msg_serial = Some(serial);
        let bytes = match codec::encode(self.format, &message) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("close frame encoding failed: {err}");
                self.force_closed(None).await;
                return;
            }
        };
        self.pending.push(serial, OutboundMessage { message, ack: None });
        let Some(transport) = self.transport.as_mut() else {
            self.force_closed(None).await;
            return;
        };
        if let Err(err) = transport.send(bytes).await {
            warn!("close frame write failed: {err}");
            self.force_closed(Some(ErrorInfo::connection(format!(
                "transport write failed: {err}"
            ))))
            .await;
            return;
        }
        self.close_deadline = Some(Instant::now() + self.options.http_request_timeout);
    }

    /// Force the terminal `Closed` state, releasing the transport.
    async fn force_closed(&mut self, reason: Option<ErrorInfo>) {
        self.release_transport().await;
        self.close_deadline = None;
        self.pending
            .reject_all(&ErrorInfo::closed("connection closed"));
        match self.machine.transition(ConnectionState::Closed, reason) {
            Ok(change) => self.finish_transition(&change),
            Err(err) => warn!("closed transition rejected: {err}"),
        }
    }

    /// Move towards `Disconnected` or `Suspended` after a retryable failure.
    async fn degrade(&mut self, info: ErrorInfo) {
        use ConnectionState as S;
        if info.is_fatal() {
            self.fail(info).await;
            return;
        }
        self.release_transport().await;
        self.connect_deadline = None;
        let escalate = self.last_degraded == Some(S::Suspended)
            || self.degraded_retries >= self.options.max_disconnected_retries;
        let (next, delay) = if escalate {
            (S::Suspended, self.options.suspended_retry_timeout)
        } else {
            (S::Disconnected, self.options.disconnected_retry_timeout)
        };
        if next == S::Disconnected {
            // Resumable: pending frames replay ahead of queued traffic with
            // their original serials.
            let replay = self.pending.drain_for_replay();
            for outbound in replay.into_iter().rev() {
                self.outgoing.push_front(outbound);
            }
        } else {
            self.pending
                .reject_all(&ErrorInfo::suspended("connection suspended"));
        }
        match self.machine.transition(next, Some(info)) {
            Ok(change) => {
                self.finish_transition(&change);
                self.last_degraded = Some(next);
                self.retry_at = Some(Instant::now() + delay);
            }
            Err(err) => warn!("degrade transition rejected: {err}"),
        }
    }

    /// Terminal failure: reject pending traffic and stop retrying.
    async fn fail(&mut self, info: ErrorInfo) {
        self.release_transport().await;
        self.retry_at = None;
        self.connect_deadline = None;
        self.close_deadline = None;
        self.pending.reject_all(&info);
        match self.machine.transition(ConnectionState::Failed, Some(info)) {
            Ok(change) => self.finish_transition(&change),
            Err(err) => warn!("failed transition rejected: {err}"),
        }
    }

    async fn connection_lost(&mut self, info: ErrorInfo) {
        use ConnectionState as S;
        self.release_transport().await;
        self.connect_deadline = None;
        match self.machine.current() {
            S::Closing => {
                self.close_deadline = None;
                self.pending
                    .reject_all(&ErrorInfo::closed("connection closed"));
                match self.machine.transition(S::Closed, Some(info)) {
                    Ok(change) => self.finish_transition(&change),
                    Err(err) => warn!("closed transition rejected: {err}"),
                }
            }
            S::Connected | S::Connecting => self.degrade(info).await,
            state => debug!("transport loss ignored in state {state:?}"),
        }
    }

    /// Reject pending frames, restart serial numbering and renumber queued
    /// ack-required frames for a fresh connection generation.
    fn reset_delivery_state(&mut self) {
        self.pending
            .reject_all(&ErrorInfo::reset("connection generation changed"));
        self.serials.reset();
        for outbound in &mut self.outgoing {
            if outbound.message.action.ack_required() {
                outbound.message.msg_serial = Some(self.serials.assign());
            }
        }
    }

    /// Forget the previous session entirely; used when connecting out of
    /// `Failed`.
    fn reset_session(&mut self) {
        self.identity = None;
        self.resume.clear();
        self.serials.reset();
        for outbound in &mut self.outgoing {
            if outbound.message.action.ack_required() {
                outbound.message.msg_serial = Some(self.serials.assign());
            }
        }
    }

    /// Worker-side bookkeeping tied to specific state entries.
    fn finish_transition(&mut self, change: &StateChange) {
        use ConnectionState as S;
        if matches!(change.current, S::Connected | S::Closed | S::Failed)
            && self.recover.take().is_some()
        {
            debug!("recover option consumed");
        }
        if change.current.is_terminal() {
            // The session is over either way; a later connect starts fresh
            // rather than resuming it.
            self.resume.clear();
            let reason = change.reason.clone().unwrap_or_else(|| {
                if change.current == S::Failed {
                    ErrorInfo::server("connection failed")
                } else {
                    ErrorInfo::closed("connection closed")
                }
            });
            for outbound in self.outgoing.drain(..) {
                if let Some(ack) = outbound.ack {
                    let _ = ack.send(Err(reason.clone()));
                }
            }
            for notify in self.deferred_pings.drain(..) {
                let _ = notify.send(Err(Error::NotConnected(change.current)));
            }
        }
    }

    async fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    async fn abort(&mut self) {
        debug!("connection worker stopping");
        self.release_transport().await;
        self.pending
            .reject_all(&ErrorInfo::closed("connection dropped"));
        for notify in self.deferred_pings.drain(..) {
            let _ = notify.send(Err(Error::Dropped));
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + FAR_FUTURE
}

async fn recv_frame(transport: Option<&mut Box<dyn Transport>>) -> Option<io::Result<Bytes>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn open_transport(
    connector: Arc<dyn Connector>,
    provider: Arc<dyn AuthProvider>,
    mut request: ConnectRequest,
    open_timeout: Duration,
    auth_retries: u32,
    auth_budget: Duration,
) -> Result<Box<dyn Transport>, ErrorInfo> {
    let auth = fetch_auth_params(provider.as_ref(), auth_retries, auth_budget).await?;
    request.params.extend(auth);
    match tokio::time::timeout(open_timeout, connector.connect(request)).await {
        Ok(result) => result,
        Err(_) => Err(ErrorInfo::timeout("transport open timed out")),
    }
}

/// Fetch handshake auth parameters, retrying transient provider failures up
/// to `max_retries` extra attempts within `budget`. Fatal request-class
/// errors are not retried.
async fn fetch_auth_params(
    provider: &dyn AuthProvider,
    max_retries: u32,
    budget: Duration,
) -> Result<crate::auth::AuthParams, ErrorInfo> {
    let deadline = Instant::now() + budget;
    let mut attempt = 0u32;
    loop {
        match tokio::time::timeout_at(deadline, provider.auth_params()).await {
            Ok(Ok(params)) => return Ok(params),
            Ok(Err(info)) => {
                if info.is_fatal() || attempt >= max_retries {
                    return Err(info);
                }
                attempt += 1;
                debug!("auth parameter fetch failed, retrying attempt={attempt}: {info}");
            }
            Err(_) => return Err(ErrorInfo::timeout("auth parameter fetch timed out")),
        }
    }
}
