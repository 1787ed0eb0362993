//! Connection lifecycle state machine.
//!
//! Every move is checked against the transition table; a disallowed move is
//! an error, never a silent correction. Each successful transition emits a
//! [`StateChange`] to broadcast listeners, updates a watch channel holding
//! the current state, and settles any deferred completions keyed on the new
//! state. Entering `Connected` increments the connection generation.

use log::info;
use tokio::sync::{broadcast, oneshot, watch};

use crate::{error::Error, protocol::ErrorInfo};

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Whether the state machine may move from `self` to `to`.
    #[must_use]
    pub fn can_move_to(self, to: Self) -> bool {
        use ConnectionState::{
            Closed, Closing, Connected, Connecting, Disconnected, Failed, Initialized, Suspended,
        };
        match self {
            Initialized => matches!(to, Connecting | Closed),
            Connecting => matches!(to, Connected | Disconnected | Suspended | Failed | Closing),
            Connected => matches!(to, Disconnected | Suspended | Closing | Failed),
            Disconnected => matches!(to, Connecting | Suspended | Closing | Failed),
            Suspended => matches!(to, Connecting | Closing | Failed),
            Closing => matches!(to, Closed | Failed),
            Closed => matches!(to, Connecting),
            Failed => matches!(to, Connecting),
        }
    }

    /// Whether this state ends the connection's life until a fresh connect.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Event emitted on every state transition.
#[derive(Clone, Debug)]
pub struct StateChange {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub current: ConnectionState,
    /// Error that drove the transition, when there was one.
    pub reason: Option<ErrorInfo>,
}

struct StateWaiter {
    target: ConnectionState,
    notify: oneshot::Sender<Result<(), Error>>,
}

/// Authoritative connection lifecycle holder.
pub(crate) struct StateMachine {
    current: ConnectionState,
    generation: u64,
    error_reason: Option<ErrorInfo>,
    events: broadcast::Sender<StateChange>,
    state_tx: watch::Sender<ConnectionState>,
    waiters: Vec<StateWaiter>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (state_tx, _) = watch::channel(ConnectionState::Initialized);
        Self {
            current: ConnectionState::Initialized,
            generation: 0,
            error_reason: None,
            events,
            state_tx,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.current
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// Watch channel tracking the current state.
    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Broadcast handle for state-change events.
    pub(crate) fn events(&self) -> broadcast::Sender<StateChange> {
        self.events.clone()
    }

    /// Register a completion resolved when `target` is entered and rejected
    /// by a terminal transition to any other state.
    pub(crate) fn wait_for(
        &mut self,
        target: ConnectionState,
        notify: oneshot::Sender<Result<(), Error>>,
    ) {
        if self.current == target {
            let _ = notify.send(Ok(()));
            return;
        }
        self.waiters.push(StateWaiter { target, notify });
    }

    /// Move to `to`, emitting the change and settling waiters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when the move is not in the
    /// transition table; no event is emitted and no waiter is touched.
    pub(crate) fn transition(
        &mut self,
        to: ConnectionState,
        reason: Option<ErrorInfo>,
    ) -> Result<StateChange, Error> {
        if !self.current.can_move_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.current,
                to,
            });
        }
        let change = StateChange {
            previous: self.current,
            current: to,
            reason: reason.clone(),
        };
        self.current = to;
        if to == ConnectionState::Connected {
            self.generation += 1;
            self.error_reason = None;
        } else if to.is_terminal() {
            self.error_reason = reason;
        }
        info!(
            "connection state: {:?} -> {to:?} generation={} reason={:?}",
            change.previous, self.generation, change.reason
        );
        self.state_tx.send_replace(to);
        let _ = self.events.send(change.clone());
        self.settle_waiters(&change);
        Ok(change)
    }

    fn settle_waiters(&mut self, change: &StateChange) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if waiter.target == change.current {
                let _ = waiter.notify.send(Ok(()));
            } else if change.current.is_terminal() {
                let reason = change.reason.clone().unwrap_or_else(|| {
                    if change.current == ConnectionState::Failed {
                        ErrorInfo::server("connection failed")
                    } else {
                        ErrorInfo::closed("connection closed")
                    }
                });
                let _ = waiter.notify.send(Err(Error::from_info(reason)));
            } else {
                self.waiters.push(waiter);
            }
        }
    }
}
