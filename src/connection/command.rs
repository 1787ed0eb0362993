//! Commands sent from the public facade to the connection worker.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::{
    bus::{Handler, SubscriptionToken},
    error::Error,
    protocol::{ErrorInfo, ProtocolMessage},
};

use super::Delivery;

/// Snapshot of connection identity and terminal error state.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// Server-assigned connection id, present while connected.
    pub id: Option<String>,
    /// Private connection key used for resume.
    pub key: Option<String>,
    /// Error that drove the last terminal transition.
    pub error_reason: Option<ErrorInfo>,
}

/// Requests processed by the worker task.
pub(crate) enum Command {
    Connect {
        notify: oneshot::Sender<Result<(), Error>>,
    },
    Close {
        notify: oneshot::Sender<Result<(), Error>>,
    },
    Ping {
        notify: oneshot::Sender<Result<Duration, Error>>,
    },
    Send {
        message: ProtocolMessage,
        notify: oneshot::Sender<Result<Delivery, Error>>,
    },
    SubscribeIncoming {
        handler: Handler,
        notify: oneshot::Sender<SubscriptionToken>,
    },
    SubscribeOutgoing {
        handler: Handler,
        notify: oneshot::Sender<SubscriptionToken>,
    },
    Unsubscribe {
        token: SubscriptionToken,
        notify: oneshot::Sender<bool>,
    },
    RecoveryKey {
        notify: oneshot::Sender<Option<String>>,
    },
    Info {
        notify: oneshot::Sender<ConnectionInfo>,
    },
}
