//! In-process pub/sub hub for protocol frames.
//!
//! The connection owns two buses: one publishing every inbound frame and one
//! publishing every frame accepted for delivery. Handlers run synchronously
//! on the publishing task in subscription order, so subscribers observe
//! frames exactly as the dispatchers process them. A panicking handler is
//! caught and logged; later handlers still run and frame order is preserved.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
};

use log::warn;

use crate::protocol::ProtocolMessage;

/// Opaque handle identifying a bus subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Persistent frame handler.
pub(crate) type Handler = Box<dyn FnMut(&ProtocolMessage) + Send>;

type OnceHandler = Box<dyn FnMut(&ProtocolMessage) -> bool + Send>;

/// Ordered registry of frame handlers for one direction of traffic.
///
/// Token values advance by `stride` from `seed`, letting the two buses owned
/// by one connection hand out disjoint token spaces.
pub(crate) struct MessageBus {
    label: &'static str,
    next_token: u64,
    stride: u64,
    handlers: Vec<(SubscriptionToken, Handler)>,
    once: Vec<OnceHandler>,
}

impl MessageBus {
    pub(crate) fn new(label: &'static str, seed: u64, stride: u64) -> Self {
        Self {
            label,
            next_token: seed,
            stride,
            handlers: Vec::new(),
            once: Vec::new(),
        }
    }

    /// Register a handler invoked for every published frame.
    pub(crate) fn subscribe(
        &mut self,
        handler: impl FnMut(&ProtocolMessage) + Send + 'static,
    ) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token);
        self.next_token += self.stride;
        self.handlers.push((token, Box::new(handler)));
        token
    }

    /// Register a one-shot handler, removed after the first frame for which
    /// it returns `true`.
    pub(crate) fn subscribe_once(
        &mut self,
        handler: impl FnMut(&ProtocolMessage) -> bool + Send + 'static,
    ) {
        self.once.push(Box::new(handler));
    }

    /// Remove a handler; returns `false` when the token is not registered.
    pub(crate) fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token);
        self.handlers.len() != before
    }

    /// Invoke every handler with `frame`, in subscription order.
    pub(crate) fn publish(&mut self, frame: &ProtocolMessage) {
        for (token, handler) in &mut self.handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                warn!(
                    "bus={} handler token={token:?} panicked: {}",
                    self.label,
                    format_panic(panic)
                );
            }
        }
        let label = self.label;
        self.once.retain_mut(|handler| {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(consumed) => !consumed,
                Err(panic) => {
                    warn!("bus={label} one-shot handler panicked: {}", format_panic(panic));
                    false
                }
            }
        });
    }
}

/// Extract a readable message from a panic payload.
fn format_panic(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "Any".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;

    use super::*;
    use crate::protocol::{Action, ProtocolMessage};

    fn frame() -> ProtocolMessage {
        ProtocolMessage::new(Action::Heartbeat)
    }

    #[rstest]
    fn handlers_run_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new("test", 0, 1);
        for id in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().expect("lock").push(id));
        }
        bus.publish(&frame());
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[rstest]
    fn panicking_handler_does_not_stop_later_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new("test", 0, 1);
        bus.subscribe(|_| panic!("boom"));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().expect("lock").push("after"));
        }
        bus.publish(&frame());
        bus.publish(&frame());
        assert_eq!(*seen.lock().expect("lock"), vec!["after", "after"]);
    }

    #[rstest]
    fn unsubscribe_removes_only_the_token() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new("test", 0, 1);
        let first = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().expect("lock").push("first"))
        };
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().expect("lock").push("second"));
        }
        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.publish(&frame());
        assert_eq!(*seen.lock().expect("lock"), vec!["second"]);
    }

    #[rstest]
    fn one_shot_handler_fires_once_consumed() {
        let seen = Arc::new(Mutex::new(0u32));
        let mut bus = MessageBus::new("test", 0, 1);
        {
            let seen = Arc::clone(&seen);
            bus.subscribe_once(move |_| {
                *seen.lock().expect("lock") += 1;
                true
            });
        }
        bus.publish(&frame());
        bus.publish(&frame());
        assert_eq!(*seen.lock().expect("lock"), 1);
    }

    #[rstest]
    fn one_shot_handler_waits_for_a_matching_frame() {
        let seen = Arc::new(Mutex::new(0u32));
        let mut bus = MessageBus::new("test", 0, 1);
        {
            let seen = Arc::clone(&seen);
            bus.subscribe_once(move |frame| {
                if frame.action == Action::Closed {
                    *seen.lock().expect("lock") += 1;
                    true
                } else {
                    false
                }
            });
        }
        bus.publish(&frame());
        assert_eq!(*seen.lock().expect("lock"), 0);
        bus.publish(&ProtocolMessage::new(Action::Closed));
        bus.publish(&ProtocolMessage::new(Action::Closed));
        assert_eq!(*seen.lock().expect("lock"), 1);
    }
}
