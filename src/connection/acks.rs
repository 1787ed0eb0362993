//! Outbound serial assignment and pending-acknowledgement accounting.
//!
//! Every ack-required frame gets the next serial for the current connection
//! generation and, at the instant it is handed to the transport, a matching
//! entry in the pending queue. Serials in the queue always form a contiguous
//! increasing run; `Ack`/`Nack` frames settle a window of them at a time.

use std::collections::VecDeque;

use log::error;
use tokio::sync::oneshot;

use crate::protocol::{ErrorInfo, ProtocolMessage};

/// Awaiter settled when the frame's fate is known.
pub(crate) type AckSender = oneshot::Sender<Result<(), ErrorInfo>>;

/// A frame travelling through the outgoing queue towards the transport,
/// together with its acknowledgement awaiter when one exists.
pub(crate) struct OutboundMessage {
    pub(crate) message: ProtocolMessage,
    pub(crate) ack: Option<AckSender>,
}

/// Monotonic serial source, pre-incremented before use.
///
/// The first assigned serial is 0. Assignment is transactional: a caller
/// that fails to enqueue the frame rolls the counter back so the next
/// assignment reuses the serial and the wire sequence stays gapless.
#[derive(Debug)]
pub(crate) struct SerialCounter {
    last: i64,
}

impl SerialCounter {
    pub(crate) fn new() -> Self {
        Self { last: -1 }
    }

    pub(crate) fn assign(&mut self) -> i64 {
        self.last += 1;
        self.last
    }

    pub(crate) fn rollback(&mut self) {
        self.last -= 1;
    }

    pub(crate) fn last(&self) -> i64 {
        self.last
    }

    /// Restart numbering for a fresh connection generation.
    pub(crate) fn reset(&mut self) {
        self.last = -1;
    }
}

struct PendingEntry {
    serial: i64,
    outbound: OutboundMessage,
}

/// Outcome of applying one `Ack`/`Nack` window to the queue.
#[derive(Debug, Default)]
pub(crate) struct CompletionReport {
    /// Number of entries settled by the window.
    pub(crate) settled: usize,
    /// Contiguity violations observed while matching.
    pub(crate) violations: Vec<String>,
}

/// Ack-required frames handed to the transport and awaiting their fate.
#[derive(Default)]
pub(crate) struct PendingQueue {
    entries: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; serials must arrive in increasing contiguous order.
    pub(crate) fn push(&mut self, serial: i64, outbound: OutboundMessage) {
        if let Some(last) = self.entries.back() {
            if serial != last.serial + 1 {
                error!(
                    "pending queue contiguity broken: serial={serial} follows {}",
                    last.serial
                );
            }
        }
        self.entries.push_back(PendingEntry { serial, outbound });
    }

    /// Settle every entry with serial in `[first, first + count)`.
    ///
    /// Entries below the window stay queued; window serials not present in
    /// the queue are reported as violations and otherwise ignored.
    pub(crate) fn complete(
        &mut self,
        first: i64,
        count: u32,
        outcome: &Result<(), ErrorInfo>,
    ) -> CompletionReport {
        let mut report = CompletionReport::default();
        let end = first + i64::from(count);
        if let Some(front) = self.entries.front() {
            if first < front.serial {
                report.violations.push(format!(
                    "window starts at {first} but lowest pending serial is {}",
                    front.serial
                ));
            }
        } else {
            report
                .violations
                .push(format!("window [{first}, {end}) with no pending frames"));
            return report;
        }

        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.serial >= first && entry.serial < end {
                if let Some(ack) = entry.outbound.ack {
                    let _ = ack.send(outcome.clone());
                }
                report.settled += 1;
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;

        let expected = usize::try_from(end.saturating_sub(first)).unwrap_or(usize::MAX);
        if report.settled < expected && report.violations.is_empty() {
            report.violations.push(format!(
                "window [{first}, {end}) settled only {} pending frames",
                report.settled
            ));
        }
        report
    }

    /// Reject every entry with `error`, emptying the queue.
    pub(crate) fn reject_all(&mut self, error: &ErrorInfo) {
        for entry in self.entries.drain(..) {
            if let Some(ack) = entry.outbound.ack {
                let _ = ack.send(Err(error.clone()));
            }
        }
    }

    /// Take every entry for replay, oldest first, keeping serials and
    /// awaiters attached to their frames.
    pub(crate) fn drain_for_replay(&mut self) -> Vec<OutboundMessage> {
        self.entries.drain(..).map(|entry| entry.outbound).collect()
    }
}
