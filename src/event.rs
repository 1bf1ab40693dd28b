// One-line transfer events for whoever is watching a sending session.
//
// Events are also written to the log, so a session without a listener still leaves a trail.

use crate::tftp::Options;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<TransferEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    RequestSent { filename: String, size: u64 },
    OptionsAcknowledged(Options),
    RequestAcknowledged,
    /// `wire` differs from the block's own number only when it was deliberately corrupted.
    DataSent { block: u64, wire: u16, len: usize },
    AckReceived { block: u16 },
    UnexpectedAck { expected: u16, received: u16 },
    AckMissing { block: u16 },
    BlockDropped { block: u64 },
    BlocksSwapped { first: u64, second: u64 },
    Pausing { before_block: u64, duration: Duration },
    Truncated { bytes_sent: u64, total: u64 },
    Ignored(String),
    Completed(String),
    Aborted { bytes_sent: u64 },
    Failed(String),
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RequestSent { filename, size } => write!(f, "WRQ sent for '{filename}' (size {size})"),
            Self::OptionsAcknowledged(options) => {
                write!(f, "OACK received:")?;
                for (key, value) in options {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
            Self::RequestAcknowledged => write!(f, "ACK 0 received"),
            Self::DataSent { block, wire, len } if u64::from(*wire) == block % 65536 => {
                write!(f, "DATA {wire} sent ({len} bytes)")
            }
            Self::DataSent { block, wire, len } => {
                write!(f, "DATA for block {block} sent as {wire} ({len} bytes)")
            }
            Self::AckReceived { block } => write!(f, "ACK {block} received"),
            Self::UnexpectedAck { expected, received } => {
                write!(f, "ACK {received} received while waiting for {expected}")
            }
            Self::AckMissing { block } => write!(f, "no ACK for block {block}"),
            Self::BlockDropped { block } => write!(f, "block {block} dropped"),
            Self::BlocksSwapped { first, second } => write!(f, "block {second} sent before {first}"),
            Self::Pausing { before_block, duration } => {
                write!(f, "pausing {:.1}s before block {before_block}", duration.as_secs_f64())
            }
            Self::Truncated { bytes_sent, total } => {
                write!(f, "stopping after {bytes_sent} of {total} bytes")
            }
            Self::Ignored(what) => write!(f, "ignored {what}"),
            Self::Completed(summary) => write!(f, "transfer complete: {summary}"),
            Self::Aborted { bytes_sent } => write!(f, "transfer aborted after {bytes_sent} bytes"),
            Self::Failed(reason) => write!(f, "transfer failed: {reason}"),
        }
    }
}

/// Forwards events to the log and, when present, to a listener.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<EventSender>,
}

impl EventSink {
    pub fn new(tx: Option<EventSender>) -> EventSink {
        EventSink { tx }
    }

    pub fn emit(&self, event: TransferEvent) {
        match &event {
            TransferEvent::Failed(_) => log::error!("{event}"),
            TransferEvent::AckMissing { .. }
            | TransferEvent::UnexpectedAck { .. }
            | TransferEvent::Aborted { .. } => log::warn!("{event}"),
            TransferEvent::DataSent { .. } | TransferEvent::AckReceived { .. } => log::debug!("{event}"),
            _ => log::info!("{event}"),
        }

        if let Some(tx) = &self.tx {
            // A listener that went away is not the session's problem.
            let _ = tx.send(event);
        }
    }
}
