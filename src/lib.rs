// A TFTP upload engine for probing receivers.
//
// The sender (`session`) performs a WRQ/OACK handshake and a stop-and-wait DATA/ACK exchange,
// optionally bent by one of the fault variants in `fault`. The receiver (`srv_conn`) accepts
// uploads, reassembles them, and reports every gap, duplicate, and size mismatch it observes.

pub mod abort;
pub mod config;
pub mod event;
pub mod fault;
pub mod processor;
pub mod report;
pub mod session;
pub mod srv_conn;
pub mod tftp;

pub use abort::AbortHandle;
pub use fault::Variant;
pub use report::{IntegrityReport, Verdict};
pub use session::{spawn_transfer, SessionError, Transfer, TransferHandle, TransferReport};
pub use srv_conn::Server;
