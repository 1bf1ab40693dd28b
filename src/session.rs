// The sending side of an upload.
//
// A session performs the handshake (WRQ carrying the `size` option, answered by OACK or ACK 0) and
// then walks the payload block by block with strict stop-and-wait: one DATA packet in flight, the
// next block only goes out once the current one is acknowledged. The fault policy chosen for the
// session can bend each step of that loop; see `fault`.
//
// Sessions run on their own tokio task. The caller gets a `TransferHandle` back immediately and can
// only abort or join it. The socket belongs to the task and is closed when the task finishes.

use crate::abort::AbortHandle;
use crate::config::ClientConfig;
use crate::event::{EventSender, EventSink, TransferEvent};
use crate::fault::{FaultPolicy, Variant};
use crate::tftp::{self, FileMode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const BLOCK_SIZE: usize = tftp::DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Errors

#[derive(Debug)]
pub enum SessionError {
    Socket(SocketError),
    MalformedPacket(String),
    ProtocolViolation(String),
    AckMismatch { expected: u16, received: u16 },
    Aborted { bytes_sent: u64 },
    /// The task running the session panicked or was cancelled by the runtime.
    Worker(String),
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "{}", e),
            Self::MalformedPacket(msg) => write!(f, "Malformed reply: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::AckMismatch { expected, received } => {
                write!(f, "Expected ACK for block {expected}, peer acknowledged {received}")
            }
            Self::Aborted { bytes_sent } => write!(f, "Aborted after sending {bytes_sent} bytes"),
            Self::Worker(msg) => write!(f, "Transfer task failed: {}", msg),
        }
    }
}

impl From<SocketError> for SessionError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::MalformedPacket(msg) => SessionError::MalformedPacket(msg),
            e => SessionError::Socket(e),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Socket(SocketError::IO(e))
    }
}

///////////////////////////////////////////////////////////////
// Transfer and blocks

/// One upload: where it goes, what it is called there, and the bytes.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub peer: SocketAddr,
    pub filename: String,
    pub mode: FileMode,
    payload: Arc<[u8]>,
}

impl Transfer {
    pub fn new(peer: SocketAddr, filename: impl Into<String>, payload: Vec<u8>) -> Transfer {
        Transfer {
            peer,
            filename: filename.into(),
            mode: FileMode::Octet,
            payload: payload.into(),
        }
    }

    /// Reads `path` into memory. The remote name defaults to the file's own name.
    pub async fn from_file(peer: SocketAddr, path: &Path, filename: Option<String>) -> io::Result<Transfer> {
        let payload = tokio::fs::read(path).await?;
        let filename = match filename {
            Some(name) => name,
            None => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?,
        };
        Ok(Transfer::new(peer, filename, payload))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn total_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Full blocks plus the short terminal one, which is empty when the payload length is a
    /// multiple of the block size.
    pub fn block_count(&self) -> u64 {
        self.total_size() / BLOCK_SIZE as u64 + 1
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block<'_>> {
        let len = self.payload.len();
        (0..self.block_count()).map(move |i| {
            let start = (i as usize * BLOCK_SIZE).min(len);
            let end = (start + BLOCK_SIZE).min(len);
            Block { index: i + 1, data: &self.payload[start..end] }
        })
    }
}

/// A slice of the payload. `index` counts from 1 and never wraps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block<'a> {
    pub index: u64,
    pub data: &'a [u8],
}

impl<'a> Block<'a> {
    /// Number carried on the wire: the index modulo 65536, so 65535 is followed by 0.
    pub fn number(&self) -> u16 {
        (self.index % 65536) as u16
    }

    pub fn is_terminal(&self) -> bool {
        self.data.len() < BLOCK_SIZE
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Index of the block currently being sent.
    pub block_cursor: u64,
    pub aborted: bool,
    pub bytes_transferred: u64,
}

///////////////////////////////////////////////////////////////
// Report

/// What a session did. The variant-specific lists stay empty for variants that don't use them.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub variant: Variant,
    pub filename: String,
    pub total_size: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub acks_received: u64,
    pub missed_acks: Vec<u16>,
    pub swapped: Vec<(u64, u64)>,
    pub duplicated: Vec<u64>,
    pub corrupted: Vec<(u64, u16)>,
    pub dropped: Vec<u64>,
    pub truncated_at: Option<u64>,
    pub paused_before: Option<u64>,
}

impl TransferReport {
    fn new(variant: Variant, transfer: &Transfer) -> TransferReport {
        TransferReport {
            variant,
            filename: transfer.filename.clone(),
            total_size: transfer.total_size(),
            bytes_sent: 0,
            packets_sent: 0,
            acks_received: 0,
            missed_acks: Vec::new(),
            swapped: Vec::new(),
            duplicated: Vec::new(),
            corrupted: Vec::new(),
            dropped: Vec::new(),
            truncated_at: None,
            paused_before: None,
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {}/{} bytes of '{}', {} DATA sent, {} ACKs",
            self.variant, self.bytes_sent, self.total_size, self.filename, self.packets_sent, self.acks_received
        );
        let detail = match self.variant {
            Variant::Normal => None,
            Variant::OutOfOrder => Some(format!("swapped {:?}", self.swapped)),
            Variant::Duplicate => Some(format!("duplicated blocks {:?}", self.duplicated)),
            Variant::WrongBlockNumbers => Some(format!("renumbered (block, sent as) {:?}", self.corrupted)),
            Variant::Truncated => Some(match self.truncated_at {
                Some(at) => format!("truncated at byte {at}"),
                None => "never truncated".to_string(),
            }),
            Variant::Timeout => Some(match self.paused_before {
                Some(block) => format!("stalled before block {block}"),
                None => "never stalled".to_string(),
            }),
            Variant::PacketLoss => Some(format!("dropped {} blocks {:?}", self.dropped.len(), self.dropped)),
        };
        if let Some(detail) = detail {
            line.push_str(", ");
            line.push_str(&detail);
        }
        if !self.missed_acks.is_empty() {
            line.push_str(&format!(", no ACK for {:?}", self.missed_acks));
        }
        line
    }
}

///////////////////////////////////////////////////////////////
// Session

pub struct TransferSession {
    config: ClientConfig,
    transfer: Transfer,
    policy: Box<dyn FaultPolicy>,
    sock: TftpSocket,
    abort: AbortHandle,
    events: EventSink,
    state: SessionState,
    report: TransferReport,
}

impl TransferSession {
    /// Creates a session with its own ephemeral socket.
    pub fn bind(
        config: ClientConfig,
        transfer: Transfer,
        variant: Variant,
        abort: AbortHandle,
        events: EventSink,
    ) -> Result<TransferSession, SessionError> {
        let sock = TftpSocket::bind_for(transfer.peer)?;
        let policy = variant.policy(&config);
        let report = TransferReport::new(variant, &transfer);
        Ok(TransferSession {
            config,
            transfer,
            policy,
            sock,
            abort,
            events,
            state: SessionState::default(),
            report,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Runs the upload to completion. Consumes the session, closing its socket.
    pub async fn run(mut self) -> Result<TransferReport, SessionError> {
        let result = self.drive().await;
        match &result {
            Ok(report) => self.events.emit(TransferEvent::Completed(report.summary())),
            Err(SessionError::Aborted { bytes_sent }) => {
                self.events.emit(TransferEvent::Aborted { bytes_sent: *bytes_sent })
            }
            Err(e) => self.events.emit(TransferEvent::Failed(e.to_string())),
        }
        result
    }

    async fn drive(&mut self) -> Result<TransferReport, SessionError> {
        let peer = self.handshake().await?;
        self.send_blocks(peer).await?;
        self.report.bytes_sent = self.state.bytes_transferred;
        Ok(self.report.clone())
    }

    fn check_abort(&mut self) -> Result<(), SessionError> {
        if self.abort.is_aborted() {
            self.state.aborted = true;
            return Err(SessionError::Aborted { bytes_sent: self.state.bytes_transferred });
        }
        Ok(())
    }

    /// Sends the WRQ and waits for OACK or ACK 0. Returns the address the peer answered from,
    /// which is where all DATA goes.
    async fn handshake(&mut self) -> Result<SocketAddr, SessionError> {
        self.check_abort()?;
        let size = self.transfer.total_size();
        let request = Packet::WriteReq {
            path: self.transfer.filename.clone(),
            mode: self.transfer.mode,
            options: tftp::size_options(size),
        };
        self.sock.send(&request, self.transfer.peer).await?;
        self.events.emit(TransferEvent::RequestSent { filename: self.transfer.filename.clone(), size });

        loop {
            self.check_abort()?;
            match self.sock.recv_with_timeout(self.config.poll_interval()).await {
                Ok((Packet::OptionAck { options }, src)) => {
                    self.events.emit(TransferEvent::OptionsAcknowledged(options));
                    return Ok(src);
                }
                Ok((Packet::Ack { block: 0 }, src)) => {
                    self.events.emit(TransferEvent::RequestAcknowledged);
                    return Ok(src);
                }
                Ok((Packet::Error { code, message }, src)) => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "{src} refused the write request: {code:?} '{message}'"
                    )));
                }
                Ok((packet, src)) => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "Expected OACK or ACK 0 from {src}, got {:?}",
                        packet
                    )));
                }
                Err(SocketError::Timeout(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn send_blocks(&mut self, peer: SocketAddr) -> Result<(), SessionError> {
        let transfer = self.transfer.clone();
        let total = transfer.total_size();
        let blocks = self.policy.reorder(transfer.blocks().collect());

        for pair in blocks.windows(2) {
            if pair[0].index > pair[1].index {
                self.report.swapped.push((pair[1].index, pair[0].index));
                self.events.emit(TransferEvent::BlocksSwapped { first: pair[1].index, second: pair[0].index });
            }
        }

        for block in &blocks {
            self.state.block_cursor = block.index;
            if self.policy.stop_before(block, self.state.bytes_transferred, total) {
                self.report.truncated_at = Some(self.state.bytes_transferred);
                self.events.emit(TransferEvent::Truncated { bytes_sent: self.state.bytes_transferred, total });
                return Ok(());
            }

            if let Some(duration) = self.policy.pause_before(block) {
                self.report.paused_before = Some(block.index);
                self.events.emit(TransferEvent::Pausing { before_block: block.index, duration });
                self.pause(duration).await?;
            }

            if self.policy.should_drop(block) {
                self.check_abort()?;
                self.report.dropped.push(block.index);
                self.events.emit(TransferEvent::BlockDropped { block: block.index });
                continue;
            }

            let wire = match self.policy.corrupt_number(block) {
                Some(number) => {
                    self.report.corrupted.push((block.index, number));
                    number
                }
                None => block.number(),
            };

            let copies = self.policy.copies(block);
            if copies > 1 {
                self.report.duplicated.push(block.index);
            }
            for copy in 0..copies {
                self.send_data(peer, block, wire).await?;
                if copy == 0 {
                    self.state.bytes_transferred += block.data.len() as u64;
                }
                self.await_ack(peer, wire).await?;
            }
        }
        Ok(())
    }

    async fn pause(&mut self, duration: std::time::Duration) -> Result<(), SessionError> {
        let abort = self.abort.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = abort.aborted() => {
                self.state.aborted = true;
                Err(SessionError::Aborted { bytes_sent: self.state.bytes_transferred })
            }
        }
    }

    async fn send_data(&mut self, peer: SocketAddr, block: &Block<'_>, wire: u16) -> Result<(), SessionError> {
        self.check_abort()?;
        let packet = Packet::Data { block: wire, data: block.data.to_vec() };
        self.sock.send(&packet, peer).await?;
        self.report.packets_sent += 1;
        self.events.emit(TransferEvent::DataSent { block: block.index, wire, len: block.data.len() });
        Ok(())
    }

    /// Waits for the ACK of `expected`. Strict sessions wait indefinitely and fail on anything
    /// else; tolerant ones give up after the fault ACK timeout and report whether it arrived.
    async fn await_ack(&mut self, peer: SocketAddr, expected: u16) -> Result<bool, SessionError> {
        let tolerant = self.policy.tolerant();
        let poll = self.config.poll_interval();
        let deadline = tolerant.then(|| Instant::now() + self.config.fault_ack_timeout());

        loop {
            self.check_abort()?;
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.report.missed_acks.push(expected);
                        self.events.emit(TransferEvent::AckMissing { block: expected });
                        return Ok(false);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };

            match self.sock.recv_with_timeout(wait).await {
                Ok((packet, src)) if src != peer => {
                    self.events.emit(TransferEvent::Ignored(format!("{:?} from unknown peer {src}", packet.opcode())));
                }
                Ok((Packet::Ack { block }, _)) if block == expected => {
                    self.report.acks_received += 1;
                    self.events.emit(TransferEvent::AckReceived { block });
                    return Ok(true);
                }
                Ok((Packet::Ack { block }, _)) => {
                    if !tolerant {
                        return Err(SessionError::AckMismatch { expected, received: block });
                    }
                    self.events.emit(TransferEvent::UnexpectedAck { expected, received: block });
                }
                Ok((packet, _)) => {
                    if !tolerant {
                        return Err(SessionError::ProtocolViolation(format!(
                            "Expected ACK {expected}, got {:?}",
                            packet
                        )));
                    }
                    self.events.emit(TransferEvent::Ignored(format!("{:?} while waiting for ACK {expected}", packet.opcode())));
                }
                Err(SocketError::Timeout(_)) => continue,
                Err(SocketError::MalformedPacket(msg)) if tolerant => {
                    self.events.emit(TransferEvent::Ignored(format!("malformed reply: {msg}")));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

///////////////////////////////////////////////////////////////
// Worker

/// The control side's view of a running transfer.
pub struct TransferHandle {
    abort: AbortHandle,
    worker: JoinHandle<Result<TransferReport, SessionError>>,
}

impl TransferHandle {
    /// Asks the session to stop. It notices before its next send or receive attempt.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub async fn join(self) -> Result<TransferReport, SessionError> {
        match self.worker.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Transfer task ended abnormally: {e}");
                Err(SessionError::Worker(e.to_string()))
            }
        }
    }
}

/// Starts `transfer` on its own task and returns without waiting for it.
pub fn spawn_transfer(
    config: ClientConfig,
    transfer: Transfer,
    variant: Variant,
    events: Option<EventSender>,
) -> TransferHandle {
    let abort = AbortHandle::new();
    let worker = {
        let abort = abort.clone();
        tokio::spawn(async move {
            let sink = EventSink::new(events);
            log::info!(
                "Sending '{}' ({} bytes) to {} using the {} variant",
                transfer.filename,
                transfer.total_size(),
                transfer.peer,
                variant
            );
            match TransferSession::bind(config, transfer, variant, abort, sink.clone()) {
                Ok(session) => session.run().await,
                Err(e) => {
                    sink.emit(TransferEvent::Failed(e.to_string()));
                    Err(e)
                }
            }
        })
    };
    TransferHandle { abort, worker }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn test_config() -> ClientConfig {
        ClientConfig {
            poll_interval_ms: 10,
            fault_ack_timeout_ms: 100,
            ..ClientConfig::default()
        }
    }

    async fn fake_peer() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    async fn recv(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0; 1024];
        let (n, src) = timeout(Duration::from_secs(2), sock.recv_from(&mut buf)).await.unwrap().unwrap();
        (Packet::parse_from_buf(&buf[..n]).unwrap(), src)
    }

    async fn reply(sock: &UdpSocket, packet: Packet, dst: SocketAddr) {
        sock.send_to(&packet.to_bytes(), dst).await.unwrap();
    }

    fn lengths(len: usize) -> Vec<usize> {
        let t = Transfer::new(([127, 0, 0, 1], 69).into(), "f", vec![0x41; len]);
        t.blocks().map(|b| b.data.len()).collect()
    }

    #[test]
    fn test_block_chunking() {
        assert_eq!(lengths(0), vec![0]);
        assert_eq!(lengths(100), vec![100]);
        assert_eq!(lengths(512), vec![512, 0]);
        assert_eq!(lengths(1000), vec![512, 488]);
        assert_eq!(lengths(1024), vec![512, 512, 0]);
        assert_eq!(lengths(1025), vec![512, 512, 1]);
    }

    #[test]
    fn test_blocks_are_numbered_from_one_and_cover_payload() {
        let payload: Vec<u8> = (0..1300u32).map(|i| i as u8).collect();
        let t = Transfer::new(([127, 0, 0, 1], 69).into(), "f", payload.clone());
        let blocks: Vec<Block> = t.blocks().collect();
        assert_eq!(blocks.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(blocks[2].is_terminal());
        assert!(!blocks[1].is_terminal());
        assert_eq!(blocks.iter().flat_map(|b| b.data.iter().copied()).collect::<Vec<_>>(), payload);
        assert_eq!(t.payload(), &payload[..]);
    }

    #[tokio::test]
    async fn test_transfer_from_file_names_it_after_the_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("fw.img");
        std::fs::write(&path, b"firmware").unwrap();
        let peer: SocketAddr = ([127, 0, 0, 1], 69).into();

        let t = Transfer::from_file(peer, &path, None).await.unwrap();
        assert_eq!(t.filename, "fw.img");
        assert_eq!(t.payload(), b"firmware");

        let renamed = Transfer::from_file(peer, &path, Some("other.img".to_string())).await.unwrap();
        assert_eq!(renamed.filename, "other.img");
        assert!(Transfer::from_file(peer, &tmpdir.path().join("absent"), None).await.is_err());
    }

    #[test]
    fn test_block_number_wraps_to_zero() {
        let number = |index| Block { index, data: &[] }.number();
        assert_eq!(number(1), 1);
        assert_eq!(number(65535), 65535);
        assert_eq!(number(65536), 0);
        assert_eq!(number(65537), 1);
    }

    #[tokio::test]
    async fn test_normal_upload_against_scripted_peer() {
        let (peer, addr) = fake_peer().await;
        let (tx, mut rx) = event::channel();
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "up.bin", vec![7; 600]), Variant::Normal, Some(tx));

        let (request, client) = recv(&peer).await;
        assert_eq!(
            request,
            Packet::WriteReq { path: "up.bin".to_string(), mode: FileMode::Octet, options: tftp::size_options(600) }
        );
        reply(&peer, Packet::OptionAck { options: tftp::size_options(600) }, client).await;

        assert_eq!(recv(&peer).await.0, Packet::Data { block: 1, data: vec![7; 512] });
        reply(&peer, Packet::Ack { block: 1 }, client).await;
        assert_eq!(recv(&peer).await.0, Packet::Data { block: 2, data: vec![7; 88] });
        reply(&peer, Packet::Ack { block: 2 }, client).await;

        let report = assert_ok!(handle.join().await);
        assert_eq!(report.bytes_sent, 600);
        assert_eq!(report.packets_sent, 2);
        assert_eq!(report.acks_received, 2);
        assert!(report.missed_acks.is_empty());

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            lines.push(event);
        }
        assert_eq!(lines.first(), Some(&TransferEvent::RequestSent { filename: "up.bin".to_string(), size: 600 }));
        assert!(lines.contains(&TransferEvent::AckReceived { block: 2 }));
        assert!(matches!(lines.last(), Some(TransferEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_bare_ack_zero_accepted_as_handshake() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![]), Variant::Normal, None);

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 0 }, client).await;
        assert_eq!(recv(&peer).await.0, Packet::Data { block: 1, data: vec![] });
        reply(&peer, Packet::Ack { block: 1 }, client).await;

        let report = assert_ok!(handle.join().await);
        assert_eq!(report.bytes_sent, 0);
        assert_eq!(report.packets_sent, 1);
    }

    #[tokio::test]
    async fn test_ack_mismatch_aborts_normal_transfer() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 1500]), Variant::Normal, None);

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 0 }, client).await;
        let _ = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 7 }, client).await;

        match handle.join().await {
            Err(SessionError::AckMismatch { expected, received }) => {
                assert_eq!(expected, 1);
                assert_eq!(received, 7);
            }
            other => panic!("Expected an ACK mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_reply_to_request_is_protocol_violation() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 10]), Variant::Normal, None);

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Data { block: 1, data: vec![1] }, client).await;

        assert!(matches!(handle.join().await, Err(SessionError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_malformed_reply_to_request_fails() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 10]), Variant::Normal, None);

        let (_, client) = recv(&peer).await;
        peer.send_to(&[0x00], client).await.unwrap();

        assert!(matches!(handle.join().await, Err(SessionError::MalformedPacket(_))));
    }

    #[tokio::test]
    async fn test_abort_while_waiting_for_handshake() {
        let (peer, addr) = fake_peer().await;
        let (tx, mut rx) = event::channel();
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 10]), Variant::Normal, Some(tx));

        let _ = recv(&peer).await;
        assert!(!handle.is_finished());
        handle.abort();

        match timeout(Duration::from_secs(2), handle.join()).await.unwrap() {
            Err(SessionError::Aborted { bytes_sent }) => assert_eq!(bytes_sent, 0),
            other => panic!("Expected an abort, got {:?}", other),
        }

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(TransferEvent::Aborted { bytes_sent: 0 }));
    }

    #[tokio::test]
    async fn test_abort_reports_bytes_sent_so_far() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 2000]), Variant::Normal, None);

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 0 }, client).await;
        let _ = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 1 }, client).await;
        let _ = recv(&peer).await;
        // Block 2 is never acknowledged; only an abort gets the sender out.
        handle.abort();

        match timeout(Duration::from_secs(2), handle.join()).await.unwrap() {
            Err(SessionError::Aborted { bytes_sent }) => assert_eq!(bytes_sent, 1024),
            other => panic!("Expected an abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tolerant_variant_logs_missing_ack_and_moves_on() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 600]), Variant::Duplicate, None);

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 0 }, client).await;
        // Never acknowledge anything; the variant must still walk through both blocks.
        assert_eq!(recv(&peer).await.0, Packet::Data { block: 1, data: vec![1; 512] });
        reply(&peer, Packet::Ack { block: 9 }, client).await;
        assert_eq!(recv(&peer).await.0, Packet::Data { block: 2, data: vec![1; 88] });

        let report = assert_ok!(handle.join().await);
        assert_eq!(report.missed_acks, vec![1, 2]);
        assert_eq!(report.bytes_sent, 600);
    }

    #[tokio::test]
    async fn test_non_ack_reply_to_data_is_protocol_violation() {
        let (peer, addr) = fake_peer().await;
        let handle = spawn_transfer(test_config(), Transfer::new(addr, "a", vec![1; 1500]), Variant::Normal, None);

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 0 }, client).await;
        assert_eq!(recv(&peer).await.0, Packet::Data { block: 1, data: vec![1; 512] });
        reply(&peer, Packet::Error { code: tftp::ErrorCode::DiskFull, message: "full".to_string() }, client).await;

        match handle.join().await {
            Err(SessionError::ProtocolViolation(msg)) => assert!(msg.contains("Expected ACK 1")),
            other => panic!("Expected a protocol violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_interrupts_pause() {
        let (peer, addr) = fake_peer().await;
        let config = ClientConfig { timeout_before_block: 2, ..test_config() };
        let (tx, mut rx) = event::channel();
        let handle = spawn_transfer(config, Transfer::new(addr, "a", vec![1; 1500]), Variant::Timeout, Some(tx));

        let (_, client) = recv(&peer).await;
        reply(&peer, Packet::Ack { block: 0 }, client).await;
        assert_eq!(recv(&peer).await.0, Packet::Data { block: 1, data: vec![1; 512] });
        reply(&peer, Packet::Ack { block: 1 }, client).await;

        loop {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(TransferEvent::Pausing { before_block, duration }) => {
                    assert_eq!(before_block, 2);
                    assert_eq!(duration, Duration::from_secs(10));
                    break;
                }
                Some(_) => continue,
                None => panic!("Session ended without pausing"),
            }
        }

        let started = Instant::now();
        handle.abort();
        match timeout(Duration::from_secs(2), handle.join()).await.unwrap() {
            Err(SessionError::Aborted { bytes_sent }) => assert_eq!(bytes_sent, 512),
            other => panic!("Expected an abort, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_session_state_follows_the_send_loop() {
        let (peer, addr) = fake_peer().await;
        let abort = AbortHandle::new();
        let mut session = TransferSession::bind(
            test_config(),
            Transfer::new(addr, "a", vec![1; 2000]),
            Variant::Normal,
            abort.clone(),
            EventSink::default(),
        )
        .unwrap();
        assert_eq!(session.state(), &SessionState::default());

        let script = tokio::spawn(async move {
            let (_, client) = recv(&peer).await;
            reply(&peer, Packet::Ack { block: 0 }, client).await;
            let _ = recv(&peer).await;
            reply(&peer, Packet::Ack { block: 1 }, client).await;
            let _ = recv(&peer).await;
            abort.abort();
        });

        let result = timeout(Duration::from_secs(2), session.drive()).await.unwrap();
        assert!(matches!(result, Err(SessionError::Aborted { bytes_sent: 1024 })));
        script.await.unwrap();
        assert_eq!(
            session.state(),
            &SessionState { block_cursor: 2, aborted: true, bytes_transferred: 1024 }
        );
    }
}
