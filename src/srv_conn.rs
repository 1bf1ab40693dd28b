// This module contains the server side: the listener and the per-transfer request handler.
//
// The listener socket only ever sees requests. When a write request arrives, a
// ServerRequestHandler is created for it. The handler works in roughly the following stages:
//
// 1. Check whether the request can be serviced: the mode is supported, the filename stays inside
//    the output directory, and the output file can be created.
// 2. Bind a fresh socket (the transfer's TID) and answer from it: OACK echoing the size when the
//    client announced one, a bare ACK 0 otherwise.
// 3. Receive DATA until the terminal block arrives or nothing has been heard for the receive
//    timeout. Each packet is handed to the WriteProcessor, which decides whether to ACK, ignore,
//    or finish.
// 4. Finalize and log the integrity report.
//
// A single bad datagram never ends a transfer. Malformed packets, non-DATA packets, and packets
// from an address other than the client's are logged and dropped.

use crate::abort::AbortHandle;
use crate::config::ServerConfig;
use crate::processor::{ResultAction, WriteProcessor};
use crate::report::{Ending, IntegrityReport};
use crate::tftp::{self, SocketError};
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io;
use tokio::time::Instant;

/// Receiver progress through a single transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerState { Idle, AwaitingData, Receiving, TimedOut, Done }

/// Listens for write requests.
pub struct Server {
    sock: tftp::TftpSocket,
    config: ServerConfig,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Server, ServerConnectionError> {
        let sock = tftp::TftpSocket::bind(config.bind)?;
        Ok(Server { sock, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerConnectionError> {
        Ok(self.sock.local_addr()?)
    }

    /// Waits for the next write request that can be serviced. Returns `None` once `abort` is set.
    pub async fn accept(&self, abort: &AbortHandle) -> Result<Option<ServerRequestHandler>, ServerConnectionError> {
        loop {
            if abort.is_aborted() {
                return Ok(None);
            }

            match self.sock.recv_with_timeout(self.config.poll_interval()).await {
                Ok((packet @ tftp::Packet::WriteReq { .. }, src)) => {
                    log::info!("Got write request from {}: {:?}", src, packet);
                    match ServerRequestHandler::new(&self.config, &packet, src).await {
                        Ok(handler) => return Ok(Some(handler)),
                        Err(e) => log::warn!("Refused request from {}: {}", src, e),
                    }
                }
                Ok((tftp::Packet::ReadReq { path, .. }, src)) => {
                    log::warn!("Refusing read request for {:?} from {}", path, src);
                    send_error_packet(
                        &self.sock,
                        src,
                        tftp::ErrorCode::AccessViolation,
                        "read requests are not supported".to_string(),
                    )
                    .await;
                }
                Ok((packet, src)) => {
                    log::warn!("Ignoring {:?} from {} on the listening socket", packet.opcode(), src);
                }
                Err(SocketError::Timeout(_)) => continue,
                Err(SocketError::MalformedPacket(msg)) => log::warn!("Ignoring malformed request: {msg}"),
                Err(SocketError::IO(e)) => return Err(e.into()),
            }
        }
    }

    /// Accepts requests until `abort` is set, running each transfer on its own task.
    pub async fn serve(&self, abort: &AbortHandle) -> Result<(), ServerConnectionError> {
        log::info!("Listening on {}, writing into {}", self.local_addr()?, self.config.output_dir.display());
        while let Some(handler) = self.accept(abort).await? {
            let abort = abort.clone();
            tokio::spawn(async move {
                handler.handle(&abort).await;
            });
        }
        log::info!("Server stopped");
        Ok(())
    }
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive connections.
    sock: tftp::TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: WriteProcessor,

    state: ServerState,
    receive_timeout: Duration,
    poll_interval: Duration,
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

/// Maps a requested filename to a path under `root`, refusing anything that would escape it.
fn resolve_output_path(root: &Path, requested: &str) -> Result<PathBuf, ServerConnectionError> {
    let relative = Path::new(requested.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => {
                return Err(ServerConnectionError::BadRequest(format!(
                    "Filename {requested:?} points outside the output directory"
                )))
            }
        }
    }
    if depth == 0 {
        return Err(ServerConnectionError::BadRequest("Empty filename".to_string()));
    }
    Ok(path)
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        initial_request: &tftp::Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let tftp::Packet::WriteReq { path, mode, options } = initial_request else {
            return Err(ServerConnectionError::BadRequest(
                "Only write requests are valid initial requests.".to_string(),
            ));
        };

        log::info!("Binding socket");
        let sock = tftp::TftpSocket::bind((config.bind.ip(), 0).into())?;

        if *mode == tftp::FileMode::Mail {
            send_error_packet(
                &sock,
                src,
                tftp::ErrorCode::Undefined,
                "Support for mail mode is unimplemented".to_string(),
            )
            .await;
            return Err(ServerConnectionError::BadRequest(
                "Peer requested mail mode, which is unsupported".to_string(),
            ));
        }

        let out_path = match resolve_output_path(&config.output_dir, path) {
            Ok(p) => p,
            Err(e) => {
                send_error_packet(&sock, src, tftp::ErrorCode::AccessViolation, e.to_string()).await;
                return Err(e);
            }
        };

        let processor = match WriteProcessor::new_for_writing(&out_path, path, options, config.overwrite).await {
            Ok(p) => p,
            Err(e) => {
                send_error_packet(&sock, src, e.kind().into(), format!("Cannot create {}: {}", path, e)).await;
                return Err(e.into());
            }
        };

        Ok(ServerRequestHandler {
            sock,
            dst: src,
            processor,
            state: ServerState::Idle,
            receive_timeout: config.receive_timeout(),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerConnectionError> {
        Ok(self.sock.local_addr()?)
    }

    fn set_state(&mut self, state: ServerState) {
        log::debug!("Transfer with {}: {:?} -> {:?}", self.dst, self.state, state);
        self.state = state;
    }

    /// Receives the file until the transfer ends, then returns the finalized integrity report.
    /// The report is also written to the log.
    pub async fn handle(mut self, abort: &AbortHandle) -> IntegrityReport {
        let ending = self.receive(abort).await;
        let report = self.processor.finish(ending).await;
        report.log();
        report
    }

    /// Returns how reception ended, unless the processor already knows (terminal block, client
    /// error, write failure), in which case the returned value is ignored.
    async fn receive(&mut self, abort: &AbortHandle) -> Ending {
        let ResultAction::SendPacketAndAwait(first) = self.processor.first_packet() else {
            return Ending::InProgress;
        };
        if let Err(e) = self.sock.send(&first, self.dst).await {
            log::warn!("Unable to send packet: {e}");
            return Ending::Transport(e.to_string());
        }
        self.set_state(ServerState::AwaitingData);

        let mut last_data = Instant::now();
        loop {
            if abort.is_aborted() {
                return Ending::Aborted;
            }

            let idle = last_data.elapsed();
            if idle >= self.receive_timeout {
                log::warn!("No data from {} for {:?}, giving up", self.dst, idle);
                self.set_state(ServerState::TimedOut);
                return Ending::TimedOut;
            }

            match self.sock.recv_with_timeout(self.poll_interval.min(self.receive_timeout - idle)).await {
                Ok((packet, src)) => {
                    // First, check whether the data came from the src we were expecting.
                    if src != self.dst {
                        log::warn!("Ignoring {:?} from {}, this transfer belongs to {}", packet.opcode(), src, self.dst);
                        send_error_packet(
                            &self.sock,
                            src,
                            tftp::ErrorCode::UnknownTid,
                            "This connection has already been initiated with a different client.".to_string(),
                        )
                        .await;
                        continue;
                    }

                    if let tftp::Packet::Data { .. } = packet {
                        last_data = Instant::now();
                        if self.state == ServerState::AwaitingData {
                            self.set_state(ServerState::Receiving);
                        }
                    }

                    // Next, figure out how to respond.
                    match self.processor.process_packet(&packet).await {
                        ResultAction::SendPacketAndAwait(p) => {
                            if let Err(e) = self.sock.send(&p, self.dst).await {
                                log::warn!("Unable to send packet: {e}");
                                return Ending::Transport(e.to_string());
                            }
                        }
                        ResultAction::RetryRecv => continue,
                        ResultAction::CloseConnection(maybe_warn) => {
                            if let Some(msg) = maybe_warn {
                                log::warn!("{}", msg);
                            }
                            log::info!("Closing connection with {}", self.dst);
                            self.set_state(ServerState::Done);
                            return Ending::InProgress;
                        }
                        ResultAction::TerminateWithPacket(p) => {
                            let _ = self.sock.send(&p, self.dst).await;
                            log::info!("Closing connection with {}", self.dst);
                            self.set_state(ServerState::Done);
                            return Ending::InProgress;
                        }
                    }
                }
                Err(SocketError::Timeout(_)) => continue,
                Err(SocketError::MalformedPacket(msg)) => {
                    log::warn!("Ignoring malformed datagram on transfer with {}: {}", self.dst, msg);
                }
                Err(SocketError::IO(e)) => {
                    log::warn!("Socket error on transfer with {}: {}", self.dst, e);
                    return Ending::Transport(e.to_string());
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Socket(SocketError),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Socket(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<SocketError> for ServerConnectionError {
    fn from(e: SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
