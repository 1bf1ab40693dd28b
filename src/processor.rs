// Receiving side of a write request.
//
// The processor owns the output file and the block cursor and decides, one packet at a time, what
// the connection should do next. It never touches the socket; `srv_conn` carries out the returned
// `ResultAction`.
//
// Rules for an incoming DATA packet, with `cursor` the next block expected:
//  - block == cursor: write it, ACK it, advance.
//  - block ahead of cursor: the blocks in between are recorded as missing, the packet is written
//    and ACKed as if it were expected, and the cursor continues after it.
//  - block behind cursor: a duplicate or a late arrival. Counted, logged, not written, not ACKed,
//    cursor untouched.
// A payload shorter than a full block ends the transfer.

use crate::report::{Ending, IntegrityReport};
use crate::tftp::{self, Options, Packet};
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncWriteExt};

/// Represents an action that the caller of WriteProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should keep waiting without answering.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

/// Where a wire block number lands relative to the cursor.
#[derive(Debug, PartialEq)]
pub enum Placement {
    Expected,
    /// Absolute index of a block past the cursor.
    Ahead(u64),
    Behind,
}

/// Resolves a 16-bit wire number against the absolute cursor. Numbers up to half the sequence
/// space ahead count as ahead; everything else is behind.
pub fn place_block(cursor: u64, wire: u16) -> Placement {
    let distance = wire.wrapping_sub(cursor as u16) as i16;
    match distance {
        0 => Placement::Expected,
        d if d > 0 => Placement::Ahead(cursor + d as u64),
        _ => Placement::Behind,
    }
}

fn expected_size(options: &Options) -> Option<u64> {
    let raw = options.get(tftp::SIZE_OPTION)?;
    match raw.parse::<u64>() {
        Ok(size) => Some(size),
        Err(_) => {
            log::warn!("Ignoring unparseable size option {raw:?}");
            None
        }
    }
}

#[derive(Debug)]
pub struct WriteProcessor {
    f: File,
    cursor: u64,
    report: IntegrityReport,
    ending: Option<Ending>,
}

impl WriteProcessor {
    pub async fn new_for_writing(
        path: &Path,
        filename: &str,
        options: &Options,
        overwrite: bool,
    ) -> Result<WriteProcessor, io::Error> {
        log::info!("Writing to {:#?}", path);
        let mut open = OpenOptions::new();
        open.write(true);
        if overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        let f = open.open(path).await?;
        Ok(WriteProcessor {
            f,
            cursor: 1,
            report: IntegrityReport::new(filename, expected_size(options)),
            ending: None,
        })
    }

    /// Answer to the write request: OACK echoing the size when one was negotiated, ACK 0
    /// otherwise.
    pub fn first_packet(&self) -> ResultAction {
        match self.report.expected_size {
            Some(size) => ResultAction::SendPacketAndAwait(Packet::OptionAck { options: tftp::size_options(size) }),
            None => ResultAction::SendPacketAndAwait(Packet::Ack { block: 0 }),
        }
    }

    /// Absolute index of the next block expected.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn report(&self) -> &IntegrityReport {
        &self.report
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => self.process_data(*block, data).await,
            tftp::Packet::Error { code, message } => {
                let msg = format!("Client sent error packet: code: {:?}, message: '{}'", code, message);
                self.ending = Some(Ending::PeerError(msg.clone()));
                ResultAction::CloseConnection(Some(msg))
            }
            _ => {
                log::warn!("Ignoring {:?} packet, only Data is expected after a write request", packet.opcode());
                ResultAction::RetryRecv
            }
        }
    }

    async fn process_data(&mut self, block: u16, data: &[u8]) -> ResultAction {
        let index = match place_block(self.cursor, block) {
            Placement::Expected => self.cursor,
            Placement::Ahead(index) => {
                log::warn!(
                    "Gap detected: expected block {}, received {block}; blocks {}..{} missing",
                    self.cursor as u16,
                    self.cursor,
                    index
                );
                self.report.record_gap(self.cursor, index);
                index
            }
            Placement::Behind => {
                log::warn!(
                    "Ignoring duplicate or out-of-order block {block} while expecting {}",
                    self.cursor as u16
                );
                self.report.record_noise();
                return ResultAction::RetryRecv;
            }
        };

        if let Err(e) = write_block_to_file(&mut self.f, data).await {
            self.ending = Some(Ending::WriteFailed(e.to_string()));
            return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: e.kind().into(),
                message: format!("Error writing to file: {}", e),
            });
        }

        log::debug!("Accepted block {block} ({} bytes)", data.len());
        self.report.record_block(index, data.len());
        self.cursor = index + 1;

        let ack = tftp::Packet::Ack { block };
        if data.len() < tftp::DATA_BUFFER_SIZE {
            self.ending = Some(Ending::TerminalBlock);
            ResultAction::TerminateWithPacket(ack)
        } else {
            ResultAction::SendPacketAndAwait(ack)
        }
    }

    /// Flushes the output and closes the report. `fallback` is used when the packets seen so far
    /// did not already decide how reception ended.
    pub async fn finish(mut self, fallback: Ending) -> IntegrityReport {
        if let Err(e) = self.f.flush().await {
            log::error!("Failed to flush '{}': {e}", self.report.filename);
        }
        let ending = self.ending.take().unwrap_or(fallback);
        self.report.finalize(ending, self.cursor);
        self.report
    }
}

async fn write_block_to_file(f: &mut File, buf: &[u8]) -> Result<(), io::Error> {
    f.write_all(buf).await
}
