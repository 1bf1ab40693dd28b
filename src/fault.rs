// Fault injection for the sending session.
//
// Each variant breaks exactly one rule of the protocol so the receiver's handling of that case can
// be observed. The send loop in `session` is shared by all of them and consults a `FaultPolicy` at
// each decision point: the order blocks go out in, whether a block is skipped, how many times it is
// sent, which number it carries, whether to stall before it, and whether to stop early.
//
// Apart from `Normal`, every policy is tolerant: a missing or unexpected ACK is logged and the loop
// moves on after a bounded wait instead of failing the transfer.

use crate::config::ClientConfig;
use crate::session::Block;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Variant {
    Normal,
    OutOfOrder,
    Duplicate,
    WrongBlockNumbers,
    Truncated,
    Timeout,
    PacketLoss,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Variant::Normal => "normal",
            Variant::OutOfOrder => "out-of-order",
            Variant::Duplicate => "duplicate",
            Variant::WrongBlockNumbers => "wrong-block-numbers",
            Variant::Truncated => "truncated",
            Variant::Timeout => "timeout",
            Variant::PacketLoss => "packet-loss",
        };
        f.write_str(name)
    }
}

impl Variant {
    pub fn policy(&self, config: &ClientConfig) -> Box<dyn FaultPolicy> {
        match self {
            Variant::Normal => Box::new(Strict),
            Variant::OutOfOrder => Box::new(OutOfOrder),
            Variant::Duplicate => Box::new(Duplicate { every: config.duplicate_every }),
            Variant::WrongBlockNumbers => Box::new(WrongBlockNumbers {
                every: config.corrupt_every,
                offset: config.corrupt_offset,
            }),
            Variant::Truncated => Box::new(Truncated { ratio: config.truncate_ratio }),
            Variant::Timeout => Box::new(Timeout {
                before_block: config.timeout_before_block,
                pause: config.timeout_pause(),
            }),
            Variant::PacketLoss => {
                let rng = match config.loss_seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                Box::new(PacketLoss::new(config.loss_probability, rng))
            }
        }
    }
}

/// Decision points of the send loop. The defaults describe a well-behaved sender.
pub trait FaultPolicy: Send + Sync {
    fn variant(&self) -> Variant;

    /// Whether ACK trouble is logged and waited out rather than failing the transfer.
    fn tolerant(&self) -> bool {
        true
    }

    /// Order in which the blocks are put on the wire.
    fn reorder<'a>(&mut self, blocks: Vec<Block<'a>>) -> Vec<Block<'a>> {
        blocks
    }

    /// Skip this block entirely; no ACK is awaited for it.
    fn should_drop(&mut self, _block: &Block) -> bool {
        false
    }

    /// Number to put on the wire instead of the block's own.
    fn corrupt_number(&self, _block: &Block) -> Option<u16> {
        None
    }

    /// How many times the block is sent back to back.
    fn copies(&self, _block: &Block) -> usize {
        1
    }

    /// Idle time before the block is sent.
    fn pause_before(&self, _block: &Block) -> Option<Duration> {
        None
    }

    /// End the transfer before this block, given the payload bytes already sent.
    fn stop_before(&self, _block: &Block, _bytes_sent: u64, _total: u64) -> bool {
        false
    }
}

/// The correct protocol: strict stop-and-wait, mismatched ACKs are fatal.
pub struct Strict;

impl FaultPolicy for Strict {
    fn variant(&self) -> Variant {
        Variant::Normal
    }

    fn tolerant(&self) -> bool {
        false
    }
}

/// Swaps the third and fourth block of every complete group of four. Numbers stay truthful.
pub struct OutOfOrder;

impl FaultPolicy for OutOfOrder {
    fn variant(&self) -> Variant {
        Variant::OutOfOrder
    }

    fn reorder<'a>(&mut self, mut blocks: Vec<Block<'a>>) -> Vec<Block<'a>> {
        for group in blocks.chunks_exact_mut(4) {
            group.swap(2, 3);
        }
        blocks
    }
}

/// Sends every `every`th block twice.
pub struct Duplicate {
    pub every: u64,
}

impl FaultPolicy for Duplicate {
    fn variant(&self) -> Variant {
        Variant::Duplicate
    }

    fn copies(&self, block: &Block) -> usize {
        if self.every > 0 && block.index % self.every == 0 {
            2
        } else {
            1
        }
    }
}

/// Adds `offset` to the number of every `every`th block.
pub struct WrongBlockNumbers {
    pub every: u64,
    pub offset: u16,
}

impl FaultPolicy for WrongBlockNumbers {
    fn variant(&self) -> Variant {
        Variant::WrongBlockNumbers
    }

    fn corrupt_number(&self, block: &Block) -> Option<u16> {
        if self.every > 0 && block.index % self.every == 0 {
            Some(block.number().wrapping_add(self.offset))
        } else {
            None
        }
    }
}

/// Stops once the next block would take the byte count past `ratio` of the payload. The
/// terminal block is never sent.
pub struct Truncated {
    pub ratio: f64,
}

impl Truncated {
    pub fn limit(&self, total: u64) -> u64 {
        (total as f64 * self.ratio).floor() as u64
    }
}

impl FaultPolicy for Truncated {
    fn variant(&self) -> Variant {
        Variant::Truncated
    }

    fn stop_before(&self, block: &Block, bytes_sent: u64, total: u64) -> bool {
        block.is_terminal() || bytes_sent + block.data.len() as u64 > self.limit(total)
    }
}

/// Goes quiet for `pause` right before block `before_block`.
pub struct Timeout {
    pub before_block: u64,
    pub pause: Duration,
}

impl FaultPolicy for Timeout {
    fn variant(&self) -> Variant {
        Variant::Timeout
    }

    fn pause_before(&self, block: &Block) -> Option<Duration> {
        (block.index == self.before_block).then_some(self.pause)
    }
}

/// Skips each block with the given probability.
pub struct PacketLoss {
    probability: f64,
    rng: StdRng,
}

impl PacketLoss {
    pub fn new(probability: f64, rng: StdRng) -> PacketLoss {
        PacketLoss { probability: probability.clamp(0.0, 1.0), rng }
    }
}

impl FaultPolicy for PacketLoss {
    fn variant(&self) -> Variant {
        Variant::PacketLoss
    }

    fn should_drop(&mut self, _block: &Block) -> bool {
        self.rng.gen::<f64>() < self.probability
    }
}
