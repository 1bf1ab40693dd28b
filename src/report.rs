// The receiver's account of a transfer.
//
// Built up while DATA arrives and finalized when the terminal block is seen, the peer gives up,
// or the receive timeout expires. Corruption is never silently accepted: a finalized report is
// either `Intact` or carries one of the corruption signatures in `Verdict`.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::tftp::DATA_BUFFER_SIZE;

/// A set of block indices held as disjoint, non-adjacent half-open ranges. Space grows with the
/// number of gaps, not with their width.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRanges {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl BlockRanges {
    pub fn new() -> BlockRanges {
        BlockRanges::default()
    }

    pub fn insert(&mut self, range: Range<u64>) {
        let (mut start, mut end) = (range.start, range.end);
        if start >= end {
            return;
        }
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
            }
        }
        let absorbed: Vec<u64> = self.ranges.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }

    pub fn contains(&self, index: u64) -> bool {
        self.ranges.range(..=index).next_back().is_some_and(|(_, &end)| index < end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of blocks in the set.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&start, &end)| start..end)
    }
}

impl FromIterator<u64> for BlockRanges {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> BlockRanges {
        let mut set = BlockRanges::new();
        for index in iter {
            set.insert(index..index + 1);
        }
        set
    }
}

impl fmt::Display for BlockRanges {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        for (i, range) in self.ranges().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if range.end - range.start == 1 {
                write!(f, "{}", range.start)?;
            } else {
                write!(f, "{}-{}", range.start, range.end - 1)?;
            }
        }
        Ok(())
    }
}

/// Why reception stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Ending {
    InProgress,
    TerminalBlock,
    TimedOut,
    PeerError(String),
    WriteFailed(String),
    /// The socket failed underneath the transfer.
    Transport(String),
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Intact,
    /// Byte count disagrees with the negotiated size.
    SizeMismatch { expected: u64, received: u64 },
    /// Byte count matches (or no size was negotiated) but blocks are missing.
    BlocksMissing,
    /// No size was negotiated, nothing is visibly missing, but the terminal block never came.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub filename: String,
    pub expected_size: Option<u64>,
    pub received_size: u64,
    /// Absolute indices of accepted blocks, in arrival order.
    pub received_blocks: Vec<u64>,
    pub missing_blocks: BlockRanges,
    pub duplicate_or_reordered_events: u64,
    pub ending: Ending,
}

impl IntegrityReport {
    pub fn new(filename: impl Into<String>, expected_size: Option<u64>) -> IntegrityReport {
        IntegrityReport {
            filename: filename.into(),
            expected_size,
            received_size: 0,
            received_blocks: Vec::new(),
            missing_blocks: BlockRanges::new(),
            duplicate_or_reordered_events: 0,
            ending: Ending::InProgress,
        }
    }

    pub fn record_block(&mut self, index: u64, len: usize) {
        self.received_blocks.push(index);
        self.received_size += len as u64;
    }

    /// Marks `[from, to)` as skipped over.
    pub fn record_gap(&mut self, from: u64, to: u64) {
        self.missing_blocks.insert(from..to);
    }

    pub fn record_noise(&mut self) {
        self.duplicate_or_reordered_events += 1;
    }

    /// Number of blocks a payload of the negotiated size takes, terminal block included.
    pub fn expected_blocks(&self) -> Option<u64> {
        self.expected_size.map(|size| size / DATA_BUFFER_SIZE as u64 + 1)
    }

    /// Closes the report. When reception ended early and the size is known, every block from
    /// `next_block` up to the last expected one is counted as missing too.
    pub fn finalize(&mut self, ending: Ending, next_block: u64) {
        if ending != Ending::TerminalBlock {
            if let Some(last) = self.expected_blocks() {
                self.missing_blocks.insert(next_block..last.saturating_add(1));
            }
        }
        self.ending = ending;
    }

    pub fn verdict(&self) -> Verdict {
        match self.expected_size {
            Some(expected) if expected != self.received_size => {
                return Verdict::SizeMismatch { expected, received: self.received_size };
            }
            _ => {}
        }
        if !self.missing_blocks.is_empty() {
            Verdict::BlocksMissing
        } else if self.ending != Ending::TerminalBlock {
            Verdict::Incomplete
        } else {
            Verdict::Intact
        }
    }

    pub fn is_corrupt(&self) -> bool {
        self.verdict() != Verdict::Intact
    }

    /// Writes the report to the log: one line when intact, a warning block otherwise.
    pub fn log(&self) {
        if !self.is_corrupt() {
            log::info!(
                "Received '{}' intact: {} bytes in {} blocks",
                self.filename,
                self.received_size,
                self.received_blocks.len()
            );
            return;
        }

        log::warn!("==== FILE CORRUPTION DETECTED: '{}' ====", self.filename);
        for line in self.to_string().lines() {
            log::warn!("  {line}");
        }
    }
}

impl fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let verdict = match self.verdict() {
            Verdict::Intact => "intact".to_string(),
            Verdict::SizeMismatch { expected, received } => {
                format!("size mismatch: expected {expected} bytes, received {received}")
            }
            Verdict::BlocksMissing => "size matches but blocks are missing".to_string(),
            Verdict::Incomplete => "terminal block never arrived".to_string(),
        };
        writeln!(f, "verdict: {verdict}")?;
        writeln!(f, "ending: {:?}", self.ending)?;
        match self.expected_size {
            Some(size) => writeln!(f, "expected size: {size}")?,
            None => writeln!(f, "expected size: unknown")?,
        }
        writeln!(f, "received size: {}", self.received_size)?;
        writeln!(f, "received blocks: {}", self.received_blocks.len())?;
        writeln!(f, "missing blocks: {} ({})", self.missing_blocks.len(), self.missing_blocks)?;
        write!(f, "duplicate or reordered packets: {}", self.duplicate_or_reordered_events)
    }
}
