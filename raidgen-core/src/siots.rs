// vim: tw=80
//! Sub-I/O transaction state
//!
//! A SIOTS is the unit of work one algorithm performs on behalf of an IOTS.
//! It covers a contiguous prefix of the IOTS's remaining range.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::{
    block_op::Opcode,
    geometry::PositionMap,
    memory::Pages,
    state::SiotsState,
    types::*,
    write_log::SlotClaim,
};

pub use crate::geometry::FruExtent;

/// The algorithm a SIOTS executes
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    Raid0Rd,
    Raid0Wr,
    Raid0Vr,
    MirrorRd,
    MirrorWr,
    MirrorCorruptData,
    MirrorVr,
    MirrorRb,
    R5Rd,
    /// Read of a single element
    R5SmRd,
    /// Read that reconstructs data from a dead member
    R5DegRd,
    /// Full stripe write, or a write covering most of its parity range
    R5Mr3,
    /// Read-modify-write
    #[serde(rename = "R5_468")]
    R5Rmw,
    /// Read-modify-write of a single data element
    #[serde(rename = "R5_SMALL_468")]
    R5SmallRmw,
    /// Reconstruct write
    R5Rcw,
    R5CorruptData,
    R5Vr,
    R5Rb,
    RgZero,
    RgCheckZeroed,
    /// Replay a write log slot onto the live stripe
    RgFlushJournal,
    InvalidOpcode,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Raid0Rd => "RAID0_RD",
            Algorithm::Raid0Wr => "RAID0_WR",
            Algorithm::Raid0Vr => "RAID0_VR",
            Algorithm::MirrorRd => "MIRROR_RD",
            Algorithm::MirrorWr => "MIRROR_WR",
            Algorithm::MirrorCorruptData => "MIRROR_CORRUPT_DATA",
            Algorithm::MirrorVr => "MIRROR_VR",
            Algorithm::MirrorRb => "MIRROR_RB",
            Algorithm::R5Rd => "R5_RD",
            Algorithm::R5SmRd => "R5_SM_RD",
            Algorithm::R5DegRd => "R5_DEG_RD",
            Algorithm::R5Mr3 => "R5_MR3",
            Algorithm::R5Rmw => "R5_468",
            Algorithm::R5SmallRmw => "R5_SMALL_468",
            Algorithm::R5Rcw => "R5_RCW",
            Algorithm::R5CorruptData => "R5_CORRUPT_DATA",
            Algorithm::R5Vr => "R5_VR",
            Algorithm::R5Rb => "R5_RB",
            Algorithm::RgZero => "RG_ZERO",
            Algorithm::RgCheckZeroed => "RG_CHECK_ZEROED",
            Algorithm::RgFlushJournal => "RG_FLUSH_JOURNAL",
            Algorithm::InvalidOpcode => "INVALID_OPCODE",
        }
    }

    /// Does this algorithm write to the dead members, rather than avoid them?
    pub fn is_rebuild(&self) -> bool {
        matches!(self, Algorithm::R5Rb | Algorithm::MirrorRb)
    }

    /// Can a failed read be rebuilt from parity instead of failing?
    pub fn reconstructs(&self) -> bool {
        matches!(self, Algorithm::R5Rd | Algorithm::R5SmRd)
    }

    /// Can this algorithm repair media errors found by its reads?
    pub fn repairs(&self) -> bool {
        matches!(self, Algorithm::R5Vr | Algorithm::R5Rb | Algorithm::MirrorVr |
            Algorithm::MirrorRb)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation performed by one per-drive request
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum FruOpcode {
    Read,
    Write,
    /// Write with deliberately invalid checksums
    CorruptCrc,
    Zero,
    CheckZeroed,
}

/// A request to one member drive
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FruRequest {
    pub position: Position,
    pub lba: LbaT,
    pub blocks: BlockCount,
    pub opcode: FruOpcode,
}

/// How a member drive completed a request
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FruStatus {
    Success,
    /// Unrecoverable media error at the given member LBA
    MediaError(LbaT),
    /// The drive logged out but may return shortly
    Retryable,
    /// The drive is gone
    Dead,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FruCompletion {
    pub request: FruRequest,
    pub status: FruStatus,
}

/// Part of a zero SIOTS's range on a degraded member that lies entirely in
/// one NR region.  Addresses are in member space.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegionSpan {
    pub position: Position,
    pub lba: LbaT,
    pub blocks: BlockCount,
    pub dirty: bool,
    /// The degraded position if this span must be treated as degraded
    pub dead_pos: Option<Position>,
}

/// A serializable snapshot of a SIOTS's decomposition
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SiotsPlan {
    pub lba: LbaT,
    pub xfer: BlockCount,
    pub algorithm: Algorithm,
    pub parity_start: LbaT,
    pub parity_count: BlockCount,
    pub data_disks: u16,
    pub start_pos: Position,
    pub dead_pos: Option<Position>,
    pub dead_pos_2: Option<Position>,
    pub positions: Vec<Position>,
    /// Footprint on each member, indexed by position
    pub fru_extents: Vec<FruExtent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zero_spans: Vec<RegionSpan>,
    /// Journals its data to the write log before writing the live stripe
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write_logged: bool,
}

#[derive(Debug)]
pub struct Siots {
    pub opcode: Opcode,
    pub lba: LbaT,
    pub xfer: BlockCount,
    pub algorithm: Algorithm,
    pub parity_start: LbaT,
    pub parity_count: BlockCount,
    pub data_disks: u16,
    /// Position holding the first logical block
    pub start_pos: Position,
    pub dead_pos: Option<Position>,
    pub dead_pos_2: Option<Position>,
    pub positions: Option<PositionMap>,
    /// Footprint on each member, indexed by position
    pub fru_extents: Vec<FruExtent>,
    pub zero_spans: Vec<RegionSpan>,
    /// First phase requests: reads, or a write's pre-reads
    pub reads: Vec<FruExtent>,
    /// Second phase requests
    pub writes: Vec<FruExtent>,
    pub write_logged: bool,
    pub state: SiotsState,
    pub(crate) pages: Option<Pages>,
    pub(crate) outbox: Vec<FruRequest>,
    pub(crate) outstanding: usize,
    /// Has the SIOTS sent any member request?
    pub(crate) issued: bool,
    pub(crate) completions: Vec<FruCompletion>,
    /// Requests to send again after a ride-through
    pub(crate) retry: Vec<FruRequest>,
    pub(crate) retries: u32,
    /// Positions that failed a mirror read
    pub(crate) failed_positions: Vec<Position>,
    /// Ranges that verify found bad and must rewrite
    pub(crate) repairs: Vec<FruExtent>,
    /// The write log slot held by a journaled write or a flush
    pub(crate) journal: Option<SlotClaim>,
    pub error: Option<Error>,
}

impl Siots {
    /// Create a SIOTS covering the whole remaining range.  The generate
    /// engine will shorten it and pick its algorithm.
    pub fn new(opcode: Opcode, lba: LbaT, xfer: BlockCount, width: u16)
        -> Self
    {
        Siots {
            opcode,
            lba,
            xfer,
            algorithm: Algorithm::InvalidOpcode,
            parity_start: 0,
            parity_count: 0,
            data_disks: 0,
            start_pos: 0,
            dead_pos: None,
            dead_pos_2: None,
            positions: None,
            fru_extents: (0..width).map(FruExtent::empty).collect(),
            zero_spans: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            write_logged: false,
            state: SiotsState::default(),
            pages: None,
            outbox: Vec::new(),
            outstanding: 0,
            issued: false,
            completions: Vec::new(),
            retry: Vec::new(),
            retries: 0,
            failed_positions: Vec::new(),
            repairs: Vec::new(),
            journal: None,
            error: None,
        }
    }

    /// A SIOTS that replays a write log slot.  It starts by reading the
    /// slot's header from every member.
    pub fn flush(claim: SlotClaim, width: u16) -> Self {
        let mut siots = Siots::new(Opcode::Write, 0, 0, width);
        siots.algorithm = Algorithm::RgFlushJournal;
        siots.reads = (0..width)
            .map(|position| FruExtent{position, lba: claim.lba(), blocks: 1})
            .collect();
        siots.update_footprint();
        siots.journal = Some(claim);
        siots.state = SiotsState::initial(siots.algorithm);
        siots
    }

    pub fn end(&self) -> LbaT {
        self.lba + self.xfer
    }

    /// Is `position` dead for the purposes of this SIOTS?
    pub fn is_dead(&self, position: Position) -> bool {
        self.dead_pos == Some(position) || self.dead_pos_2 == Some(position)
    }

    pub fn dead_positions(&self) -> impl Iterator<Item=Position> {
        self.dead_pos.into_iter().chain(self.dead_pos_2)
    }

    /// Recompute the per-member footprint from the planned requests
    pub fn update_footprint(&mut self) {
        for f in self.fru_extents.iter_mut() {
            *f = FruExtent::empty(f.position);
        }
        for x in self.reads.iter().chain(self.writes.iter()) {
            if let Some(f) = self.fru_extents.get_mut(usize::from(x.position)) {
                f.merge(x.lba, x.blocks);
            }
        }
    }

    pub fn footprint(&self, position: Position) -> FruExtent {
        self.fru_extents.get(usize::from(position))
            .copied()
            .unwrap_or_else(|| FruExtent::empty(position))
    }

    /// Does the SIOTS hold pages?
    pub fn has_pages(&self) -> bool {
        self.pages.is_some()
    }

    /// Release the SIOTS's pages, if any
    pub fn release(&mut self) {
        self.pages = None;
    }

    /// Take the requests that are ready to be sent to the members
    pub fn take_outbox(&mut self) -> Vec<FruRequest> {
        std::mem::take(&mut self.outbox)
    }

    /// Number of member requests issued but not yet completed
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Has any member request been sent?  A SIOTS that has issued I/O may not
    /// be abandoned.
    pub fn has_issued(&self) -> bool {
        self.issued
    }

    /// Fail the SIOTS from outside its state machine.  Executing it again
    /// releases its pages and finishes it.
    pub fn abort(&mut self, e: Error) {
        self.error = Some(e);
        self.state = SiotsState::UnexpectedError;
    }

    /// Deliver a member completion
    pub fn complete_fru(&mut self, completion: FruCompletion) {
        debug_assert!(self.outstanding > 0, "Unexpected completion");
        self.outstanding = self.outstanding.saturating_sub(1);
        self.completions.push(completion);
    }

    /// Final status of a finished SIOTS
    pub fn status(&self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(())
        }
    }

    pub fn plan(&self) -> SiotsPlan {
        SiotsPlan {
            lba: self.lba,
            xfer: self.xfer,
            algorithm: self.algorithm,
            parity_start: self.parity_start,
            parity_count: self.parity_count,
            data_disks: self.data_disks,
            start_pos: self.start_pos,
            dead_pos: self.dead_pos,
            dead_pos_2: self.dead_pos_2,
            positions: self.positions
                .map(|pm| pm.all().to_vec())
                .unwrap_or_default(),
            fru_extents: self.fru_extents.clone(),
            zero_spans: self.zero_spans.clone(),
            write_logged: self.write_logged,
        }
    }
}

// LCOV_EXCL_STOP
