// vim: tw=80
//! Raid group geometry
//!
//! Translates between a raid group's logical block addresses and the
//! addresses of its member drives.  Everything in here is pure: a
//! `RaidGeometry` is validated once at creation and never changes.

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

mod layout;

pub use self::layout::{
    Identity,
    Layout,
    LayoutImpl,
    LeftSymmetric,
    PositionMap
};

/// Largest per-drive request, in blocks, that a single SG list can describe
pub const MAX_BLOCKS_PER_DRIVE: u64 = 2048;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidType {
    /// Inclusive range of supported widths
    fn width_limits(&self) -> (u16, u16) {
        match self {
            RaidType::Raid0 => (1, 16),
            RaidType::Raid1 => (2, 3),
            RaidType::Raid5 => (3, 16),
            RaidType::Raid6 => (4, 16),
            RaidType::Raid10 => (2, 16),
        }
    }

    /// Does the group protect its data with parity?
    pub fn is_parity(&self) -> bool {
        matches!(self, RaidType::Raid5 | RaidType::Raid6)
    }
}

fn default_element_size() -> u64 { 128 }
fn default_elements_per_parity_stripe() -> u64 { 1 }
fn default_block_size() -> u32 { 520 }
fn default_optimal_block_size() -> u32 { 1 }
fn default_max_blocks_per_drive() -> u64 { MAX_BLOCKS_PER_DRIVE }

/// User-supplied description of a raid group's shape
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GeometryConfig {
    pub raid_type: RaidType,
    /// Number of member drives
    pub width: u16,
    /// Usable blocks on each member drive
    pub member_capacity: u64,
    /// Blocks per stripe unit
    #[serde(default = "default_element_size")]
    pub element_size: u64,
    /// Rows that share one parity rotation
    #[serde(default = "default_elements_per_parity_stripe")]
    pub elements_per_parity_stripe: u64,
    /// Exported block size, in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Block size of the member drives, in bytes
    #[serde(default = "default_block_size")]
    pub imported_block_size: u32,
    /// Exported optimal block size, in blocks
    #[serde(default = "default_optimal_block_size")]
    pub optimal_block_size: u32,
    /// Largest request that may be sent to one member
    #[serde(default = "default_max_blocks_per_drive")]
    pub max_blocks_per_drive: u64,
    /// Slots in the write log that protects degraded parity writes.  Zero
    /// disables write logging.
    #[serde(default)]
    pub write_log_slots: u32,
}

impl GeometryConfig {
    pub fn new(raid_type: RaidType, width: u16, member_capacity: u64) -> Self {
        GeometryConfig {
            raid_type,
            width,
            member_capacity,
            element_size: default_element_size(),
            elements_per_parity_stripe: default_elements_per_parity_stripe(),
            block_size: default_block_size(),
            imported_block_size: default_block_size(),
            optimal_block_size: default_optimal_block_size(),
            max_blocks_per_drive: default_max_blocks_per_drive(),
            write_log_slots: 0,
        }
    }
}

/// The footprint of a request on one member drive.
///
/// A `blocks` of zero means the member is untouched.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FruExtent {
    pub position: Position,
    pub lba: LbaT,
    pub blocks: BlockCount,
}

impl FruExtent {
    pub fn empty(position: Position) -> Self {
        FruExtent{position, lba: 0, blocks: 0}
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// Extend this extent to also cover `[lba, lba + blocks)`
    pub fn merge(&mut self, lba: LbaT, blocks: BlockCount) {
        if blocks == 0 {
            return;
        }
        if self.is_empty() {
            self.lba = lba;
            self.blocks = blocks;
        } else {
            let end = (self.lba + self.blocks).max(lba + blocks);
            self.lba = self.lba.min(lba);
            self.blocks = end - self.lba;
        }
    }
}

/// Result of translating a logical address
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Translation {
    /// Index of the data stripe (row) containing the address
    pub stripe_index: u64,
    /// Block offset from the start of that stripe
    pub offset_within_stripe: u64,
    /// Data slot of the element containing the address
    pub element_index: u16,
    /// Block offset within that element
    pub element_offset: u64,
    /// Address on the member drive
    pub member_lba: LbaT,
    /// Member position holding the address
    pub position: Position,
    /// Index of the parity stripe containing the address
    pub parity_stripe: u64,
    /// Member-space offset of `member_lba` within its parity stripe
    pub parity_range_offset: u64,
    /// Logical blocks from the address to the end of its parity stripe,
    /// limited by the requested length.
    pub max_blocks: BlockCount,
}

/// The member-space rows touched by a logical access.
///
/// A short access that wraps from one element into the next can touch two
/// disjoint pieces of the row; `regions[1]` is then non-empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StripeRange {
    pub regions: [(LbaT, BlockCount); 2],
}

impl StripeRange {
    /// The smallest member-space range covering every region
    pub fn hull(&self) -> (LbaT, BlockCount) {
        let (s0, c0) = self.regions[0];
        let (s1, c1) = self.regions[1];
        if c1 == 0 {
            (s0, c0)
        } else {
            let start = s0.min(s1);
            let end = (s0 + c0).max(s1 + c1);
            (start, end - start)
        }
    }
}

/// A validated raid group shape
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaidGeometry {
    config: GeometryConfig,
    layout: LayoutImpl,
}

impl RaidGeometry {
    /// Validate a configuration
    pub fn new(config: GeometryConfig) -> Result<Self> {
        let (minw, maxw) = config.raid_type.width_limits();
        if config.width < minw || config.width > maxw {
            return Err(Error::ConfigurationInvalid(
                "width is out of range for the raid type"));
        }
        if config.element_size == 0 {
            return Err(Error::ConfigurationInvalid(
                "element size must be non-zero"));
        }
        if config.optimal_block_size == 0 {
            return Err(Error::ConfigurationInvalid(
                "optimal block size must be non-zero"));
        }
        if config.element_size % u64::from(config.optimal_block_size) != 0 {
            return Err(Error::ConfigurationInvalid(
                "element size must be a multiple of the optimal block size"));
        }
        if config.elements_per_parity_stripe == 0 {
            return Err(Error::ConfigurationInvalid(
                "elements per parity stripe must be non-zero"));
        }
        if config.block_size == 0 || config.imported_block_size == 0 {
            return Err(Error::ConfigurationInvalid(
                "block sizes must be non-zero"));
        }
        if config.max_blocks_per_drive < u64::from(config.optimal_block_size)
            || config.max_blocks_per_drive > MAX_BLOCKS_PER_DRIVE
        {
            return Err(Error::ConfigurationInvalid(
                "max blocks per drive is out of range"));
        }
        if config.member_capacity <
            config.element_size * config.elements_per_parity_stripe
        {
            return Err(Error::ConfigurationInvalid(
                "member capacity is smaller than one parity stripe"));
        }
        if config.write_log_slots > 0 && !config.raid_type.is_parity() {
            return Err(Error::ConfigurationInvalid(
                "only parity groups have a write log"));
        }
        let w = config.width;
        let layout = match config.raid_type {
            RaidType::Raid0 | RaidType::Raid10 =>
                LayoutImpl::from(Identity::new(w, w)),
            RaidType::Raid1 => LayoutImpl::from(Identity::new(w, 1)),
            RaidType::Raid5 => LayoutImpl::from(LeftSymmetric::new(w, 1)),
            RaidType::Raid6 => LayoutImpl::from(LeftSymmetric::new(w, 2)),
        };
        Ok(RaidGeometry{config, layout})
    }

    pub fn config(&self) -> &GeometryConfig {
        &self.config
    }

    pub fn raid_type(&self) -> RaidType {
        self.config.raid_type
    }

    pub fn width(&self) -> u16 {
        self.config.width
    }

    /// Slots per row that hold logical data
    pub fn data_disks(&self) -> u16 {
        self.layout.data_slots()
    }

    /// Parity slots per row.  Zero for striped and mirrored groups.
    pub fn parity_disks(&self) -> u16 {
        match self.config.raid_type {
            RaidType::Raid5 => 1,
            RaidType::Raid6 => 2,
            _ => 0
        }
    }

    /// Most members that may be dead while data remains accessible
    pub fn max_dead(&self) -> usize {
        match self.config.raid_type {
            RaidType::Raid0 | RaidType::Raid10 => 0,
            RaidType::Raid1 => usize::from(self.width()) - 1,
            RaidType::Raid5 => 1,
            RaidType::Raid6 => 2,
        }
    }

    pub fn element_size(&self) -> u64 {
        self.config.element_size
    }

    pub fn elements_per_parity_stripe(&self) -> u64 {
        self.config.elements_per_parity_stripe
    }

    pub fn optimal_block_size(&self) -> u64 {
        u64::from(self.config.optimal_block_size)
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    pub fn max_blocks_per_drive(&self) -> u64 {
        self.config.max_blocks_per_drive
    }

    pub fn write_log_slots(&self) -> u32 {
        self.config.write_log_slots
    }

    /// Member blocks in one write log slot: a header and a parity stripe
    pub fn write_log_slot_blocks(&self) -> u64 {
        1 + self.member_blocks_per_parity_stripe()
    }

    /// Member address of a write log slot.  The log follows the user area.
    pub fn write_log_slot_lba(&self, slot: u32) -> LbaT {
        self.config.member_capacity +
            u64::from(slot) * self.write_log_slot_blocks()
    }

    /// Logical blocks in one data stripe (row)
    pub fn blocks_per_stripe(&self) -> u64 {
        self.element_size() * u64::from(self.data_disks())
    }

    /// Logical blocks in one parity stripe
    pub fn blocks_per_parity_stripe(&self) -> u64 {
        self.blocks_per_stripe() * self.elements_per_parity_stripe()
    }

    /// Member blocks in one parity stripe
    fn member_blocks_per_parity_stripe(&self) -> u64 {
        self.element_size() * self.elements_per_parity_stripe()
    }

    /// Exported capacity in blocks
    pub fn capacity(&self) -> u64 {
        let rows = self.config.member_capacity / self.element_size();
        rows * self.blocks_per_stripe()
    }

    /// Member-space address of a logical block
    pub fn member_lba(&self, lba: LbaT) -> LbaT {
        let e = self.element_size();
        (lba / self.blocks_per_stripe()) * e + lba % e
    }

    /// The position map of the parity stripe holding logical `lba`
    pub fn positions(&self, lba: LbaT) -> PositionMap {
        self.layout.positions(lba / self.blocks_per_parity_stripe())
    }

    /// Is `lba` the first block of a data stripe?
    pub fn is_stripe_aligned(&self, lba: LbaT) -> bool {
        lba % self.blocks_per_stripe() == 0
    }

    /// Translate a logical address
    ///
    /// # Parameters
    ///
    /// - `lba`:    Logical block address
    /// - `blocks`: Length of the access, used to limit `max_blocks`
    pub fn translate(&self, lba: LbaT, blocks: BlockCount) -> Translation {
        let e = self.element_size();
        let bps = self.blocks_per_stripe();
        let stripe_index = lba / bps;
        let offset_within_stripe = lba % bps;
        let element_index = (offset_within_stripe / e) as u16;
        let element_offset = lba % e;
        let member_lba = stripe_index * e + element_offset;
        let parity_stripe = member_lba / self.member_blocks_per_parity_stripe();
        let parity_range_offset =
            member_lba % self.member_blocks_per_parity_stripe();
        let position = self.layout.positions(parity_stripe)
            .data()[usize::from(element_index)];
        let bpps = self.blocks_per_parity_stripe();
        let to_boundary = (lba / bpps + 1) * bpps - lba;
        Translation {
            stripe_index,
            offset_within_stripe,
            element_index,
            element_offset,
            member_lba,
            position,
            parity_stripe,
            parity_range_offset,
            max_blocks: to_boundary.min(blocks),
        }
    }

    /// Inverse of [`translate`](#method.translate).
    ///
    /// Returns `None` for addresses that hold parity or lie beyond the end of
    /// the group.  Every copy of a mirror maps back to the same logical block.
    pub fn logical_lba(&self, position: Position, member_lba: LbaT)
        -> Option<LbaT>
    {
        let e = self.element_size();
        let ps = member_lba / self.member_blocks_per_parity_stripe();
        let pm = self.layout.positions(ps);
        let slot = pm.slot_of(position)?;
        let lba = if self.raid_type() == RaidType::Raid1 {
            member_lba
        } else if slot < usize::from(self.data_disks()) {
            (member_lba / e) * self.blocks_per_stripe() + slot as u64 * e +
                member_lba % e
        } else {
            return None;
        };
        (lba < self.capacity()).then_some(lba)
    }

    /// Compute the member-space rows touched by a logical access.
    pub fn stripe_range(&self, lba: LbaT, blocks: BlockCount) -> StripeRange {
        let e = self.element_size();
        let stripe = self.blocks_per_stripe();
        let mut start = e * (lba / stripe);
        let mut count = e;
        let mut second = (0, 0);
        let eoff = lba % e;
        if blocks <= e - eoff {
            // Within one element
            start += eoff;
            count = blocks;
        } else if e > stripe - lba % stripe {
            // Starts in the last element of a stripe
            start += eoff;
            count -= eoff;
        } else if blocks < e {
            // Wraps into the next element of the same stripe
            second = (start + eoff, e - eoff);
            count = (blocks + lba) % e;
        }
        let mut rem = blocks - blocks.min(stripe - lba % stripe);
        count += (rem / stripe) * e;
        rem %= stripe;
        count += rem.min(e);
        StripeRange{regions: [(start, count), second]}
    }

    /// Member-space range over which parity must be computed for an access
    pub fn parity_range(&self, lba: LbaT, blocks: BlockCount)
        -> (LbaT, BlockCount)
    {
        self.stripe_range(lba, blocks).hull()
    }

    /// Compute the footprint of a logical access on each data slot.
    ///
    /// The result is in slot order.  The access must not cross a parity stripe
    /// boundary.
    pub fn data_footprint(&self, lba: LbaT, blocks: BlockCount)
        -> Vec<FruExtent>
    {
        debug_assert!(blocks > 0);
        debug_assert!(self.translate(lba, blocks).max_blocks == blocks,
            "A footprint may not cross a parity stripe");
        match self.single_fru(lba, blocks) {
            Some(fru) => {
                self.positions(lba).data().iter()
                    .map(|p| if *p == fru.position {
                        fru
                    } else {
                        FruExtent::empty(*p)
                    }).collect()
            }
            None => self.general_footprint(lba, blocks)
        }
    }

    /// Fast path for an access that lies within a single element
    fn single_fru(&self, lba: LbaT, blocks: BlockCount) -> Option<FruExtent> {
        let t = self.translate(lba, blocks);
        if t.element_offset + blocks <= self.element_size() {
            Some(FruExtent{position: t.position, lba: t.member_lba, blocks})
        } else {
            None
        }
    }

    fn general_footprint(&self, lba: LbaT, blocks: BlockCount)
        -> Vec<FruExtent>
    {
        let e = self.element_size();
        let bps = self.blocks_per_stripe();
        let end = lba + blocks;
        let first_stripe = lba / bps;
        let last = end - 1;
        let last_stripe = last / bps;
        self.positions(lba).data().iter()
            .enumerate()
            .map(|(slot, pos)| {
                let slot = slot as u64;
                // First logical block of this slot at or after lba
                let es = first_stripe * bps + slot * e;
                let first = if lba < es + e {
                    lba.max(es)
                } else {
                    es + bps
                };
                // Last logical block of this slot at or before the end
                let es1 = last_stripe * bps + slot * e;
                let final_ = if last >= es1 {
                    last.min(es1 + e - 1)
                } else if es1 >= bps {
                    es1 - bps + e - 1
                } else {
                    return FruExtent::empty(*pos);
                };
                if first > final_ || first >= end {
                    FruExtent::empty(*pos)
                } else {
                    let m0 = self.member_lba(first);
                    let m1 = self.member_lba(final_);
                    FruExtent{position: *pos, lba: m0, blocks: m1 - m0 + 1}
                }
            }).collect()
    }
}

// LCOV_EXCL_STOP
