// vim: tw=80
//! Write log for degraded parity writes
//!
//! A torn write to a degraded parity stripe can't be repaired from parity, so
//! such a write first journals its data into a slot of the write log, with a
//! header that says where the data belongs.  Only then does it write the live
//! stripe.  If the live write never finishes, a flush replays the slot.
//!
//! The log follows the user area on every member.  Each slot is one header
//! block followed by room for one parity stripe of data.  The engine owns no
//! on-disk format, so the log keeps in memory the header copy that each member
//! was sent.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{
    block_op::Opcode,
    geometry::{FruExtent, RaidGeometry},
    siots::{Algorithm, Siots},
    types::*,
};

/// Indexes a slot of the write log
pub type SlotId = u32;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum SlotState {
    #[default]
    Free,
    /// Claimed by a write
    Allocated,
    /// May hold journaled data that never reached the live stripe
    NeedsFlush,
    /// Claimed by a flush
    Flushing,
}

/// The header journaled along with a slot's data
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SlotHeader {
    /// Orders the headers written to one slot over time
    pub generation: u64,
    pub valid: bool,
    pub parity_start: LbaT,
    pub parity_count: BlockCount,
    /// Bit `p` is set if position `p` was journaled
    pub write_bitmap: u16,
    /// Where the journaled data belongs on the live stripe
    pub extents: Vec<FruExtent>,
}

impl SlotHeader {
    fn names(&self, position: Position) -> bool {
        self.write_bitmap & (1 << position) != 0
    }
}

/// What the header copies read back from a slot's members say about it
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeaderVerdict {
    /// There is nothing to replay
    Empty,
    /// Replay the slot as described
    Flush(SlotHeader),
}

/// Pick a slot's header from the copies read back from its members.
///
/// Only the newest generation counts, valid or not.  Every valid copy of it
/// must be identical, and must come from a member that its write bitmap
/// names.  Otherwise the slot can't be trusted.
pub fn select_header(copies: &[(Position, SlotHeader)])
    -> Result<HeaderVerdict>
{
    let newest = match copies.iter().map(|(_, h)| h.generation).max() {
        Some(g) => g,
        None => return Ok(HeaderVerdict::Empty)
    };
    let mut model: Option<&SlotHeader> = None;
    for (p, h) in copies.iter()
        .filter(|(_, h)| h.valid && h.generation == newest)
    {
        if !h.names(*p) {
            tracing::error!(position = p, write_bitmap = h.write_bitmap,
                "write log header on a member it doesn't name");
            return Err(Error::InvariantViolation);
        }
        match model {
            None => model = Some(h),
            Some(m) if m == h => (),
            Some(_) => {
                tracing::error!(position = p,
                    "write log header copies disagree");
                return Err(Error::InvariantViolation);
            }
        }
    }
    Ok(model.cloned().map_or(HeaderVerdict::Empty, HeaderVerdict::Flush))
}

/// Must a parity write journal its data before writing the live stripe?
///
/// Healthy writes never do: a torn one is repaired from parity.
pub fn required(geometry: &RaidGeometry, siots: &Siots) -> bool {
    if geometry.write_log_slots() == 0 ||
        siots.algorithm == Algorithm::R5CorruptData ||
        siots.dead_pos.is_none()
    {
        return false;
    }
    let pm = match siots.positions {
        Some(pm) => pm,
        None => return false
    };
    // The sender still holds the data of an aligned write, and can reapply it.
    let aligned = geometry.is_stripe_aligned(siots.lba) &&
        geometry.is_stripe_aligned(siots.end());
    let resendable = matches!(siots.opcode,
        Opcode::Write | Opcode::VerifyWrite | Opcode::WriteNonCached);
    if aligned && resendable {
        return false;
    }
    // With all parity gone the stripe is just striped data.
    if pm.redundant().iter().all(|p| siots.is_dead(*p)) {
        return false;
    }
    // A write that lands on one member can't be torn across members.  That
    // happens when only the dead member's data is written.
    siots.writes.iter()
        .filter(|x| !x.is_empty() && !siots.is_dead(x.position))
        .count() > 1
}

#[derive(Debug, Default)]
struct Slot {
    state: SlotState,
    /// The header copy each member was last sent
    headers: BTreeMap<Position, SlotHeader>,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    /// Writes may not claim slots
    quiesced: bool,
    generation: u64,
}

/// A raid group's write log slots
#[derive(Debug)]
pub struct WriteLog {
    start_lba: LbaT,
    slot_blocks: BlockCount,
    inner: Mutex<Inner>,
    freed: Notify,
}

impl WriteLog {
    /// The write log of a raid group, if it has one
    pub fn for_geometry(geometry: &RaidGeometry) -> Option<Arc<Self>> {
        let slots = geometry.write_log_slots();
        if slots == 0 {
            return None;
        }
        let inner = Inner {
            slots: (0..slots).map(|_| Slot::default()).collect(),
            quiesced: false,
            generation: 0,
        };
        Some(Arc::new(WriteLog {
            start_lba: geometry.write_log_slot_lba(0),
            slot_blocks: geometry.write_log_slot_blocks(),
            inner: Mutex::new(inner),
            freed: Notify::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slot_count(&self) -> u32 {
        self.lock().slots.len() as u32
    }

    /// Member address of a slot's header block
    pub fn slot_lba(&self, slot: SlotId) -> LbaT {
        self.start_lba + u64::from(slot) * self.slot_blocks
    }

    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.lock().slots.get(slot as usize).map(|s| s.state)
    }

    /// The header copy that a member holds for a slot
    pub fn header(&self, slot: SlotId, position: Position)
        -> Option<SlotHeader>
    {
        self.lock().slots.get(slot as usize)
            .and_then(|s| s.headers.get(&position))
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn set_header(&self, slot: SlotId, position: Position,
                             header: SlotHeader)
    {
        if let Some(s) = self.lock().slots.get_mut(slot as usize) {
            s.headers.insert(position, header);
        }
    }

    /// Slots waiting for a flush
    pub fn needs_flush(&self) -> usize {
        self.lock().slots.iter()
            .filter(|s| s.state == SlotState::NeedsFlush)
            .count()
    }

    /// Claim a free slot for a write.
    ///
    /// Returns `None` if every slot is busy or the log is quiesced.
    pub fn allocate(self: &Arc<Self>) -> Option<SlotClaim> {
        let mut inner = self.lock();
        if inner.quiesced {
            return None;
        }
        let slot = inner.slots.iter()
            .position(|s| s.state == SlotState::Free)?;
        inner.slots[slot].state = SlotState::Allocated;
        tracing::trace!(slot, "claimed write log slot");
        Some(SlotClaim{log: self.clone(), slot: slot as SlotId,
                       journaled: false})
    }

    /// Claim the next slot that needs a flush
    pub fn claim_flush(self: &Arc<Self>) -> Option<SlotClaim> {
        let mut inner = self.lock();
        let slot = inner.slots.iter()
            .position(|s| s.state == SlotState::NeedsFlush)?;
        inner.slots[slot].state = SlotState::Flushing;
        Some(SlotClaim{log: self.clone(), slot: slot as SlotId,
                       journaled: true})
    }

    /// Stop handing out slots to writes.  Flushes may still claim slots.
    pub fn quiesce(&self) {
        tracing::debug!("quiescing write log");
        self.lock().quiesced = true;
    }

    pub fn unquiesce(&self) {
        self.lock().quiesced = false;
        self.freed.notify_waiters();
    }

    /// Assume that every free slot may hold unflushed data, as after a
    /// restart.
    pub fn mark_all_for_flush(&self) {
        let mut inner = self.lock();
        for s in inner.slots.iter_mut()
            .filter(|s| s.state == SlotState::Free)
        {
            s.state = SlotState::NeedsFlush;
        }
    }

    /// Wait until a slot may have been freed, or `timeout` passes
    pub async fn wait_for_slot(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.freed.notified()).await;
    }

    fn release(&self, slot: SlotId, journaled: bool) {
        let mut inner = self.lock();
        let s = match inner.slots.get_mut(slot as usize) {
            Some(s) => s,
            None => {
                tracing::error!(slot, "released a nonexistent write log slot");
                return;
            }
        };
        if journaled {
            tracing::warn!(slot, "write log slot left for a flush");
            s.state = SlotState::NeedsFlush;
        } else {
            for h in s.headers.values_mut() {
                h.valid = false;
            }
            s.state = SlotState::Free;
        }
        drop(inner);
        self.freed.notify_waiters();
    }
}

/// A claimed write log slot.
///
/// Dropping the claim releases the slot.  If the slot holds committed journal
/// data that was never retired, it is left for a flush.
#[derive(Debug)]
pub struct SlotClaim {
    log: Arc<WriteLog>,
    slot: SlotId,
    journaled: bool,
}

impl SlotClaim {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Member address of the slot's header block
    pub fn lba(&self) -> LbaT {
        self.log.slot_lba(self.slot)
    }

    /// The header copy that a member holds for this slot
    pub fn header(&self, position: Position) -> Option<SlotHeader> {
        self.log.header(self.slot, position)
    }

    /// The journal writes of `extents` completed.  Record the header that
    /// each journaled member now holds.
    pub fn commit(&mut self, parity_start: LbaT, parity_count: BlockCount,
                  extents: Vec<FruExtent>)
    {
        let write_bitmap = extents.iter()
            .fold(0u16, |b, x| b | 1 << x.position);
        let mut inner = self.log.lock();
        inner.generation += 1;
        let header = SlotHeader {
            generation: inner.generation,
            valid: true,
            parity_start,
            parity_count,
            write_bitmap,
            extents,
        };
        if let Some(s) = inner.slots.get_mut(self.slot as usize) {
            for x in header.extents.iter() {
                s.headers.insert(x.position, header.clone());
            }
        }
        self.journaled = true;
    }

    /// The slot's data is on the live stripe.  Invalidate its headers and
    /// free it.
    pub fn retire(mut self) {
        tracing::trace!(slot = self.slot, "retiring write log slot");
        self.journaled = false;
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.log.release(self.slot, self.journaled);
    }
}

// LCOV_EXCL_STOP
