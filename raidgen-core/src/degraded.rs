// vim: tw=80
//! Tracking of degraded members and of the regions that need rebuild

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use fixedbitset::FixedBitSet;
use itertools::Itertools;
#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// A "needs rebuild" extent: a region of one member, in member address space,
/// that is either clean (consistent with its peers) or dirty.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NrExtent {
    pub lba: LbaT,
    pub blocks: BlockCount,
    pub dirty: bool,
}

impl NrExtent {
    pub fn new(lba: LbaT, blocks: BlockCount, dirty: bool) -> Self {
        NrExtent{lba, blocks, dirty}
    }

    pub fn end(&self) -> LbaT {
        self.lba + self.blocks
    }

    /// Does this extent wholly contain `[lba, lba + blocks)`?
    pub fn contains(&self, lba: LbaT, blocks: BlockCount) -> bool {
        lba >= self.lba && lba + blocks <= self.end()
    }
}

/// Source of truth about which members are degraded, and where.
#[cfg_attr(test, automock)]
pub trait DegradedTracker: Send + Sync {
    /// Is the member degraded without any record of which regions need
    /// rebuild?  If so, every access to it must treat it as dead.
    fn is_rebuild_logging(&self, position: Position) -> bool;

    /// Are NR extents available for the member?
    fn rebuild_logs_available(&self, position: Position) -> bool;

    /// Describe the range `[lba, lba + blocks)` of a member as a list of
    /// clean and dirty extents.
    ///
    /// The result is sorted, covers the whole range without gaps, and starts a
    /// new extent at every clean/dirty transition.
    fn get_nr_extent(&self, position: Position, lba: LbaT, blocks: BlockCount)
        -> Vec<NrExtent>;
}

#[derive(Debug, Default)]
struct MemberState {
    rebuild_logging: bool,
    /// Dirty ranges as `start => end`.  `None` if no logs are available.
    dirty: Option<BTreeMap<LbaT, LbaT>>,
}

impl MemberState {
    fn mark(&mut self, lba: LbaT, blocks: BlockCount, dirty: bool) {
        if blocks == 0 {
            return;
        }
        let map = self.dirty.get_or_insert_with(BTreeMap::new);
        let (start, end) = (lba, lba + blocks);
        // Remove every range overlapping or abutting [start, end), remembering
        // the pieces that stick out.
        let mut lo = start;
        let mut hi = end;
        let touching = map.range(..=end)
            .filter(|(_, e)| **e >= start)
            .map(|(s, e)| (*s, *e))
            .collect::<Vec<_>>();
        for (s, e) in touching {
            map.remove(&s);
            if dirty {
                lo = lo.min(s);
                hi = hi.max(e);
            } else {
                if s < start {
                    map.insert(s, start);
                }
                if e > end {
                    map.insert(end, e);
                }
            }
        }
        if dirty {
            map.insert(lo, hi);
        }
    }

    fn query(&self, lba: LbaT, blocks: BlockCount) -> Vec<NrExtent> {
        let end = lba + blocks;
        let mut out = Vec::new();
        let mut cursor = lba;
        if let Some(map) = &self.dirty {
            for (s, e) in map.range(..end).filter(|(_, e)| **e > lba) {
                let s = (*s).max(lba);
                let e = (*e).min(end);
                if s > cursor {
                    out.push(NrExtent::new(cursor, s - cursor, false));
                }
                out.push(NrExtent::new(s, e - s, true));
                cursor = e;
            }
        }
        if cursor < end {
            out.push(NrExtent::new(cursor, end - cursor, false));
        }
        out
    }
}

/// An in-memory `DegradedTracker`.
///
/// Ranges that were never marked are clean.  Readers never block one another.
#[derive(Debug, Default)]
pub struct NrExtentTable {
    members: RwLock<BTreeMap<Position, MemberState>>,
}

impl NrExtentTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_member<F, R>(&self, position: Position, f: F) -> R
        where F: FnOnce(&mut MemberState) -> R
    {
        let mut guard = self.members.write()
            .unwrap_or_else(PoisonError::into_inner);
        f(guard.entry(position).or_default())
    }

    /// The member dropped out.  Until its outage is characterized, it is
    /// entirely unavailable.
    pub fn start_rebuild_logging(&self, position: Position) {
        tracing::debug!(position, "start rebuild logging");
        self.with_member(position, |m| m.rebuild_logging = true);
    }

    /// The member returned, and `extents` describe what it missed.
    pub fn stop_rebuild_logging(&self, position: Position, extents: &[NrExtent])
    {
        tracing::debug!(position, n = extents.len(), "stop rebuild logging");
        self.with_member(position, |m| {
            m.rebuild_logging = false;
            m.dirty = Some(BTreeMap::new());
            for x in coalesce(extents.to_vec()) {
                m.mark(x.lba, x.blocks, x.dirty);
            }
        });
    }

    /// Record that a region of the member needs rebuild
    pub fn mark_dirty(&self, position: Position, lba: LbaT, blocks: BlockCount)
    {
        self.with_member(position, |m| m.mark(lba, blocks, true));
    }

    /// Record that a region of the member has been rebuilt
    pub fn mark_clean(&self, position: Position, lba: LbaT, blocks: BlockCount)
    {
        self.with_member(position, |m| m.mark(lba, blocks, false));
    }

    /// Forget everything about the member.  It is fully healthy.
    pub fn clear(&self, position: Position) {
        let mut guard = self.members.write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.remove(&position);
    }

    /// Positions that are rebuild logging or have dirty regions
    pub fn degraded_positions(&self) -> Vec<Position> {
        let guard = self.members.read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.iter()
            .filter(|(_, m)| m.rebuild_logging ||
                m.dirty.as_ref().map(|d| !d.is_empty()).unwrap_or(false))
            .map(|(p, _)| *p)
            .collect()
    }
}

impl DegradedTracker for NrExtentTable {
    fn is_rebuild_logging(&self, position: Position) -> bool {
        let guard = self.members.read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.get(&position).map(|m| m.rebuild_logging).unwrap_or(false)
    }

    fn rebuild_logs_available(&self, position: Position) -> bool {
        let guard = self.members.read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.get(&position)
            .map(|m| !m.rebuild_logging && m.dirty.is_some())
            .unwrap_or(false)
    }

    fn get_nr_extent(&self, position: Position, lba: LbaT, blocks: BlockCount)
        -> Vec<NrExtent>
    {
        let guard = self.members.read()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.get(&position) {
            Some(m) => m.query(lba, blocks),
            None => vec![NrExtent::new(lba, blocks, false)]
        }
    }
}

/// Normalize a list of NR extents: sort it and merge neighbors of the same
/// state.
fn coalesce(mut extents: Vec<NrExtent>) -> Vec<NrExtent> {
    extents.sort_by_key(|x| x.lba);
    extents.into_iter()
        .filter(|x| x.blocks > 0)
        .coalesce(|a, b| {
            if a.dirty == b.dirty && a.end() == b.lba {
                Ok(NrExtent::new(a.lba, a.blocks + b.blocks, a.dirty))
            } else {
                Err((a, b))
            }
        }).collect()
}

/// One bit per member position, set while that member is rebuild logging.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RebuildLoggingMask(FixedBitSet);

impl Default for RebuildLoggingMask {
    fn default() -> Self {
        RebuildLoggingMask(FixedBitSet::with_capacity(MAX_WIDTH))
    }
}

impl RebuildLoggingMask {
    /// Snapshot the tracker's view of positions `0..width`
    pub fn from_tracker(tracker: &dyn DegradedTracker, width: u16) -> Self {
        let mut mask = Self::default();
        for p in 0..width {
            mask.set(p, tracker.is_rebuild_logging(p));
        }
        mask
    }

    pub fn get(&self, position: Position) -> bool {
        self.0.contains(usize::from(position))
    }

    pub fn set(&mut self, position: Position, rebuild_logging: bool) {
        self.0.set(usize::from(position), rebuild_logging);
    }

    pub fn is_empty(&self) -> bool {
        self.0.count_ones(..) == 0
    }

    pub fn positions(&self) -> impl Iterator<Item=Position> + '_ {
        self.0.ones().map(|i| i as Position)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn unknown_member_is_clean() {
    let t = NrExtentTable::new();
    assert!(!t.is_rebuild_logging(2));
    assert!(!t.rebuild_logs_available(2));
    assert_eq!(t.get_nr_extent(2, 10, 20), vec![NrExtent::new(10, 20, false)]);
}

#[test]
fn rebuild_logging() {
    let t = NrExtentTable::new();
    t.start_rebuild_logging(1);
    assert!(t.is_rebuild_logging(1));
    assert!(!t.rebuild_logs_available(1));
    assert_eq!(t.degraded_positions(), vec![1]);
    t.stop_rebuild_logging(1, &[NrExtent::new(0x10, 0x10, true)]);
    assert!(!t.is_rebuild_logging(1));
    assert!(t.rebuild_logs_available(1));
}

#[test]
fn splits_at_transitions() {
    let t = NrExtentTable::new();
    t.stop_rebuild_logging(0, &[
        NrExtent::new(0, 0x10, false),
        NrExtent::new(0x10, 0x10, true),
        NrExtent::new(0x20, 0x60, false),
        NrExtent::new(0x80, 0x80, true),
    ]);
    assert_eq!(t.get_nr_extent(0, 0x8, 0x100), vec![
        NrExtent::new(0x8, 0x8, false),
        NrExtent::new(0x10, 0x10, true),
        NrExtent::new(0x20, 0x60, false),
        NrExtent::new(0x80, 0x80, true),
        NrExtent::new(0x100, 0x8, false),
    ]);
    assert_eq!(t.get_nr_extent(0, 0x90, 0x10),
        vec![NrExtent::new(0x90, 0x10, true)]);
}

#[test]
fn stop_with_unsorted_extents() {
    let t = NrExtentTable::new();
    t.stop_rebuild_logging(2, &[
        NrExtent::new(0x20, 0x10, true),
        NrExtent::new(0x10, 0x10, true),
        NrExtent::new(0, 0x10, false),
        NrExtent::new(0x30, 0, true),
    ]);
    assert_eq!(t.get_nr_extent(2, 0, 0x40), vec![
        NrExtent::new(0, 0x10, false),
        NrExtent::new(0x10, 0x20, true),
        NrExtent::new(0x30, 0x10, false),
    ]);
}

#[test]
fn contains() {
    let x = NrExtent::new(0x10, 0x10, true);
    assert!(x.contains(0x10, 0x10));
    assert!(x.contains(0x18, 1));
    assert!(!x.contains(0x8, 0x10));
    assert!(!x.contains(0x1f, 2));
}

#[test]
fn mark_merges_and_splits() {
    let t = NrExtentTable::new();
    t.mark_dirty(3, 0, 10);
    t.mark_dirty(3, 10, 10);
    t.mark_dirty(3, 30, 10);
    assert_eq!(t.get_nr_extent(3, 0, 40), vec![
        NrExtent::new(0, 20, true),
        NrExtent::new(20, 10, false),
        NrExtent::new(30, 10, true),
    ]);
    t.mark_clean(3, 5, 30);
    assert_eq!(t.get_nr_extent(3, 0, 40), vec![
        NrExtent::new(0, 5, true),
        NrExtent::new(5, 30, false),
        NrExtent::new(35, 5, true),
    ]);
}

#[test]
fn clear() {
    let t = NrExtentTable::new();
    t.mark_dirty(3, 0, 10);
    t.clear(3);
    assert!(!t.rebuild_logs_available(3));
    assert!(t.degraded_positions().is_empty());
}

#[test]
fn test_coalesce() {
    let v = coalesce(vec![
        NrExtent::new(10, 5, true),
        NrExtent::new(0, 10, true),
        NrExtent::new(15, 0, false),
        NrExtent::new(15, 5, false),
    ]);
    assert_eq!(v, vec![
        NrExtent::new(0, 15, true),
        NrExtent::new(15, 5, false),
    ]);
}

#[test]
fn mask() {
    let mut tracker = MockDegradedTracker::new();
    tracker.expect_is_rebuild_logging()
        .returning(|p| p == 2);
    let mut mask = RebuildLoggingMask::from_tracker(&tracker, 4);
    assert!(mask.get(2));
    assert!(!mask.get(1));
    assert_eq!(mask.positions().collect::<Vec<_>>(), vec![2]);
    mask.set(2, false);
    assert!(mask.is_empty());
}
}
// LCOV_EXCL_STOP
