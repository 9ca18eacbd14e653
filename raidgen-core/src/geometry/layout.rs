// vim: tw=80
//! Placement of data and parity elements onto member positions

use crate::types::*;

/// The member positions of one parity stripe, in slot order.
///
/// Data slots come first, in ascending logical order, followed by the
/// redundancy slots: row parity then diagonal parity for RAID6, or the
/// secondary copies for a mirror.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PositionMap {
    slots: [Position; MAX_WIDTH],
    width: u16,
    data: u16,
}

impl PositionMap {
    fn new(width: u16, data: u16) -> Self {
        PositionMap{slots: [0; MAX_WIDTH], width, data}
    }

    /// All slots: data first, then redundancy
    pub fn all(&self) -> &[Position] {
        &self.slots[..usize::from(self.width)]
    }

    pub fn data(&self) -> &[Position] {
        &self.slots[..usize::from(self.data)]
    }

    /// Parity (or mirror copy) positions
    pub fn redundant(&self) -> &[Position] {
        &self.slots[usize::from(self.data)..usize::from(self.width)]
    }

    /// Position of the row parity element, if the layout has one
    pub fn row_parity(&self) -> Option<Position> {
        self.redundant().first().copied()
    }

    /// Find the slot that `position` occupies
    pub fn slot_of(&self, position: Position) -> Option<usize> {
        self.all().iter().position(|p| *p == position)
    }

    pub fn is_data(&self, position: Position) -> bool {
        self.data().contains(&position)
    }
}

/// Layout algorithm
///
/// Given the index of a parity stripe, returns the mapping of its logical slots
/// to physical member positions.  All rows of one parity stripe share the same
/// mapping.
#[enum_dispatch::enum_dispatch]
pub trait Layout {
    /// Number of member positions
    fn width(&self) -> u16;

    /// Number of slots in each row that hold logical data
    fn data_slots(&self) -> u16;

    /// Return the slot-to-position mapping of a parity stripe
    ///
    /// # Parameters
    ///
    /// - `parity_stripe`:  Index of the parity stripe
    fn positions(&self, parity_stripe: u64) -> PositionMap;
}

/// Every slot sits on the position with the same index.  Used by striped and
/// mirrored groups.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Identity {
    width: u16,
    data: u16,
}

impl Identity {
    pub fn new(width: u16, data: u16) -> Self {
        debug_assert!(data <= width);
        Identity{width, data}
    }
}

impl Layout for Identity {
    fn width(&self) -> u16 {
        self.width
    }

    fn data_slots(&self) -> u16 {
        self.data
    }

    fn positions(&self, _parity_stripe: u64) -> PositionMap {
        let mut pm = PositionMap::new(self.width, self.data);
        for (i, s) in pm.slots.iter_mut()
            .take(usize::from(self.width))
            .enumerate()
        {
            *s = i as Position;
        }
        pm
    }
}

/// Left-symmetric parity rotation.
///
/// Parity starts on the highest positions and moves one position lower with
/// every parity stripe.  Data slots begin immediately after the last parity
/// position and wrap around.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeftSymmetric {
    width: u16,
    parity: u16,
}

impl LeftSymmetric {
    pub fn new(width: u16, parity: u16) -> Self {
        debug_assert!(parity < width);
        LeftSymmetric{width, parity}
    }
}

impl Layout for LeftSymmetric {
    fn width(&self) -> u16 {
        self.width
    }

    fn data_slots(&self) -> u16 {
        self.width - self.parity
    }

    fn positions(&self, parity_stripe: u64) -> PositionMap {
        let w = u64::from(self.width);
        let p = u64::from(self.parity);
        let r = parity_stripe % w;
        let first_parity = (2 * w - p - r) % w;
        let data = self.data_slots();
        let mut pm = PositionMap::new(self.width, data);
        for i in 0..u64::from(data) {
            pm.slots[i as usize] = ((first_parity + p + i) % w) as Position;
        }
        for j in 0..p {
            pm.slots[(u64::from(data) + j) as usize] =
                ((first_parity + j) % w) as Position;
        }
        pm
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[enum_dispatch::enum_dispatch(Layout)]
pub enum LayoutImpl {
    Identity(Identity),
    LeftSymmetric(LeftSymmetric),
}

// LCOV_EXCL_STOP
