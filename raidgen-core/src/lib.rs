// vim: tw=80
//! RAID request decomposition
//!
//! Splits block operations on a raid group into sub-operations (SIOTSs), each
//! of which touches at most one parity stripe and runs a single algorithm,
//! and drives them to completion against the member drives.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I suppose I should probably fix this some day, but I just don't like the look
// of e.g. "Siots" as opposed to "SIOTS".
#![allow(clippy::upper_case_acronyms)]

pub mod block_op;
pub mod config;
pub mod degraded;
pub mod generate;
pub mod geometry;
pub mod iots;
pub mod memory;
pub mod raid_group;
pub mod siots;
pub mod state;
pub mod transport;
pub mod types;
pub mod util;
pub mod write_log;

pub use crate::types::*;
pub use crate::util::*;
