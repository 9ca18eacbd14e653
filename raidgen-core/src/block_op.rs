// vim: tw=80
//! Block operations: the requests that raid groups decompose

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Operation codes understood by the raid engines.
///
/// The discriminants are the values used on the wire.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Primitive,
         Serialize)]
pub enum Opcode {
    Read            = 1,
    Write           = 2,
    WriteVerify     = 3,
    WriteNonCached  = 4,
    /// Write, then read back and compare
    VerifyWrite     = 5,
    WriteZeros      = 6,
    /// Write data with deliberately invalid checksums.  Test tooling only.
    CorruptData     = 7,
    Zero            = 8,
    UnmarkZero      = 9,
    CheckZeroed     = 10,
    Verify          = 11,
    ReadOnlyVerify  = 12,
    ErrorVerify     = 13,
    Rebuild         = 14,
    Invalid         = 0xffff,
}

impl Opcode {
    /// Decode a wire value.  Unknown values become `Opcode::Invalid`.
    pub fn from_wire(v: u32) -> Self {
        Opcode::from_u32(v).unwrap_or(Opcode::Invalid)
    }

    pub fn is_read(&self) -> bool {
        *self == Opcode::Read
    }

    /// Does the opcode modify data on the members?
    pub fn is_write(&self) -> bool {
        matches!(self,
            Opcode::Write | Opcode::WriteVerify | Opcode::WriteNonCached |
            Opcode::VerifyWrite | Opcode::WriteZeros | Opcode::CorruptData)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Opcode::Zero | Opcode::UnmarkZero)
    }

    pub fn is_verify(&self) -> bool {
        matches!(self,
            Opcode::Verify | Opcode::ReadOnlyVerify | Opcode::ErrorVerify)
    }
}

/// The portion of a partial-stripe write that the caller already pre-read
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PreRead {
    pub lba: LbaT,
    pub blocks: BlockCount,
}

/// An immutable request against a raid group's exported address space
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockOperation {
    pub opcode: Opcode,
    pub lba: LbaT,
    pub blocks: BlockCount,
    /// Exported block size in bytes
    pub block_size: u32,
    /// Exported optimal block size, in blocks
    pub optimal_block_size: u32,
    #[serde(default)]
    pub pre_read: Option<PreRead>,
}

impl BlockOperation {
    pub fn new(opcode: Opcode, lba: LbaT, blocks: BlockCount) -> Self {
        BlockOperation {
            opcode,
            lba,
            blocks,
            block_size: 520,
            optimal_block_size: 1,
            pre_read: None,
        }
    }

    pub fn with_pre_read(mut self, lba: LbaT, blocks: BlockCount) -> Self {
        self.pre_read = Some(PreRead{lba, blocks});
        self
    }

    /// Use the block sizes a raid group exports
    pub fn with_block_sizes(mut self, block_size: u32, optimal_block_size: u32)
        -> Self
    {
        self.block_size = block_size;
        self.optimal_block_size = optimal_block_size;
        self
    }

    /// One past the last block addressed
    pub fn end(&self) -> LbaT {
        self.lba + self.blocks
    }
}

// LCOV_EXCL_STOP
