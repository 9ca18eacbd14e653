// vim: tw=80
//! Generation for mirrored groups

use crate::{
    block_op::Opcode,
    geometry::{FruExtent, RaidGeometry},
    siots::{Algorithm, Siots},
    types::*,
};
use super::{
    degraded_cut,
    finalize,
    invalid_opcode,
    validate_common,
    zero_cut,
    Generate,
    GenerateContext
};

/// Generate engine for RAID1
///
/// Every member holds a full copy at the same address, so the member-space
/// range of a SIOTS is its logical range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Mirror;

impl Generate for Mirror {
    fn generate(&self, siots: &mut Siots, ctx: &GenerateContext) -> Result<()>
    {
        let g = ctx.geometry;
        let op = siots.opcode;
        if !(op.is_read() || op.is_write() || op.is_zero() || op.is_verify() ||
             op == Opcode::CheckZeroed || op == Opcode::Rebuild)
        {
            return invalid_opcode(siots);
        }
        let lba = siots.lba;
        let range = |n| (lba, n);
        let xfer = siots.xfer.min(g.max_blocks_per_drive());
        let obs = g.optimal_block_size();
        let zero = if op.is_zero() && lba % obs == 0 {
            zero_cut(ctx, xfer, obs, range)
        } else {
            None
        };
        let (xfer, deg, algorithm) = match zero {
            Some((n, deg)) => (n, deg, Algorithm::RgZero),
            None => {
                let (n, deg) = degraded_cut(ctx, xfer, false, range);
                let algorithm = match op {
                    Opcode::Read => Algorithm::MirrorRd,
                    Opcode::CorruptData => Algorithm::MirrorCorruptData,
                    Opcode::CheckZeroed => Algorithm::RgCheckZeroed,
                    Opcode::Rebuild => Algorithm::MirrorRb,
                    op if op.is_verify() => Algorithm::MirrorVr,
                    _ => Algorithm::MirrorWr,
                };
                (n, deg, algorithm)
            }
        };

        let width = g.width();
        let extent = |position| FruExtent{position, lba, blocks: xfer};
        let all = (0..width).map(extent).collect::<Vec<_>>();
        siots.xfer = xfer;
        siots.algorithm = algorithm;
        siots.parity_start = lba;
        siots.parity_count = xfer;
        siots.positions = Some(g.positions(lba));
        siots.start_pos = 0;
        siots.data_disks = width;
        match algorithm {
            Algorithm::MirrorRd => {
                let primary = (0..width)
                    .find(|p| !deg.is_dead(*p))
                    .ok_or(Error::DegradedAccessDenied)?;
                siots.start_pos = primary;
                siots.data_disks = 1;
                siots.reads = vec![extent(primary)];
            }
            Algorithm::MirrorVr => siots.reads = all,
            Algorithm::MirrorRb => {
                if !deg.dead.is_empty() {
                    siots.writes = deg.dead.iter().copied().map(extent)
                        .collect();
                    siots.reads = all;
                }
            }
            Algorithm::RgCheckZeroed => {
                siots.data_disks = width.saturating_sub(deg.dead.len() as u16);
                siots.reads = all;
            }
            _ => siots.writes = all
        }
        finalize(siots, g, deg)
    }

    fn validate(&self, siots: &Siots, geometry: &RaidGeometry) -> Result<()> {
        validate_common(siots, geometry)?;
        if siots.parity_start != siots.lba || siots.parity_count != siots.xfer {
            return Err(Error::InvariantViolation);
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
