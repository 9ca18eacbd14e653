// vim: tw=80
//! Generation for striped groups without redundancy

use crate::{
    block_op::Opcode,
    geometry::RaidGeometry,
    siots::{Algorithm, Siots},
    types::*,
    util::{div_roundup, round_down},
};
use super::{
    degraded_cut,
    finalize,
    invalid_opcode,
    limit_per_drive,
    validate_common,
    Generate,
    GenerateContext
};

/// Generate engine for RAID0 and RAID10
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Striper;

impl Generate for Striper {
    fn generate(&self, siots: &mut Siots, ctx: &GenerateContext) -> Result<()>
    {
        let g = ctx.geometry;
        let op = siots.opcode;
        if !(op.is_read() || op.is_write() || op.is_zero() || op.is_verify() ||
             op == Opcode::CheckZeroed)
        {
            return invalid_opcode(siots);
        }
        let lba = siots.lba;
        let range = |n| g.parity_range(lba, n);
        let xfer = g.translate(lba, siots.xfer).max_blocks;
        let xfer = limit_per_drive(xfer, g.max_blocks_per_drive(), range);
        let (mut xfer, deg) = degraded_cut(ctx, xfer, false, range);

        let algorithm = match op {
            Opcode::Read => Algorithm::Raid0Rd,
            Opcode::CheckZeroed => Algorithm::RgCheckZeroed,
            op if op.is_verify() => Algorithm::Raid0Vr,
            op if op.is_zero() => {
                let obs = g.optimal_block_size();
                if lba % obs == 0 && xfer >= obs {
                    xfer = round_down(xfer, obs);
                    Algorithm::RgZero
                } else {
                    Algorithm::Raid0Wr
                }
            }
            _ => Algorithm::Raid0Wr,
        };

        let e = g.element_size();
        let touched = g.data_footprint(lba, xfer)
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>();
        let (ps, pc) = g.parity_range(lba, xfer);
        siots.xfer = xfer;
        siots.algorithm = algorithm;
        siots.parity_start = ps;
        siots.parity_count = pc;
        siots.positions = Some(g.positions(lba));
        siots.start_pos = g.translate(lba, xfer).position;
        siots.data_disks = if algorithm == Algorithm::RgZero {
            div_roundup(xfer + lba % e, e).min(u64::from(g.width())) as u16
        } else {
            touched.len() as u16
        };
        match algorithm {
            Algorithm::Raid0Wr | Algorithm::RgZero => siots.writes = touched,
            _ => siots.reads = touched
        }
        finalize(siots, g, deg)
    }

    fn validate(&self, siots: &Siots, geometry: &RaidGeometry) -> Result<()> {
        validate_common(siots, geometry)?;
        if siots.dead_pos.is_some() {
            return Err(Error::InvariantViolation);
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
