// vim: tw=80
//! Generation for parity groups
//!
//! RAID5 and RAID6 share one engine.  Reads go straight to the data members
//! unless a touched member is dead, in which case its data is reconstructed
//! from every survivor.  Writes pick one of three strategies by comparing the
//! number of member operations each needs:
//!
//! - MR3:  read the parts of the parity range that won't be written, then
//!         write new data and parity.
//! - 468:  read the old data and parity, then write both.
//! - RCW:  like MR3, but chosen when few data members are untouched.

use crate::{
    block_op::Opcode,
    geometry::{FruExtent, PositionMap, RaidGeometry, RaidType},
    siots::{Algorithm, Siots},
    types::*,
    write_log,
};
use super::{
    degraded_cut,
    finalize,
    invalid_opcode,
    limit_per_drive,
    validate_common,
    zero_cut,
    Degradation,
    Generate,
    GenerateContext
};

/// Generate engine for RAID5 and RAID6
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Parity;

impl Generate for Parity {
    fn generate(&self, siots: &mut Siots, ctx: &GenerateContext) -> Result<()>
    {
        match siots.opcode {
            Opcode::Read => read(siots, ctx),
            Opcode::CheckZeroed => check_zeroed(siots, ctx),
            Opcode::Rebuild => verify(siots, ctx, Algorithm::R5Rb),
            op if op.is_verify() => verify(siots, ctx, Algorithm::R5Vr),
            op if op.is_zero() => zero(siots, ctx),
            op if op.is_write() => write(siots, ctx),
            _ => invalid_opcode(siots),
        }
    }

    fn validate(&self, siots: &Siots, geometry: &RaidGeometry) -> Result<()> {
        validate_common(siots, geometry)?;
        let pm = siots.positions.ok_or(Error::InvariantViolation)?;
        let within_parity_stripe =
            geometry.translate(siots.lba, siots.xfer).max_blocks == siots.xfer;
        let zero_ok = siots.algorithm != Algorithm::RgZero || (
            siots.data_disks == geometry.data_disks() &&
            siots.parity_count * u64::from(geometry.data_disks()) == siots.xfer
        );
        if pm.is_data(siots.start_pos) &&
            within_parity_stripe &&
            zero_ok &&
            siots.parity_count <= geometry.max_blocks_per_drive()
        {
            Ok(())
        } else {
            tracing::error!(lba = siots.lba, xfer = siots.xfer,
                algorithm = %siots.algorithm, "invalid parity SIOTS");
            Err(Error::InvariantViolation)
        }
    }
}

/// Apply the limits shared by every parity algorithm
fn limit(g: &RaidGeometry, lba: LbaT, xfer: BlockCount) -> BlockCount {
    let xfer = g.translate(lba, xfer).max_blocks;
    limit_per_drive(xfer, g.max_blocks_per_drive(), |n| g.parity_range(lba, n))
}

/// Fill in the fields that depend only on the final range
fn describe(siots: &mut Siots, g: &RaidGeometry, xfer: BlockCount,
            algorithm: Algorithm) -> PositionMap
{
    let (ps, pc) = g.parity_range(siots.lba, xfer);
    let pm = g.positions(siots.lba);
    siots.xfer = xfer;
    siots.algorithm = algorithm;
    siots.parity_start = ps;
    siots.parity_count = pc;
    siots.positions = Some(pm);
    siots.start_pos = g.translate(siots.lba, xfer).position;
    pm
}

/// One extent per listed position, each covering the parity range
fn across(positions: &[Position], ps: LbaT, pc: BlockCount)
    -> Vec<FruExtent>
{
    positions.iter()
        .map(|p| FruExtent{position: *p, lba: ps, blocks: pc})
        .collect()
}

fn touched(footprint: &[FruExtent]) -> Vec<FruExtent> {
    footprint.iter().filter(|f| !f.is_empty()).copied().collect()
}

/// The parts of the parity range that a data member's write won't cover
fn gaps(f: &FruExtent, ps: LbaT, pc: BlockCount) -> Vec<FruExtent> {
    let position = f.position;
    if f.is_empty() {
        return vec![FruExtent{position, lba: ps, blocks: pc}];
    }
    let mut v = Vec::with_capacity(2);
    if f.lba > ps {
        v.push(FruExtent{position, lba: ps, blocks: f.lba - ps});
    }
    let end = f.lba + f.blocks;
    if end < ps + pc {
        v.push(FruExtent{position, lba: end, blocks: ps + pc - end});
    }
    v
}

fn read(siots: &mut Siots, ctx: &GenerateContext) -> Result<()> {
    let g = ctx.geometry;
    let lba = siots.lba;
    let range = |n| g.parity_range(lba, n);
    let xfer = limit(g, lba, siots.xfer);
    let (xfer, deg) = degraded_cut(ctx, xfer, false, range);
    let fp = g.data_footprint(lba, xfer);
    let data = touched(&fp);
    let lost = data.iter()
        .filter(|f| deg.is_dead(f.position))
        .copied()
        .collect::<Vec<_>>();
    let e = g.element_size();
    let algorithm = if !lost.is_empty() {
        Algorithm::R5DegRd
    } else if lba % e + xfer <= e {
        Algorithm::R5SmRd
    } else {
        Algorithm::R5Rd
    };
    let pm = describe(siots, g, xfer, algorithm);
    siots.data_disks = data.len() as u16;
    siots.reads = if lost.is_empty() {
        data
    } else {
        // Every survivor must be read wherever a lost member was to be read
        pm.all().iter()
            .map(|p| {
                let mut x = fp.iter()
                    .find(|f| f.position == *p)
                    .copied()
                    .unwrap_or_else(|| FruExtent::empty(*p));
                for l in lost.iter() {
                    x.merge(l.lba, l.blocks);
                }
                x
            }).collect()
    };
    finalize(siots, g, deg)
}

fn write(siots: &mut Siots, ctx: &GenerateContext) -> Result<()> {
    let g = ctx.geometry;
    let lba = siots.lba;
    let e = g.element_size();
    let range = |n| g.parity_range(lba, n);
    let mut xfer = siots.xfer;
    // A short write may only touch one parity extent
    if xfer < e && xfer > e - lba % e {
        xfer = e - lba % e;
    }
    let xfer = limit(g, lba, xfer);
    let (xfer, deg) = degraded_cut(ctx, xfer, false, range);
    plan_write(siots, ctx, xfer, deg)
}

/// Has the caller already pre-read every data block in the parity range?
fn pre_read_covers(ctx: &GenerateContext, pm: &PositionMap, ps: LbaT,
                   pc: BlockCount) -> bool
{
    let pr = match ctx.pre_read {
        Some(pr) => pr,
        None => return false
    };
    let g = ctx.geometry;
    pm.data().iter().all(|q| {
        let first = g.logical_lba(*q, ps);
        let last = g.logical_lba(*q, ps + pc - 1);
        match (first, last) {
            (Some(f), Some(l)) => f >= pr.lba && l < pr.lba + pr.blocks,
            _ => false
        }
    })
}

fn plan_write(siots: &mut Siots, ctx: &GenerateContext, xfer: BlockCount,
              deg: Degradation) -> Result<()>
{
    let g = ctx.geometry;
    let lba = siots.lba;
    let bps = g.blocks_per_stripe();
    let d = u64::from(g.data_disks());
    let fp = g.data_footprint(lba, xfer);
    let (ps, pc) = g.parity_range(lba, xfer);
    let pm = g.positions(lba);
    let written = touched(&fp);
    let parity = across(pm.redundant(), ps, pc);
    let gap_reads = fp.iter()
        .flat_map(|f| gaps(f, ps, pc))
        .collect::<Vec<_>>();
    let aligned = lba % bps == 0 && (lba + xfer) % bps == 0;
    let covered = !aligned && pre_read_covers(ctx, &pm, ps, pc);
    let degraded = !deg.dead.is_empty();

    let algorithm = if siots.opcode == Opcode::CorruptData {
        Algorithm::R5CorruptData
    } else if aligned || covered {
        Algorithm::R5Mr3
    } else if degraded {
        Algorithm::R5Rmw
    } else if xfer * 2 >= pc * d {
        Algorithm::R5Mr3
    } else {
        let p = pm.redundant().len();
        let rmw_ops = 2 * (written.len() + p);
        let rcw_ops = gap_reads.len() + written.len() + p;
        if rmw_ops < rcw_ops {
            let width = g.width();
            let small = written.len() == 1 && (width > 4 ||
                (width == 4 && g.raid_type() == RaidType::Raid5));
            if small {
                Algorithm::R5SmallRmw
            } else {
                Algorithm::R5Rmw
            }
        } else {
            Algorithm::R5Rcw
        }
    };

    describe(siots, g, xfer, algorithm);
    siots.data_disks = written.len() as u16;
    match algorithm {
        Algorithm::R5CorruptData => {
            siots.writes = written;
        }
        Algorithm::R5Mr3 | Algorithm::R5Rcw if covered => {
            siots.data_disks = g.data_disks();
            siots.writes = across(pm.data(), ps, pc);
            siots.writes.extend(parity);
        }
        Algorithm::R5Mr3 | Algorithm::R5Rcw => {
            siots.reads = gap_reads;
            siots.writes = written;
            siots.writes.extend(parity);
        }
        _ => {
            // Old data must also be read wherever it is needed to reconstruct
            // a dead member's old data.
            let lost = written.iter()
                .filter(|f| deg.is_dead(f.position))
                .copied()
                .collect::<Vec<_>>();
            siots.reads = fp.iter()
                .map(|f| {
                    let mut x = *f;
                    if !deg.is_dead(f.position) {
                        for l in lost.iter() {
                            x.merge(l.lba, l.blocks);
                        }
                    }
                    x
                }).filter(|x| !x.is_empty())
                .chain(parity.iter().copied())
                .collect();
            siots.writes = written;
            siots.writes.extend(parity);
        }
    }
    finalize(siots, g, deg)?;
    siots.write_logged = write_log::required(g, siots);
    Ok(())
}

fn zero(siots: &mut Siots, ctx: &GenerateContext) -> Result<()> {
    let g = ctx.geometry;
    let lba = siots.lba;
    let bps = g.blocks_per_stripe();
    let range = |n| g.parity_range(lba, n);
    if lba % bps == 0 && siots.xfer >= bps {
        let xfer = limit(g, lba, siots.xfer);
        if let Some((xfer, deg)) = zero_cut(ctx, xfer, bps, range) {
            let pm = describe(siots, g, xfer, Algorithm::RgZero);
            siots.data_disks = g.data_disks();
            siots.writes = across(pm.all(), siots.parity_start,
                                  siots.parity_count);
            return finalize(siots, g, deg);
        }
    }
    tracing::trace!(lba, xfer = siots.xfer, "zeroing with writes");
    write(siots, ctx)
}

fn check_zeroed(siots: &mut Siots, ctx: &GenerateContext) -> Result<()> {
    let g = ctx.geometry;
    let lba = siots.lba;
    let range = |n| g.parity_range(lba, n);
    let xfer = limit(g, lba, siots.xfer);
    let (xfer, deg) = degraded_cut(ctx, xfer, false, range);
    let pm = describe(siots, g, xfer, Algorithm::RgCheckZeroed);
    siots.data_disks = g.width().saturating_sub(deg.dead.len() as u16);
    siots.reads = across(pm.all(), siots.parity_start, siots.parity_count);
    finalize(siots, g, deg)
}

/// Verify or rebuild: read every member over the parity range
fn verify(siots: &mut Siots, ctx: &GenerateContext, algorithm: Algorithm)
    -> Result<()>
{
    let g = ctx.geometry;
    let lba = siots.lba;
    let range = |n| g.parity_range(lba, n);
    let xfer = limit(g, lba, siots.xfer);
    let (xfer, deg) = degraded_cut(ctx, xfer, false, range);
    let pm = describe(siots, g, xfer, algorithm);
    let (ps, pc) = (siots.parity_start, siots.parity_count);
    siots.data_disks = g.data_disks();
    if algorithm == Algorithm::R5Vr {
        siots.reads = across(pm.all(), ps, pc);
    } else if !deg.dead.is_empty() {
        siots.reads = across(pm.all(), ps, pc);
        siots.writes = across(&deg.dead, ps, pc);
    }
    finalize(siots, g, deg)
}

// LCOV_EXCL_STOP
