// vim: tw=80
//! Generate engines
//!
//! A generate engine carves the next SIOTS out of an IOTS's remaining range
//! and chooses the algorithm that will execute it.  There is one engine per
//! family of geometries.

use crate::{
    block_op::PreRead,
    degraded::{DegradedTracker, NrExtent, RebuildLoggingMask},
    geometry::{RaidGeometry, RaidType},
    siots::{Algorithm, RegionSpan, Siots},
    state::{SiotsState, StateStatus},
    types::*,
    util::{largest_prefix, overlap, round_down},
};

mod mirror;
mod parity;
mod striper;

pub use self::mirror::Mirror;
pub use self::parity::Parity;
pub use self::striper::Striper;

/// Everything a generate engine may consult
pub struct GenerateContext<'a> {
    pub geometry: &'a RaidGeometry,
    pub tracker: &'a dyn DegradedTracker,
    pub rebuild_logging: &'a RebuildLoggingMask,
    /// Data the caller already read on behalf of a partial-stripe write
    pub pre_read: Option<PreRead>,
}

#[enum_dispatch::enum_dispatch]
pub trait Generate {
    /// Shorten `siots` to the next unit of work, choose its algorithm and plan
    /// its member requests.
    ///
    /// On entry the SIOTS covers the IOTS's entire remaining range.
    fn generate(&self, siots: &mut Siots, ctx: &GenerateContext) -> Result<()>;

    /// Check the geometry-specific invariants of a generated SIOTS
    fn validate(&self, siots: &Siots, geometry: &RaidGeometry) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[enum_dispatch::enum_dispatch(Generate)]
pub enum GenerateEngine {
    Striper(Striper),
    Mirror(Mirror),
    Parity(Parity),
}

impl GenerateEngine {
    pub fn for_geometry(geometry: &RaidGeometry) -> Self {
        match geometry.raid_type() {
            RaidType::Raid0 | RaidType::Raid10 => Striper.into(),
            RaidType::Raid1 => Mirror.into(),
            RaidType::Raid5 | RaidType::Raid6 => Parity.into(),
        }
    }

    /// Generate a SIOTS and leave it ready to execute.
    ///
    /// Generation never blocks.  Failures are recorded in the SIOTS, whose
    /// state machine will then report them.
    pub fn generate_start(&self, siots: &mut Siots, ctx: &GenerateContext)
        -> StateStatus
    {
        debug_assert_eq!(siots.state, SiotsState::Generate);
        let r = self.generate(siots, ctx).and_then(|_| {
            if siots.state.is_error() {
                Ok(())
            } else {
                self.validate(siots, ctx.geometry)
            }
        });
        if let Err(e) = r {
            siots.error = Some(e);
            siots.state = SiotsState::UnexpectedError;
        }
        tracing::debug!(lba = siots.lba, xfer = siots.xfer,
            algorithm = %siots.algorithm, dead_pos = ?siots.dead_pos,
            dead_pos_2 = ?siots.dead_pos_2, "generated SIOTS");
        StateStatus::Executing
    }
}

/// Degraded members over a SIOTS's range
#[derive(Debug, Default)]
pub(crate) struct Degradation {
    /// Members that must be treated as dead over the whole range
    pub dead: Vec<Position>,
    /// Members whose range spans one clean/dirty transition.  Only zeros may
    /// have any.
    pub spans: Vec<RegionSpan>,
}

impl Degradation {
    pub fn is_dead(&self, position: Position) -> bool {
        self.dead.contains(&position)
    }
}

fn regions_touched(extents: &[NrExtent], lba: LbaT, blocks: BlockCount)
    -> usize
{
    extents.iter()
        .filter(|x| overlap((x.lba, x.blocks), (lba, blocks)) > 0)
        .count()
}

/// Shorten a SIOTS so that its range on every degraded member lies within a
/// single NR region, and classify the degraded members.
///
/// A zero may span one clean/dirty transition.
///
/// # Parameters
///
/// - `xfer`:   Current length of the SIOTS
/// - `zero`:   Is this for the zero algorithm?
/// - `range`:  Member-space range touched by a prefix of the SIOTS of the given
///             length.  Ranges of longer prefixes must contain those of
///             shorter ones.
///
/// # Returns
///
/// The new length and the degraded members
pub(crate) fn degraded_cut<F>(ctx: &GenerateContext, xfer: BlockCount,
                              zero: bool, range: F)
    -> (BlockCount, Degradation)
    where F: Fn(BlockCount) -> (LbaT, BlockCount)
{
    let mut deg = Degradation::default();
    let mut logged = Vec::new();
    for p in 0..ctx.geometry.width() {
        if ctx.rebuild_logging.get(p) || ctx.tracker.is_rebuild_logging(p) {
            deg.dead.push(p);
        } else if ctx.tracker.rebuild_logs_available(p) {
            logged.push(p);
        }
    }
    if logged.is_empty() {
        return (xfer, deg);
    }
    let (hs, hc) = range(xfer);
    let extents = logged.into_iter()
        .map(|p| (p, ctx.tracker.get_nr_extent(p, hs, hc)))
        .collect::<Vec<_>>();
    let allowed = if zero { 2 } else { 1 };
    let one_region = extents.iter()
        .all(|(_, xs)| xs.first().map(|x| x.contains(hs, hc)).unwrap_or(false));
    let n = if one_region {
        xfer
    } else {
        largest_prefix(xfer, |n| {
            let (s, c) = range(n);
            extents.iter().all(|(_, xs)| regions_touched(xs, s, c) <= allowed)
        }).unwrap_or(1)
    };
    if n < xfer {
        tracing::debug!(xfer, n, "cut SIOTS at a NR region boundary");
    }
    let (s, c) = range(n);
    for (p, xs) in extents {
        let touched = xs.into_iter()
            .filter(|x| overlap((x.lba, x.blocks), (s, c)) > 0)
            .map(|x| {
                let start = x.lba.max(s);
                let end = x.end().min(s + c);
                NrExtent::new(start, end - start, x.dirty)
            }).collect::<Vec<_>>();
        match touched.as_slice() {
            [x] => {
                if x.dirty {
                    deg.dead.push(p);
                }
            }
            [a, b] => {
                for x in [a, b] {
                    deg.spans.push(RegionSpan {
                        position: p,
                        lba: x.lba,
                        blocks: x.blocks,
                        dirty: x.dirty,
                        dead_pos: x.dirty.then_some(p),
                    });
                }
            }
            _ => {
                debug_assert!(false, "A SIOTS may touch at most two regions");
                deg.dead.push(p);
            }
        }
    }
    deg.dead.sort_unstable();
    (n, deg)
}

/// Like [`degraded_cut`], for a zero that must cover whole multiples of
/// `granule` blocks.
///
/// Returns `None` if no such prefix exists.
pub(crate) fn zero_cut<F>(ctx: &GenerateContext, xfer: BlockCount,
                          granule: BlockCount, range: F)
    -> Option<(BlockCount, Degradation)>
    where F: Fn(BlockCount) -> (LbaT, BlockCount) + Copy
{
    let (n, deg) = degraded_cut(ctx, xfer, true, range);
    let rounded = round_down(n, granule);
    if rounded == 0 {
        None
    } else if rounded == n {
        Some((n, deg))
    } else {
        Some(degraded_cut(ctx, rounded, true, range))
    }
}

/// Shorten a SIOTS so that no member request exceeds the per-drive limit
pub(crate) fn limit_per_drive<F>(xfer: BlockCount, max: BlockCount, range: F)
    -> BlockCount
    where F: Fn(BlockCount) -> (LbaT, BlockCount)
{
    if range(xfer).1 <= max {
        xfer
    } else {
        largest_prefix(xfer, |n| range(n).1 <= max).unwrap_or(1)
    }
}

/// Mark the SIOTS as having an unsupported opcode
pub(crate) fn invalid_opcode(siots: &mut Siots) -> Result<()> {
    siots.algorithm = Algorithm::InvalidOpcode;
    siots.state = SiotsState::InvalidOpcode;
    Ok(())
}

/// Compute the footprint, settle the dead positions and set the initial state
pub(crate) fn finalize(siots: &mut Siots, geometry: &RaidGeometry,
                       deg: Degradation) -> Result<()>
{
    siots.update_footprint();
    let dead = deg.dead.iter()
        .copied()
        .filter(|p| !siots.footprint(*p).is_empty())
        .collect::<Vec<_>>();
    if dead.len() > geometry.max_dead() {
        tracing::debug!(lba = siots.lba, ?dead, "degraded access denied");
        return Err(Error::DegradedAccessDenied);
    }
    siots.dead_pos = dead.first().copied();
    siots.dead_pos_2 = dead.get(1).copied();
    siots.zero_spans = deg.spans;
    siots.state = SiotsState::initial(siots.algorithm);
    Ok(())
}

/// Invariants shared by every geometry
pub(crate) fn validate_common(siots: &Siots, geometry: &RaidGeometry)
    -> Result<()>
{
    let width = geometry.width();
    let ok = siots.xfer > 0 &&
        siots.parity_count > 0 &&
        siots.start_pos < width &&
        siots.data_disks > 0 &&
        siots.data_disks <= width &&
        siots.dead_pos_2.map(|_| siots.dead_pos.is_some()).unwrap_or(true) &&
        siots.fru_extents.iter().all(|f| f.is_empty() || (
            f.lba >= siots.parity_start &&
            f.lba + f.blocks <= siots.parity_start + siots.parity_count
        ));
    if ok {
        Ok(())
    } else {
        tracing::error!(?siots, "generated an invalid SIOTS");
        Err(Error::InvariantViolation)
    }
}

// LCOV_EXCL_STOP
