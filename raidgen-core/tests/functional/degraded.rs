// vim: tw=80
//! Decomposition of groups with degraded members
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use raidgen_core::{
    block_op::{BlockOperation, Opcode},
    degraded::{DegradedTracker, NrExtent, NrExtentTable},
    geometry::RaidType,
    iots::Iots,
    siots::Algorithm,
    Error,
};
use rstest::rstest;

use super::*;

/// Every SIOTS sees each logged member as either wholly clean or wholly dirty,
/// and treats exactly the dirty ones that it touches as dead.
#[rstest]
#[case(RaidType::Raid1, 2, Opcode::Write)]
#[case(RaidType::Raid1, 3, Opcode::Read)]
#[case(RaidType::Raid5, 3, Opcode::Read)]
#[case(RaidType::Raid5, 5, Opcode::Write)]
#[case(RaidType::Raid5, 5, Opcode::Verify)]
#[case(RaidType::Raid6, 6, Opcode::Write)]
fn region_boundaries(#[case] raid_type: RaidType, #[case] width: u16,
                     #[case] opcode: Opcode)
{
    let g = geometry(raid_type, width);
    let tracker = NrExtentTable::new();
    let degraded = width - 1;
    tracker.stop_rebuild_logging(degraded, &[
        NrExtent::new(100, 50, true),
        NrExtent::new(1000, 1, true),
        NrExtent::new(2000, 700, true),
    ]);
    let mut rng = XorShiftRng::seed_from_u64(98765);
    for _ in 0..200 {
        let lba = rng.gen_range(0..4096);
        let blocks = rng.gen_range(1..=4096);
        let op = BlockOperation::new(opcode, lba, blocks);
        let summary = t!(t!(Iots::new(op, &g, &tracker)).plan(&tracker));
        assert_tiles(&summary.siots, lba, blocks);
        for p in summary.siots.iter() {
            let regions = tracker.get_nr_extent(degraded, p.parity_start,
                                                p.parity_count);
            assert_eq!(regions.len(), 1, "{p:?} spans a region boundary");
            let touched = !p.fru_extents[usize::from(degraded)].is_empty();
            let dead = p.dead_pos == Some(degraded);
            assert_eq!(dead, regions[0].dirty && touched, "{p:?}");
            assert_eq!(p.dead_pos_2, None);
        }
    }
}

/// A zero may span one transition, but no more
#[test]
fn zero_spans_one_transition() {
    let g = geometry(RaidType::Raid1, 2);
    let tracker = NrExtentTable::new();
    tracker.stop_rebuild_logging(1, &[
        NrExtent::new(64, 64, true),
        NrExtent::new(192, 64, true),
    ]);
    let op = BlockOperation::new(Opcode::Zero, 0, 512);
    let summary = t!(t!(Iots::new(op, &g, &tracker)).plan(&tracker));
    assert_tiles(&summary.siots, 0, 512);
    let xfers = summary.siots.iter().map(|p| p.xfer).collect::<Vec<_>>();
    assert_eq!(xfers, vec![128, 128, 256]);
    for p in summary.siots.iter() {
        assert_eq!(p.algorithm, Algorithm::RgZero);
        assert!(p.zero_spans.len() <= 2);
    }
}

/// Reads avoid a rebuild-logging member everywhere
#[rstest]
#[case(RaidType::Raid5, 5)]
#[case(RaidType::Raid6, 6)]
#[case(RaidType::Raid1, 2)]
fn rebuild_logging(#[case] raid_type: RaidType, #[case] width: u16) {
    let g = geometry(raid_type, width);
    let tracker = NrExtentTable::new();
    tracker.start_rebuild_logging(0);
    let op = BlockOperation::new(Opcode::Read, 0, 4096);
    let summary = t!(t!(Iots::new(op, &g, &tracker)).plan(&tracker));
    assert_tiles(&summary.siots, 0, 4096);
    for p in summary.siots.iter() {
        if !raid_type.is_parity() {
            assert_eq!(p.start_pos, 1);
            assert!(p.fru_extents[0].is_empty());
        } else if !p.fru_extents[0].is_empty() {
            assert_eq!(p.algorithm, Algorithm::R5DegRd);
            assert_eq!(p.dead_pos, Some(0));
        }
    }
}

/// More dead members than the group tolerates
#[rstest]
#[case(RaidType::Raid5, 5, &[0, 1])]
#[case(RaidType::Raid6, 6, &[0, 1, 2])]
#[case(RaidType::Raid0, 3, &[1])]
fn too_degraded(#[case] raid_type: RaidType, #[case] width: u16,
                #[case] dead: &[u16])
{
    let g = geometry(raid_type, width);
    let tracker = NrExtentTable::new();
    for p in dead {
        tracker.start_rebuild_logging(*p);
    }
    let bpps = g.blocks_per_parity_stripe();
    let op = BlockOperation::new(Opcode::Read, 0, bpps);
    let r = Iots::new(op, &g, &tracker).and_then(|iots| iots.plan(&tracker));
    assert_eq!(r.unwrap_err(), Error::DegradedAccessDenied);
}

/// Rebuilding a member's dirty regions plans a write to it alone
#[test]
fn rebuild_dirty() {
    let g = geometry(RaidType::Raid5, 3);
    let tracker = NrExtentTable::new();
    tracker.stop_rebuild_logging(2, &[NrExtent::new(0, 128, true)]);
    let op = BlockOperation::new(Opcode::Rebuild, 0, 512);
    let summary = t!(t!(Iots::new(op, &g, &tracker)).plan(&tracker));
    let first = &summary.siots[0];
    assert_eq!(first.algorithm, Algorithm::R5Rb);
    assert_eq!(first.xfer, 256);
    assert_eq!(first.dead_pos, Some(2));
    let second = &summary.siots[1];
    assert_eq!(second.dead_pos, None);
}
