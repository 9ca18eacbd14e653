// vim: tw=80
//! Random sweeps over the IOTS to SIOTS decomposition of healthy groups
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use raidgen_core::{
    block_op::{BlockOperation, Opcode},
    degraded::NrExtentTable,
    geometry::{RaidGeometry, RaidType},
    iots::Iots,
    siots::{Algorithm, SiotsPlan},
};
use rstest::rstest;
use rstest_reuse::{apply, template};

use super::*;

const ITERATIONS: usize = 200;

#[template]
#[rstest]
#[case(RaidType::Raid0, 1)]
#[case(RaidType::Raid0, 3)]
#[case(RaidType::Raid1, 2)]
#[case(RaidType::Raid1, 3)]
#[case(RaidType::Raid5, 3)]
#[case(RaidType::Raid5, 5)]
#[case(RaidType::Raid5, 16)]
#[case(RaidType::Raid6, 4)]
#[case(RaidType::Raid6, 6)]
#[case(RaidType::Raid10, 4)]
fn all_geometries(#[case] raid_type: RaidType, #[case] width: u16) {}

/// Check the per-SIOTS properties that hold for every algorithm
fn check_siots(g: &RaidGeometry, p: &SiotsPlan) {
    assert!(p.parity_count <= g.max_blocks_per_drive());
    assert!(p.data_disks >= 1 && p.data_disks <= g.width());
    assert!(p.start_pos < g.width());
    assert_eq!(p.dead_pos, None);
    if g.raid_type() != RaidType::Raid1 {
        let bpps = g.blocks_per_parity_stripe();
        assert_eq!(p.lba / bpps, (p.lba + p.xfer - 1) / bpps,
            "SIOTS {:?} crosses a parity stripe", p);
    }
    for f in p.fru_extents.iter().filter(|f| !f.is_empty()) {
        assert!(f.lba >= p.parity_start);
        assert!(f.lba + f.blocks <= p.parity_start + p.parity_count);
    }
}

fn sweep(raid_type: RaidType, width: u16, opcode: Opcode, seed: u64) {
    let g = geometry(raid_type, width);
    let tracker = NrExtentTable::new();
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let capacity = g.capacity();
    for _ in 0..ITERATIONS {
        let lba = rng.gen_range(0..capacity);
        let max = (capacity - lba).min(8192);
        let blocks = rng.gen_range(1..=max);
        let op = BlockOperation::new(opcode, lba, blocks);
        let iots = t!(Iots::new(op, &g, &tracker));
        let summary = t!(iots.plan(&tracker));
        assert_tiles(&summary.siots, lba, blocks);
        for p in summary.siots.iter() {
            check_siots(&g, p);
        }
    }
}

#[apply(all_geometries)]
fn read(raid_type: RaidType, width: u16) {
    sweep(raid_type, width, Opcode::Read, 12345);
}

#[apply(all_geometries)]
fn write(raid_type: RaidType, width: u16) {
    sweep(raid_type, width, Opcode::Write, 23456);
}

#[apply(all_geometries)]
fn zero(raid_type: RaidType, width: u16) {
    sweep(raid_type, width, Opcode::Zero, 34567);
}

#[apply(all_geometries)]
fn verify(raid_type: RaidType, width: u16) {
    sweep(raid_type, width, Opcode::Verify, 45678);
}

/// Parity zeros of whole parity stripes zero every member
#[rstest]
#[case(RaidType::Raid5, 5)]
#[case(RaidType::Raid6, 6)]
fn stripe_aligned_zero(#[case] raid_type: RaidType, #[case] width: u16) {
    let g = geometry(raid_type, width);
    let tracker = NrExtentTable::new();
    let bpps = g.blocks_per_parity_stripe();
    let op = BlockOperation::new(Opcode::Zero, bpps, 3 * bpps);
    let summary = t!(t!(Iots::new(op, &g, &tracker)).plan(&tracker));
    assert_eq!(summary.siots.len(), 3);
    for p in summary.siots.iter() {
        assert_eq!(p.algorithm, Algorithm::RgZero);
        assert_eq!(p.xfer, bpps);
        assert_eq!(p.data_disks, g.data_disks());
        assert!(p.fru_extents.iter().all(|f| f.blocks == g.element_size()));
    }
}

/// The very last block of the group is addressable
#[apply(all_geometries)]
fn last_block(raid_type: RaidType, width: u16) {
    let g = geometry(raid_type, width);
    let tracker = NrExtentTable::new();
    let op = BlockOperation::new(Opcode::Write, g.capacity() - 1, 1);
    let summary = t!(t!(Iots::new(op, &g, &tracker)).plan(&tracker));
    assert_tiles(&summary.siots, g.capacity() - 1, 1);
    let op = BlockOperation::new(Opcode::Write, g.capacity() - 1, 2);
    assert!(Iots::new(op, &g, &tracker).is_err());
}
