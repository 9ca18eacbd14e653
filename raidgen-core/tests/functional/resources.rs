// vim: tw=80
//! Page accounting across whole operations
use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use raidgen_core::{
    block_op::{BlockOperation, Opcode},
    degraded::NrExtentTable,
    geometry::RaidType,
    memory::{
        MemoryPool,
        PagePool,
        PageRequest,
        PageSize,
        Pages,
        PoolConfig,
        ResourceShape
    },
    raid_group::{RaidGroup, RetryPolicy},
    transport::RecordingTransport,
    Error,
};
use rstest::rstest;

use super::*;

fn quick() -> RetryPolicy {
    RetryPolicy {
        max_alloc_attempts: 12,
        backoff_ms: 1,
        ride_through_ms: 1,
        max_retries: 2,
    }
}

fn raid_group(raid_type: RaidType, width: u16, pool: &PagePool) -> RaidGroup {
    RaidGroup::new(geometry(raid_type, width),
        Arc::new(NrExtentTable::new()),
        Arc::new(pool.clone()),
        Arc::new(RecordingTransport::new()),
        quick())
}

/// Take every free page from the pool
fn drain(pool: &PagePool) -> Vec<Pages> {
    PageSize::ALL.iter()
        .map(|ps| {
            let request = PageRequest{page_size: *ps, pages: pool.free(*ps)};
            t!(pool.try_allocate(&request))
        }).collect()
}

/// Every page allocated for a SIOTS is returned, whatever the algorithm
#[rstest]
#[case(RaidType::Raid0, 4)]
#[case(RaidType::Raid1, 2)]
#[case(RaidType::Raid5, 5)]
#[case(RaidType::Raid6, 6)]
fn round_trip(#[case] raid_type: RaidType, #[case] width: u16) {
    let pool = PagePool::new(PoolConfig::default());
    let before = PageSize::ALL.map(|ps| pool.free(ps));
    let rg = raid_group(raid_type, width, &pool);
    let capacity = rg.geometry().capacity();
    let mut rng = XorShiftRng::seed_from_u64(5150);
    let opcodes = [Opcode::Read, Opcode::Write, Opcode::Zero, Opcode::Verify];
    basic_runtime().block_on(async {
        for _ in 0..50 {
            let opcode = opcodes[rng.gen_range(0..opcodes.len())];
            let lba = rng.gen_range(0..capacity - 4096);
            let blocks = rng.gen_range(1..=4096);
            let op = BlockOperation::new(opcode, lba, blocks);
            let summary = t!(rg.execute(op).await);
            assert_tiles(&summary.siots, lba, blocks);
        }
    });
    let stats = pool.stats();
    assert!(stats.allocated > 0);
    assert_eq!(stats.allocated, stats.released);
    assert_eq!(stats.deferred, 0);
    assert_eq!(PageSize::ALL.map(|ps| pool.free(ps)), before);
}

/// Pages for arbitrary shapes go back where they came from
#[rstest]
#[case(1, [1, 1, 1, 1])]
#[case(16, [16, 16, 16, 16])]
#[case(16, [16, 0, 0, 16])]
#[case(64, [0, 0, 0, 64])]
fn shape_round_trip(#[case] fru_requests: u32, #[case] sg_lists: [u32; 4]) {
    let pool = PagePool::new(PoolConfig::default());
    let before = PageSize::ALL.map(|ps| pool.free(ps));
    let shape = ResourceShape {
        fru_requests,
        sg_lists,
        blocks: 64,
        ..Default::default()
    };
    let request = PageRequest::for_shape(&shape);
    assert!(request.pages > 0);
    for _ in 0..100 {
        let grants = (0..4)
            .map(|_| t!(pool.try_allocate(&request)))
            .collect::<Vec<_>>();
        assert_eq!(pool.free(request.page_size),
                   before[request.page_size as usize] - 4 * request.pages);
        drop(grants);
        assert_eq!(PageSize::ALL.map(|ps| pool.free(ps)), before);
    }
    let stats = pool.stats();
    assert_eq!(stats.allocated, 400 * request.pages);
    assert_eq!(stats.allocated, stats.released);
}

/// An operation that can't get pages waits until some are freed
#[test]
fn exhaustion_retry() {
    let pool = PagePool::new(PoolConfig::default());
    let rg = raid_group(RaidType::Raid5, 3, &pool);
    let held = drain(&pool);
    let op = BlockOperation::new(Opcode::Write, 0, 600);
    let summary = basic_runtime().block_on(async {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        });
        rg.execute(op).await
    });
    let summary = t!(summary);
    assert_tiles(&summary.siots, 0, 600);
    let stats = pool.stats();
    assert!(stats.deferred > 0);
    assert_eq!(stats.allocated, stats.released);
}

/// If pages never come back, the operation eventually fails without I/O
#[test]
fn exhaustion_gives_up() {
    let pool = PagePool::new(PoolConfig{min_pages: 1, std_pages: 1,
                                        max_pages: 1});
    let transport = Arc::new(RecordingTransport::new());
    let retry = RetryPolicy{max_alloc_attempts: 3, ..quick()};
    let rg = RaidGroup::new(geometry(RaidType::Raid1, 2),
        Arc::new(NrExtentTable::new()), Arc::new(pool.clone()),
        transport.clone(), retry);
    let _held = drain(&pool);
    let op = BlockOperation::new(Opcode::Read, 0, 8);
    let r = basic_runtime().block_on(rg.execute(op));
    assert_eq!(r.unwrap_err(), Error::ResourceExhausted);
    assert_eq!(pool.stats().deferred, 3);
    assert!(transport.requests().is_empty());
}
