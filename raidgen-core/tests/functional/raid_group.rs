// vim: tw=80
//! Whole operations run against a recording transport
use std::sync::Arc;

use pretty_assertions::assert_eq;
use raidgen_core::{
    block_op::{BlockOperation, Opcode},
    config::RaidGroupConfig,
    degraded::{NrExtent, NrExtentTable},
    geometry::RaidType,
    memory::{PagePool, PoolConfig},
    raid_group::{RaidGroup, RetryPolicy},
    siots::{Algorithm, FruOpcode, FruRequest, FruStatus},
    transport::RecordingTransport,
    Error,
};
use rstest::rstest;

use super::*;

struct Harness {
    rg: RaidGroup,
    tracker: Arc<NrExtentTable>,
    transport: Arc<RecordingTransport>,
}

fn harness(raid_type: RaidType, width: u16) -> Harness {
    let tracker = Arc::new(NrExtentTable::new());
    let transport = Arc::new(RecordingTransport::new());
    let retry = RetryPolicy{ride_through_ms: 1, ..Default::default()};
    let rg = RaidGroup::new(geometry(raid_type, width), tracker.clone(),
        Arc::new(PagePool::new(PoolConfig::default())), transport.clone(),
        retry);
    Harness{rg, tracker, transport}
}

fn req(position: u16, lba: u64, blocks: u64, opcode: FruOpcode)
    -> FruRequest
{
    FruRequest{position, lba, blocks, opcode}
}

/// A single-block write to a healthy RAID5 group reads the other data member
/// and writes the data and the parity.
#[test]
fn small_write() {
    let h = harness(RaidType::Raid5, 3);
    let op = BlockOperation::new(Opcode::Write, 0, 1);
    let summary = t!(basic_runtime().block_on(h.rg.execute(op)));
    assert_eq!(summary.siots[0].algorithm, Algorithm::R5Mr3);
    let mut reqs = h.transport.requests();
    reqs.sort_by_key(|r| (r.opcode != FruOpcode::Read, r.position));
    assert_eq!(reqs, vec![
        req(1, 0, 1, FruOpcode::Read),
        req(0, 0, 1, FruOpcode::Write),
        req(2, 0, 1, FruOpcode::Write),
    ]);
}

/// No request is ever sent to a member that the SIOTS treats as dead
#[rstest]
#[case(RaidType::Raid1, 2, Opcode::Read)]
#[case(RaidType::Raid1, 3, Opcode::Write)]
#[case(RaidType::Raid5, 4, Opcode::Read)]
#[case(RaidType::Raid5, 4, Opcode::Write)]
#[case(RaidType::Raid6, 6, Opcode::Write)]
fn dead_member_untouched(#[case] raid_type: RaidType, #[case] width: u16,
                         #[case] opcode: Opcode)
{
    let h = harness(raid_type, width);
    h.tracker.start_rebuild_logging(1);
    let op = BlockOperation::new(opcode, 100, 3000);
    let summary = t!(basic_runtime().block_on(h.rg.execute(op)));
    assert_tiles(&summary.siots, 100, 3000);
    assert!(h.transport.requests().iter().all(|r| r.position != 1));
}

/// A zero that spans a clean/dirty transition on a returned member skips the
/// dirty part of it.
#[test]
fn zero_across_nr_boundary() {
    let h = harness(RaidType::Raid5, 3);
    h.tracker.stop_rebuild_logging(1, &[NrExtent::new(0, 64, true)]);
    let op = BlockOperation::new(Opcode::Zero, 0, 256);
    let summary = t!(basic_runtime().block_on(h.rg.execute(op)));
    assert_eq!(summary.siots.len(), 1);
    assert_eq!(summary.siots[0].algorithm, Algorithm::RgZero);
    let mut reqs = h.transport.requests();
    reqs.sort_by_key(|r| r.position);
    assert_eq!(reqs, vec![
        req(0, 0, 128, FruOpcode::Zero),
        req(1, 64, 64, FruOpcode::Zero),
        req(2, 0, 128, FruOpcode::Zero),
    ]);
}

/// A member that logs out and comes back is ridden through
#[test_log::test(tokio::test)]
async fn ride_through() {
    let h = harness(RaidType::Raid5, 3);
    h.transport.fail_next(0, FruStatus::Retryable);
    h.transport.fail_next(0, FruStatus::Retryable);
    let op = BlockOperation::new(Opcode::Read, 0, 256);
    let summary = t!(h.rg.execute(op).await);
    assert_eq!(summary.siots.len(), 1);
    let to_0 = h.transport.requests()
        .into_iter()
        .filter(|r| r.position == 0)
        .count();
    assert_eq!(to_0, 3);
}

/// A member that never comes back fails the operation once retries run out
#[test_log::test(tokio::test)]
async fn ride_through_exhausted() {
    let h = harness(RaidType::Raid5, 3);
    h.transport.fail_always(0, FruStatus::Retryable);
    let op = BlockOperation::new(Opcode::Read, 0, 1024);
    let r = h.rg.execute(op).await;
    assert_eq!(r.unwrap_err(), Error::MemberIo(0));
    // Nothing past the failed SIOTS was issued
    assert!(h.transport.requests().iter().all(|r| r.lba < 128));
}

/// Media errors on a mirror read are masked by reading another member
#[test]
fn mirror_read_redirect() {
    let h = harness(RaidType::Raid1, 2);
    h.transport.fail_next(0, FruStatus::MediaError(5));
    let op = BlockOperation::new(Opcode::Read, 0, 16);
    t!(basic_runtime().block_on(h.rg.execute(op)));
    assert_eq!(h.transport.requests(), vec![
        req(0, 0, 16, FruOpcode::Read),
        req(1, 0, 16, FruOpcode::Read),
    ]);
}

/// A group built from a configuration file honors its degraded members
#[test]
fn from_config() {
    let config = t!(RaidGroupConfig::from_yaml(r#"
geometry:
  raid_type: raid1
  width: 2
  member_capacity: 65536
degraded:
  - position: 0
    rebuild_logging: true
"#));
    let transport = Arc::new(RecordingTransport::new());
    let rg = t!(RaidGroup::from_config(&config, transport.clone()));
    let op = BlockOperation::new(Opcode::Read, 10, 20);
    t!(basic_runtime().block_on(rg.execute(op)));
    assert_eq!(transport.requests(), vec![req(1, 10, 20, FruOpcode::Read)]);
}
