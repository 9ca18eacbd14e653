// vim: tw=80
// rstest_reuse must be imported at the crate root for macro reasons
// https://github.com/la10736/rstest/issues/128
#![allow(clippy::single_component_path_imports)]
use rstest_reuse;

use raidgen_core::{
    geometry::{GeometryConfig, RaidGeometry, RaidType},
    siots::SiotsPlan,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// Helper to generate the runtime used by most tests
fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// Member capacity used by most tests
const MEMBER_CAPACITY: u64 = 1 << 16;

fn geometry(raid_type: RaidType, width: u16) -> RaidGeometry {
    t!(RaidGeometry::new(
        GeometryConfig::new(raid_type, width, MEMBER_CAPACITY)
    ))
}

/// Check that a list of SIOTSs exactly tiles `[lba, lba + blocks)`
fn assert_tiles(plans: &[SiotsPlan], lba: u64, blocks: u64) {
    let mut cursor = lba;
    for p in plans {
        assert_eq!(p.lba, cursor, "SIOTSs must be contiguous");
        assert!(p.xfer > 0, "SIOTSs must make progress");
        cursor += p.xfer;
    }
    assert_eq!(cursor, lba + blocks, "SIOTSs must cover the whole IOTS");
}

mod degraded;
mod partition;
mod raid_group;
mod resources;
