// vim: tw=80
//! Raid group configuration files
//!
//! A configuration is a YAML document describing the geometry, the state of
//! any degraded members, the page budget and the retry policy.  Everything but
//! the geometry's raid type, width and member capacity has a default.

use std::{collections::BTreeSet, sync::Arc};

use serde_derive::{Deserialize, Serialize};

use crate::{
    degraded::{NrExtent, NrExtentTable},
    geometry::{GeometryConfig, RaidGeometry},
    memory::{PagePool, PoolConfig},
    raid_group::{RaidGroup, RetryPolicy},
    transport::FruTransport,
    types::*,
};

/// A member that is not fully healthy
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DegradedMemberConfig {
    pub position: Position,
    /// The member is gone, and nobody knows which regions it missed
    #[serde(default)]
    pub rebuild_logging: bool,
    /// Regions of the member, in member address space.  Unlisted regions are
    /// clean.
    #[serde(default)]
    pub nr_extents: Vec<NrExtent>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct RaidGroupConfig {
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub degraded: Vec<DegradedMemberConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RaidGroupConfig {
    pub fn new(geometry: GeometryConfig) -> Self {
        RaidGroupConfig {
            geometry,
            degraded: Vec::new(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s).map_err(|e| {
            tracing::error!(error = %e, "cannot parse raid group config");
            Error::ConfigurationInvalid("malformed YAML")
        })
    }

    pub fn to_yaml(&self) -> String {
        // Serializing plain structs of integers can't fail
        serde_yaml_ng::to_string(self).unwrap_or_default()
    }

    pub fn geometry(&self) -> Result<RaidGeometry> {
        RaidGeometry::new(self.geometry)
    }

    /// Build a tracker holding the configured degraded state
    pub fn tracker(&self, geometry: &RaidGeometry) -> Result<NrExtentTable> {
        let table = NrExtentTable::new();
        let mut seen = BTreeSet::new();
        for member in self.degraded.iter() {
            if member.position >= geometry.width() {
                return Err(Error::ConfigurationInvalid(
                    "degraded position beyond the group's width"));
            }
            if !seen.insert(member.position) {
                return Err(Error::ConfigurationInvalid(
                    "degraded position listed twice"));
            }
            let capacity = geometry.config().member_capacity;
            if member.nr_extents.iter()
                .any(|x| x.end() > capacity || x.blocks == 0)
            {
                return Err(Error::ConfigurationInvalid(
                    "NR extent outside of the member"));
            }
            if member.rebuild_logging {
                table.start_rebuild_logging(member.position);
            } else {
                table.stop_rebuild_logging(member.position,
                                           &member.nr_extents);
            }
        }
        Ok(table)
    }
}

impl RaidGroup {
    /// Assemble a raid group from its configuration
    pub fn from_config(config: &RaidGroupConfig,
                       transport: Arc<dyn FruTransport>) -> Result<Self>
    {
        let geometry = config.geometry()?;
        let tracker = config.tracker(&geometry)?;
        let pool = PagePool::new(config.pool);
        tracing::info!(raid_type = ?geometry.raid_type(),
            width = geometry.width(),
            degraded = ?tracker.degraded_positions(),
            "raid group configured");
        Ok(RaidGroup::new(geometry, Arc::new(tracker), Arc::new(pool),
                          transport, config.retry))
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;
use crate::{
    degraded::DegradedTracker,
    geometry::RaidType,
    transport::RecordingTransport,
};

const MINIMAL: &str = r#"
geometry:
  raid_type: raid5
  width: 5
  member_capacity: 65536
"#;

const DEGRADED: &str = r#"
geometry:
  raid_type: raid6
  width: 6
  member_capacity: 65536
  element_size: 64
degraded:
  - position: 1
    rebuild_logging: true
  - position: 4
    nr_extents:
      - lba: 128
        blocks: 64
        dirty: true
pool:
  min_pages: 4
  std_pages: 8
  max_pages: 2
retry:
  max_alloc_attempts: 3
"#;

#[test]
fn minimal() {
    let config = RaidGroupConfig::from_yaml(MINIMAL).unwrap();
    assert_eq!(config,
        RaidGroupConfig::new(GeometryConfig::new(RaidType::Raid5, 5, 65536)));
    let g = config.geometry().unwrap();
    assert_eq!(g.width(), 5);
    assert_eq!(g.element_size(), 128);
}

#[test]
fn degraded() {
    let config = RaidGroupConfig::from_yaml(DEGRADED).unwrap();
    assert_eq!(config.pool.max_pages, 2);
    assert_eq!(config.retry.max_alloc_attempts, 3);
    assert_eq!(config.retry.max_retries, RetryPolicy::default().max_retries);
    let g = config.geometry().unwrap();
    let tracker = config.tracker(&g).unwrap();
    assert!(tracker.is_rebuild_logging(1));
    assert!(!tracker.is_rebuild_logging(4));
    assert!(tracker.rebuild_logs_available(4));
    assert_eq!(tracker.get_nr_extent(4, 100, 100), vec![
        NrExtent::new(100, 28, false),
        NrExtent::new(128, 64, true),
        NrExtent::new(192, 8, false),
    ]);
    assert_eq!(tracker.degraded_positions(), vec![1, 4]);
}

#[test]
fn round_trip() {
    let config = RaidGroupConfig::from_yaml(DEGRADED).unwrap();
    let again = RaidGroupConfig::from_yaml(&config.to_yaml()).unwrap();
    assert_eq!(config, again);
}

#[test]
fn malformed() {
    let r = RaidGroupConfig::from_yaml("geometry: [1, 2");
    assert_eq!(r.unwrap_err(), Error::ConfigurationInvalid("malformed YAML"));
    let r = RaidGroupConfig::from_yaml("geometry:\n  raid_type: raid7\n");
    assert!(r.is_err());
}

#[test]
fn bad_geometry() {
    let config = RaidGroupConfig::new(
        GeometryConfig::new(RaidType::Raid5, 2, 65536));
    assert!(matches!(config.geometry(),
                     Err(Error::ConfigurationInvalid(_))));
}

#[test]
fn position_beyond_width() {
    let mut config = RaidGroupConfig::from_yaml(MINIMAL).unwrap();
    config.degraded.push(DegradedMemberConfig {
        position: 5,
        rebuild_logging: true,
        nr_extents: Vec::new()
    });
    let g = config.geometry().unwrap();
    assert!(config.tracker(&g).is_err());
}

#[test]
fn duplicate_position() {
    let mut config = RaidGroupConfig::from_yaml(MINIMAL).unwrap();
    let member = DegradedMemberConfig {
        position: 2,
        rebuild_logging: true,
        nr_extents: Vec::new()
    };
    config.degraded.push(member.clone());
    config.degraded.push(member);
    let g = config.geometry().unwrap();
    assert_eq!(config.tracker(&g).unwrap_err(),
        Error::ConfigurationInvalid("degraded position listed twice"));
}

#[test]
fn extent_beyond_member() {
    let mut config = RaidGroupConfig::from_yaml(MINIMAL).unwrap();
    config.degraded.push(DegradedMemberConfig {
        position: 0,
        rebuild_logging: false,
        nr_extents: vec![NrExtent::new(65500, 100, true)]
    });
    let g = config.geometry().unwrap();
    assert!(config.tracker(&g).is_err());
}

#[test]
fn from_config() {
    let config = RaidGroupConfig::from_yaml(DEGRADED).unwrap();
    let rg = RaidGroup::from_config(&config,
        Arc::new(RecordingTransport::new())).unwrap();
    assert_eq!(rg.geometry().width(), 6);
    assert!(rg.tracker().is_rebuild_logging(1));
    assert_eq!(rg.retry_policy().max_alloc_attempts, 3);
}
}
// LCOV_EXCL_STOP
