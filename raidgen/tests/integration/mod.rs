// vim: tw=80
use std::{fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use tempfile::{Builder, TempDir};

pub fn raidgen() -> Command {
    Command::cargo_bin("raidgen").unwrap()
}

/// Write a raid group configuration file
pub fn config(yaml: &str) -> (PathBuf, TempDir) {
    let tempdir = Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("rg.yaml");
    fs::write(&path, yaml).unwrap();
    (path, tempdir)
}

pub const RAID5: &str = r#"
geometry:
  raid_type: raid5
  width: 3
  member_capacity: 65536
"#;

mod flush;
mod plan;
mod simulate;
mod translate;
