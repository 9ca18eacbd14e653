// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::{config, raidgen, RAID5};

const LOGGED_RAID5: &str = r#"
geometry:
  raid_type: raid5
  width: 3
  member_capacity: 65536
  write_log_slots: 4
"#;

/// After a restart every slot's header is read from every member
#[test]
fn every_slot() {
    let (path, _tempdir) = config(LOGGED_RAID5);
    raidgen()
        .args(["flush"])
        .arg(&path)
        .arg("--requests")
        .assert()
        .success()
        .stdout(predicate::str::contains("lba: 65536"))
        .stdout(predicate::str::contains("lba: 65923"))
        .stdout(predicate::str::contains("flushed: 4"));
}

#[test]
fn no_write_log() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["flush"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("flushed: 0"));
}

#[test]
fn mirror_write_log() {
    let (path, _tempdir) = config(r#"
geometry:
  raid_type: raid1
  width: 2
  member_capacity: 65536
  write_log_slots: 4
"#);
    raidgen()
        .args(["flush"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("write log"));
}
