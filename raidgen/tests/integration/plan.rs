// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;

use super::{config, raidgen, RAID5};

#[test]
fn small_write() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["plan"])
        .arg(&path)
        .args(["write", "0", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("algorithm: R5_MR3"));
}

#[test]
fn three_siots() {
    let (path, _tempdir) = config(RAID5);
    let out = raidgen()
        .args(["plan"])
        .arg(&path)
        .args(["read", "100", "500"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert_eq!(stdout.matches("- lba:").count(), 3);
}

#[test]
fn pre_read() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["plan"])
        .arg(&path)
        .args(["write", "5", "5", "--pre-read", "0,256"])
        .assert()
        .success()
        .stdout(predicate::str::contains("algorithm: R5_MR3"));
}

#[test]
fn degraded() {
    let (path, _tempdir) = config(r#"
geometry:
  raid_type: raid5
  width: 3
  member_capacity: 65536
degraded:
  - position: 1
    rebuild_logging: true
"#);
    raidgen()
        .args(["plan"])
        .arg(&path)
        .args(["read", "128", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("algorithm: R5_DEG_RD"))
        .stdout(predicate::str::contains("dead_pos: 1"));
}

/// An unaligned degraded write journals to the write log first
#[test]
fn write_logged() {
    let (path, _tempdir) = config(r#"
geometry:
  raid_type: raid5
  width: 3
  member_capacity: 65536
  write_log_slots: 4
degraded:
  - position: 1
    rebuild_logging: true
"#);
    raidgen()
        .args(["plan"])
        .arg(&path)
        .args(["write", "0", "200"])
        .assert()
        .success()
        .stdout(predicate::str::contains("algorithm: R5_468"))
        .stdout(predicate::str::contains("write_logged: true"));
}

#[rstest]
#[case(&["read", "0", "0"], "InvalidRequest")]
#[case(&["read", "1000000", "1"], "InvalidRequest")]
#[case(&["write", "0", "1", "--pre-read", "0"], "LBA,BLOCKS")]
fn invalid(#[case] args: &[&str], #[case] msg: &str) {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["plan"])
        .arg(&path)
        .args(args)
        .assert()
        .failure()
        .stderr(predicate::str::contains(msg));
}

#[test]
fn missing_config() {
    raidgen()
        .args(["plan", "/nonexistent/rg.yaml", "read", "0", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/rg.yaml"));
}

#[test]
fn bad_config() {
    let (path, _tempdir) =
        config("geometry:\n  raid_type: raid5\n  width: 2\n");
    raidgen()
        .args(["plan"])
        .arg(&path)
        .args(["read", "0", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ConfigurationInvalid"));
}
