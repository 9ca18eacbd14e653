// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::{config, raidgen, RAID5};

#[test]
fn write() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["simulate"])
        .arg(&path)
        .args(["write", "0", "1", "--requests"])
        .assert()
        .success()
        .stdout(predicate::str::contains("opcode: Read"))
        .stdout(predicate::str::contains("opcode: Write"))
        .stdout(predicate::str::contains("algorithm: R5_MR3"));
}

#[test]
fn dead_member() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["simulate"])
        .arg(&path)
        .args(["read", "0", "256", "--fail", "0:dead"])
        .assert()
        .success()
        .stdout(predicate::str::contains("algorithm: R5_DEG_RD"))
        .stdout(predicate::str::contains("dead_pos: 0"));
}

#[test]
fn two_dead_members() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["simulate"])
        .arg(&path)
        .args(["read", "0", "256", "--fail", "0:dead", "--fail", "1:dead"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MemberIo("));
}

#[test]
fn ride_through() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["simulate"])
        .arg(&path)
        .args(["read", "0", "256", "--fail-once", "1:retryable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("algorithm: R5_RD"));
}

#[test]
fn bad_fault() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["simulate"])
        .arg(&path)
        .args(["read", "0", "256", "--fail", "0:sleepy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown status"));
}
