// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::{config, raidgen, RAID5};

#[test]
fn rotated_parity() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["translate"])
        .arg(&path)
        .args(["300"])
        .assert()
        .success()
        .stdout(predicate::str::contains("position: 2"))
        .stdout(predicate::str::contains("member_lba: 172"))
        .stdout(predicate::str::contains("parity_stripe: 1"))
        .stdout(predicate::str::contains("redundant_positions: [1]"));
}

#[test]
fn several() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["translate"])
        .arg(&path)
        .args(["0", "128", "256"])
        .assert()
        .success()
        .stdout(predicate::str::contains("- lba: 0"))
        .stdout(predicate::str::contains("- lba: 128"))
        .stdout(predicate::str::contains("- lba: 256"));
}

#[test]
fn beyond_capacity() {
    let (path, _tempdir) = config(RAID5);
    raidgen()
        .args(["translate"])
        .arg(&path)
        .args(["131072"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("beyond the end of the group"));
}
