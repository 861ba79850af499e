//! Integration tests for the raw metrics block device transport (T-DISK).
//!
//! Exercises the full create -> publish -> read round trip through real
//! files on disk, the way a host daemon and a guest reader would see it,
//! rather than unit-testing the header encoding in isolation.

use tempfile::tempdir;
use vhostmd_metrics::buffer::Buffer;
use vhostmd_metrics::disk;

#[test]
fn publish_then_read_round_trips_payload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vhostmd0");

    let mut file = disk::create(&path, 4096).unwrap();

    let mut payload = Buffer::create(0);
    payload.add_str("<metrics><metric type='uint64' context='host'><name>UsedMem</name><value>123</value></metric></metrics>\n");
    disk::publish(&mut file, 4096, &payload).unwrap();

    let mut out = Buffer::create(0);
    disk::read_no_direct(&path, &mut out).unwrap();
    assert_eq!(out.as_slice(), payload.as_slice());
}

#[test]
fn republish_overwrites_previous_payload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vhostmd0");
    let mut file = disk::create(&path, 4096).unwrap();

    let mut first = Buffer::create(0);
    first.add_str("<metrics><metric type='uint64' context='host'><name>X</name><value>1</value></metric></metrics>\n");
    disk::publish(&mut file, 4096, &first).unwrap();

    let mut second = Buffer::create(0);
    second.add_str("<metrics><metric type='uint64' context='host'><name>X</name><value>2</value></metric></metrics>\n");
    disk::publish(&mut file, 4096, &second).unwrap();

    let mut out = Buffer::create(0);
    disk::read_no_direct(&path, &mut out).unwrap();
    assert_eq!(out.as_slice(), second.as_slice());
}

#[test]
fn read_before_first_publish_reports_bad_signature() {
    // `create` leaves the header unsigned (busy=1, no magic) until the
    // first `publish`; a reader arriving before that point gets a clear
    // error rather than a silently empty document.
    let dir = tempdir().unwrap();
    let path = dir.path().join("vhostmd0");
    disk::create(&path, 4096).unwrap();

    let mut out = Buffer::create(0);
    assert!(disk::read_no_direct(&path, &mut out).is_err());
}

#[test]
fn publish_rejects_payload_larger_than_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vhostmd0");
    let mut file = disk::create(&path, disk::MIN_DISK_SIZE).unwrap();

    let mut huge = Buffer::create(0);
    huge.add(&vec![b'x'; disk::MIN_DISK_SIZE as usize * 2]);
    assert!(disk::publish(&mut file, disk::MIN_DISK_SIZE, &huge).is_err());
}
