//! Integration test for the virtio channel pool transport (T-VIRTIO).
//!
//! Stands in for the host virtualization stack: binds a `UnixListener` at
//! the discovery path a running domain's channel socket would occupy, lets
//! the reactor discover and connect to it, then plays the guest side of the
//! protocol (send the request line, read the response) the way
//! `vm-dump-metrics` would on the other end of the virtio-serial port.

use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::time::Duration;

use tempfile::tempdir;
use vhostmd_metrics::virtio::{VirtioConfig, VirtioServer};

#[test]
fn discovered_channel_serves_host_and_vm_metrics() {
    let dir = tempdir().unwrap();
    let domain_dir = dir.path().join("domain-7-guest0");
    std::fs::create_dir_all(&domain_dir).unwrap();
    let socket_path = domain_dir.join("org.github.vhostmd.1");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let config = VirtioConfig {
        channel_dir: dir.path().to_path_buf(),
        channel_name: "org.github.vhostmd.1".to_string(),
        channel_max: 4,
        idle_ttl: Duration::from_secs(30),
    };
    let server = VirtioServer::start(config).unwrap();

    // `update` allocates domain 7's slot before the reactor ever sees it on
    // disk; discovery only connects channels it already has a slot for (or
    // that `update` creates), so the publication side always calls this
    // first in production, too.
    server.update(0, "", b"<metric><name>UsedMem</name><value>999</value></metric>\n").unwrap();
    server.update(7, "guest0", b"<metric><name>Vcpus</name><value>2</value></metric>\n").unwrap();

    // Accept the reactor's outbound connection: in production this is the
    // virtualization stack's end of the channel, forwarded into the guest.
    // Discovery runs on a multi-second tick, so this may block briefly.
    let (mut guest_side, _) = listener.accept().unwrap();
    guest_side.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    guest_side.write_all(b"GET /metrics/XML\n\n").unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = guest_side.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.ends_with(b"\n\n") {
            break;
        }
    }
    let response = String::from_utf8(response).unwrap();

    assert!(response.contains("<name>UsedMem</name><value>999</value>"));
    assert!(response.contains("<name>Vcpus</name><value>2</value>"));

    server.stop();
}

#[test]
fn malformed_request_gets_invalid_response() {
    let dir = tempdir().unwrap();
    let domain_dir = dir.path().join("domain-1-guest1");
    std::fs::create_dir_all(&domain_dir).unwrap();
    let socket_path = domain_dir.join("org.github.vhostmd.1");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let config = VirtioConfig {
        channel_dir: dir.path().to_path_buf(),
        channel_name: "org.github.vhostmd.1".to_string(),
        channel_max: 4,
        idle_ttl: Duration::from_secs(30),
    };
    let server = VirtioServer::start(config).unwrap();
    server.update(1, "guest1", b"<metric><name>Vcpus</name><value>1</value></metric>\n").unwrap();

    let (mut guest_side, _) = listener.accept().unwrap();
    guest_side.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    guest_side.write_all(b"GARBAGE\n\n").unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = guest_side.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.ends_with(b"\n\n") {
            break;
        }
    }
    assert_eq!(response, b"INVALID REQUEST\n\n");

    server.stop();
}
