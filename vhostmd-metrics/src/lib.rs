//! # vhostmd-metrics
//!
//! Host-side metrics publisher and guest-side reader for a virtualization
//! host. A long-running host daemon periodically samples host- and per-VM
//! metrics by running configured shell actions, serializes them as XML, and
//! publishes the result over up to three transports: a raw metrics block
//! device, a per-VM virtio UNIX-domain-socket channel pool, and a key/value
//! store entry per domain. A guest-side client retrieves and parses that
//! XML back.
//!
//! ## Modules
//!
//! - [`buffer`] — the growable byte buffer every other module builds on.
//! - [`config`] — parses and DTD-validates the `<vhostmd>` configuration
//!   document into [`config::Globals`] and a list of [`config::MetricDef`]s.
//! - [`domain`] — the [`domain::DomainSource`] trait enumerating running
//!   VMs, plus a libvirt-backed and a null implementation.
//! - [`metric`] — evaluates a metric definition (runs its action, parses
//!   its output) and emits the resulting `<metric>` XML.
//! - [`disk`] — the raw metrics block device transport.
//! - [`virtio`] — the epoll-driven virtio channel pool transport.
//! - [`kv`] — the key/value store transport.
//! - [`publish`] — the publication loop tying metrics and transports
//!   together on a fixed period.
//! - [`guest`] — the guest-side reader: disk/virtio/kv retrieval and
//!   single-metric lookup.
//! - [`dtd`] — structural stand-ins for DTD validation (see its module
//!   docs for why this isn't a real DTD parser).
//! - [`error`] — the crate-wide error types.

pub mod buffer;
pub mod config;
pub mod disk;
pub mod domain;
pub mod dtd;
pub mod error;
pub mod guest;
pub mod kv;
pub mod metric;
pub mod publish;
pub mod virtio;

pub use error::{MetricsError, Result};
