//! Drives the publication loop (spec.md §4.7): builds one metrics XML
//! document per tick and publishes it to every enabled transport.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::buffer::Buffer;
use crate::config::{Config, Context, Transport};
use crate::disk;
use crate::domain::{DomainSource, VmDescriptor};
use crate::error::{MetricsError, PublishError};
use crate::kv;
use crate::metric::{self, MetricState};
use crate::virtio::VirtioServer;

/// Owns everything one publication tick needs: the metric set, the
/// domain source, and a handle to each enabled transport. Built once at
/// startup and driven by [`Publisher::run`] for the process lifetime.
pub struct Publisher {
    globals_path: Option<String>,
    disk_path: PathBuf,
    disk_size: u64,
    update_period: Duration,
    transports: Vec<Transport>,
    connect_uri: Option<String>,
    metrics: Vec<MetricState>,
    domain_source: Box<dyn DomainSource>,
    virtio: Option<VirtioServer>,
    disk_file: Option<File>,
    buffer: Buffer,
}

impl Publisher {
    /// Builds the metric engine from `config` and opens the disk
    /// transport's backing file if `Transport::Vbd` is enabled. `virtio`
    /// should be `Some` when `Transport::Virtio` is enabled; the caller
    /// (the daemon binary) owns the server's lifetime since it runs its
    /// own thread.
    pub fn new(
        config: Config,
        connect_uri: Option<String>,
        domain_source: Box<dyn DomainSource>,
        virtio: Option<VirtioServer>,
    ) -> Result<Self, MetricsError> {
        if config.globals.transports.contains(&Transport::Xenstore) {
            warn!("globals/transport xenstore is accepted but not implemented; ignoring");
        }
        if config.globals.transports.contains(&Transport::Virtio) && virtio.is_none() {
            warn!("globals/transport virtio is enabled but no virtio server was started; ignoring");
        }

        let disk_file = if config.globals.transports.contains(&Transport::Vbd) {
            Some(disk::create(&config.globals.disk_path, config.globals.disk_size)?)
        } else {
            None
        };

        let metrics = config.metrics.into_iter().map(MetricState::new).collect();

        Ok(Publisher {
            globals_path: config.globals.path,
            disk_path: config.globals.disk_path,
            disk_size: config.globals.disk_size,
            update_period: config.globals.update_period,
            transports: config.globals.transports,
            connect_uri,
            metrics,
            domain_source,
            virtio,
            disk_file,
            buffer: Buffer::create(0),
        })
    }

    /// Runs ticks until `shutdown` is observed set, sleeping `update_period`
    /// between them. Connects the domain source once up front.
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> Result<(), MetricsError> {
        self.domain_source
            .connect(self.connect_uri.as_deref())
            .map_err(PublishError::DomainEnumeration)?;

        if self.transports.is_empty() {
            return Err(PublishError::NoTransportsEnabled.into());
        }

        while !shutdown.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(self.update_period);
        }
        Ok(())
    }

    /// Runs exactly one tick: evaluate every metric, assemble the
    /// document, and publish it to each enabled transport. Per-metric and
    /// per-transport failures are logged and never abort the tick.
    pub fn tick(&mut self) {
        self.buffer.erase();
        self.buffer.add_str("<metrics>\n");

        // Built alongside `self.buffer` for `virtio.update(0, ...)`: host
        // `<metric>` fragments only, no `<metrics>` wrapper, so
        // `build_response` (which supplies its own wrapper and the per-VM
        // fragments) doesn't end up nesting a whole second document and
        // every other VM's metrics into every channel's host section.
        let mut host_buffer = Buffer::create(0);

        for state in self.metrics.iter_mut().filter(|s| s.def.context == Context::Host) {
            match metric::evaluate(state, "", None, self.globals_path.as_deref()) {
                Ok(()) => {
                    metric::emit(state, None, &mut self.buffer);
                    metric::emit(state, None, &mut host_buffer);
                }
                Err(e) => warn!(metric = %state.def.name, error = %e, "host metric evaluation failed"),
            }
        }

        let vms = match self.domain_source.list_running() {
            Ok(vms) => vms,
            Err(e) => {
                error!(error = %e, "failed to enumerate running domains");
                Vec::new()
            }
        };

        let connect_arg = self
            .connect_uri
            .as_deref()
            .map(|uri| format!("--connect '{uri}'"))
            .unwrap_or_default();

        for vm in &vms {
            let mut vm_buffer = Buffer::create(0);
            for state in self.metrics.iter_mut().filter(|s| s.def.context == Context::Vm) {
                match metric::evaluate(state, &connect_arg, Some(vm), self.globals_path.as_deref()) {
                    Ok(()) => {
                        metric::emit(state, Some(vm), &mut self.buffer);
                        metric::emit(state, Some(vm), &mut vm_buffer);
                    }
                    Err(e) => {
                        warn!(metric = %state.def.name, vm = %vm.name, error = %e, "vm metric evaluation failed");
                    }
                }
            }

            if let Some(virtio) = self.virtio.as_ref() {
                if let Err(e) = virtio.update(vm.id, &vm.name, vm_buffer.as_slice()) {
                    error!(vm = %vm.name, error = %e, "virtio metrics_update failed");
                }
            }

            if let Some(domain_path) = self.domain_source.domain_path(vm.id) {
                self.publish_kv(&domain_path, vm);
            }
        }

        self.buffer.add_str("</metrics>\n");

        for transport in self.transports.clone() {
            match transport {
                Transport::Vbd => self.publish_disk(),
                Transport::Virtio => {
                    if let Some(virtio) = self.virtio.as_ref() {
                        if let Err(e) = virtio.update(0, "", host_buffer.as_slice()) {
                            error!(error = %e, "virtio host metrics_update failed");
                        }
                    }
                }
                Transport::Xenstore => {}
            }
        }
    }

    fn publish_disk(&mut self) {
        let Some(file) = self.disk_file.as_mut() else {
            warn!(path = %self.disk_path.display(), "vbd transport enabled but disk was never opened");
            return;
        };
        if let Err(e) = disk::publish(file, self.disk_size, &self.buffer) {
            error!(error = %e, "disk publish failed");
        }
    }

    /// Builds the per-domain filtered document (host metrics plus this
    /// vm's metrics by uuid match) and writes it to `<domain_path>/metrics`.
    fn publish_kv(&self, domain_path: &Path, vm: &VmDescriptor) {
        let uuid = match kv::read_uuid(domain_path) {
            Ok(uuid) => uuid,
            Err(e) => {
                debug!(vm = %vm.name, error = %e, "domain has no kv vm file, skipping kv publish");
                return;
            }
        };

        let mut filtered = Buffer::create(0);
        filtered.add_str("<metrics>\n");
        for state in self.metrics.iter().filter(|s| s.def.context == Context::Host) {
            metric::emit(state, None, &mut filtered);
        }
        if vm.uuid == uuid {
            for state in self.metrics.iter().filter(|s| s.def.context == Context::Vm) {
                metric::emit(state, Some(vm), &mut filtered);
            }
        }
        filtered.add_str("</metrics>\n");

        if let Err(e) = kv::publish(domain_path, &filtered) {
            error!(vm = %vm.name, error = %e, "kv publish failed");
        }
    }
}
