//! Enumerates running VMs and resolves a numeric id to `(name, uuid)`.
//!
//! This is the one external collaborator this crate implements a real
//! default for rather than just a trait: most hosts running this daemon
//! talk to libvirt, so [`LibvirtDomainSource`] is built in behind the
//! `libvirt` feature (on by default) using the `virt` crate's bindings.
//! [`NullDomainSource`] backs host-metrics-only deployments and tests.

use std::path::PathBuf;

/// A running virtual machine as known to the hypervisor, scoped to the
/// duration of one publication tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDescriptor {
    pub id: u32,
    pub name: String,
    pub uuid: String,
}

/// Enumerates domains and resolves per-domain paths, kept behind a trait
/// so the publication loop and guest reader don't depend on a particular
/// hypervisor client.
pub trait DomainSource: Send {
    /// Opens (or re-opens) the hypervisor connection. `uri` is the
    /// `-c/--connect` value, or `None` to use the default connection.
    fn connect(&mut self, uri: Option<&str>) -> std::io::Result<()>;

    /// Lists the VMs currently running.
    fn list_running(&mut self) -> std::io::Result<Vec<VmDescriptor>>;

    /// Resolves a domain's key/value store path, for the T-KV transport.
    /// Returns `None` when this source has no KV-addressable backing
    /// (e.g. the null source).
    fn domain_path(&self, id: u32) -> Option<PathBuf>;
}

/// A domain source with nothing running. Used for host-metrics-only
/// daemons and in tests that don't want to talk to a real hypervisor.
#[derive(Debug, Default)]
pub struct NullDomainSource;

impl DomainSource for NullDomainSource {
    fn connect(&mut self, _uri: Option<&str>) -> std::io::Result<()> {
        Ok(())
    }

    fn list_running(&mut self) -> std::io::Result<Vec<VmDescriptor>> {
        Ok(Vec::new())
    }

    fn domain_path(&self, _id: u32) -> Option<PathBuf> {
        None
    }
}

#[cfg(feature = "libvirt")]
pub use libvirt_source::LibvirtDomainSource;

#[cfg(feature = "libvirt")]
mod libvirt_source {
    use super::{DomainSource, VmDescriptor};
    use std::io;
    use std::path::PathBuf;
    use virt::connect::Connect;

    /// A [`DomainSource`] backed by a live libvirt connection.
    pub struct LibvirtDomainSource {
        conn: Option<Connect>,
        kv_root: PathBuf,
    }

    impl LibvirtDomainSource {
        /// `kv_root` is the directory under which each domain gets a
        /// `<kv_root>/<uuid>/{vm,metrics}` pair for the T-KV transport.
        pub fn new(kv_root: PathBuf) -> Self {
            LibvirtDomainSource { conn: None, kv_root }
        }
    }

    impl DomainSource for LibvirtDomainSource {
        fn connect(&mut self, uri: Option<&str>) -> io::Result<()> {
            let conn = Connect::open(uri)
                .map_err(|e| io::Error::other(format!("libvirt connect failed: {e}")))?;
            self.conn = Some(conn);
            Ok(())
        }

        fn list_running(&mut self) -> io::Result<Vec<VmDescriptor>> {
            let conn = self
                .conn
                .as_ref()
                .ok_or_else(|| io::Error::other("not connected to libvirt"))?;

            let domains = conn
                .list_all_domains(virt::connect::VIR_CONNECT_LIST_DOMAINS_ACTIVE)
                .map_err(|e| io::Error::other(format!("list_all_domains failed: {e}")))?;

            let mut out = Vec::with_capacity(domains.len());
            for dom in domains {
                let id = dom.get_id().unwrap_or(0);
                let name = dom
                    .get_name()
                    .map_err(|e| io::Error::other(format!("get_name failed: {e}")))?;
                let uuid = dom
                    .get_uuid_string()
                    .map_err(|e| io::Error::other(format!("get_uuid_string failed: {e}")))?;
                out.push(VmDescriptor { id, name, uuid });
            }
            Ok(out)
        }

        fn domain_path(&self, id: u32) -> Option<PathBuf> {
            // The KV root is keyed by domain id the same way the virtio
            // channel pool is: both identify a running VM by its
            // hypervisor-assigned numeric id for the duration of a tick.
            Some(self.kv_root.join(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_source_has_no_domains() {
        let mut src = NullDomainSource;
        assert!(src.connect(None).is_ok());
        assert_eq!(src.list_running().unwrap(), Vec::new());
        assert_eq!(src.domain_path(1), None);
    }
}
