//! The key/value store transport (T-KV): one directory per domain holding
//! a `vm` file (the domain's uuid) and a `metrics` file this module
//! overwrites every tick with host metrics plus that domain's vm metrics.
//!
//! There's no block device or channel pool here, so publishing is just
//! "read the uuid, build the filtered document, write it" — the simplest
//! of the three transports.

use std::path::{Path, PathBuf};

use crate::buffer::Buffer;
use crate::error::KvError;

const VM_FILE: &str = "vm";
const METRICS_FILE: &str = "metrics";

/// Reads `<domain_path>/vm` and returns the uuid it contains, trimmed of
/// surrounding whitespace.
pub fn read_uuid(domain_path: &Path) -> Result<String, KvError> {
    let path = domain_path.join(VM_FILE);
    let text = std::fs::read_to_string(&path).map_err(|source| KvError::ReadUuid {
        path: path.clone(),
        source,
    })?;
    Ok(text.trim().to_string())
}

/// Writes `<domain_path>/metrics`, replacing its previous content. `body`
/// is the already-assembled `<metrics>…</metrics>` document.
pub fn publish(domain_path: &Path, body: &Buffer) -> Result<(), KvError> {
    let path = domain_path.join(METRICS_FILE);
    std::fs::write(&path, body.as_slice()).map_err(|source| KvError::WriteMetrics { path, source })
}

/// Reads `<domain_path>/metrics` verbatim, for the guest-side KV read path.
pub fn read_metrics(domain_path: &Path) -> Result<Vec<u8>, KvError> {
    let path = domain_path.join(METRICS_FILE);
    std::fs::read(&path).map_err(|source| KvError::ReadMetrics { path, source })
}

/// `<domain_path>/vm`'s path, for callers that want to check existence
/// before attempting a read (e.g. to decide whether a domain is
/// KV-addressable at all).
pub fn vm_file(domain_path: &Path) -> PathBuf {
    domain_path.join(VM_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_uuid_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VM_FILE), "  1234-5678  \n").unwrap();
        assert_eq!(read_uuid(dir.path()).unwrap(), "1234-5678");
    }

    #[test]
    fn read_uuid_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_uuid(dir.path()).is_err());
    }

    #[test]
    fn publish_writes_metrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = Buffer::create(0);
        body.add_str("<metrics><metric/></metrics>\n");
        publish(dir.path(), &body).unwrap();
        let written = std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(written, "<metrics><metric/></metrics>\n");
    }

    #[test]
    fn publish_overwrites_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METRICS_FILE), "stale").unwrap();
        let mut body = Buffer::create(0);
        body.add_str("fresh");
        publish(dir.path(), &body).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap(), "fresh");
    }
}
