//! Parses and DTD-validates the `<vhostmd>` configuration document into
//! [`Globals`] and a list of [`MetricDef`]s.
//!
//! The DTD file itself is an external data dependency (see [`crate::dtd`])
//! — we check the structural invariants a DTD mismatch would actually
//! catch (root element, mandatory children, attribute presence) rather
//! than parsing a `.dtd` grammar.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::disk::{MAX_DISK_SIZE, MIN_DISK_SIZE};
use crate::dtd;
use crate::error::ConfigError;

const DEFAULT_DISK_PATH: &str = "/dev/shm/vhostmd0";
const DEFAULT_DISK_SIZE: u64 = 256 * 1024;

/// One of the three publication mechanisms named in `globals/transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// The raw metrics block device.
    Vbd,
    /// Xen's control-plane store. Parsed for completeness; there is no
    /// Xen backend in this workspace, so this transport is accepted but
    /// never actually published to.
    Xenstore,
    /// The per-VM virtio channel pool.
    Virtio,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Vbd => "vbd",
            Transport::Xenstore => "xenstore",
            Transport::Virtio => "virtio",
        })
    }
}

impl std::str::FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vbd" => Ok(Transport::Vbd),
            "xenstore" => Ok(Transport::Xenstore),
            "virtio" => Ok(Transport::Virtio),
            other => Err(ConfigError::UnknownTransport {
                value: other.to_string(),
            }),
        }
    }
}

/// Process-wide settings from `<globals>`.
#[derive(Debug, Clone)]
pub struct Globals {
    /// Path to the raw metrics block device file.
    pub disk_path: PathBuf,
    /// Size in bytes of the metrics block device, clamped to
    /// `[MIN_DISK_SIZE, MAX_DISK_SIZE]`.
    pub disk_size: u64,
    /// How often the publication loop ticks.
    pub update_period: Duration,
    /// Overrides `PATH` for every spawned metric action, when set.
    pub path: Option<String>,
    /// Which transports are enabled. Defaults to `[Vbd]` when
    /// `globals/transport` is absent.
    pub transports: Vec<Transport>,
}

impl Default for Globals {
    fn default() -> Self {
        Globals {
            disk_path: PathBuf::from(DEFAULT_DISK_PATH),
            disk_size: DEFAULT_DISK_SIZE,
            update_period: Duration::from_secs(5),
            path: None,
            transports: vec![Transport::Vbd],
        }
    }
}

/// A metric's scalar or structural type, in its authoritative spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Int32,
    Uint32,
    Int64,
    Uint64,
    Real32,
    Real64,
    String,
    Group,
    Xml,
}

impl MetricType {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "int32" => MetricType::Int32,
            "uint32" => MetricType::Uint32,
            "int64" => MetricType::Int64,
            "uint64" => MetricType::Uint64,
            "real32" => MetricType::Real32,
            "real64" => MetricType::Real64,
            "string" => MetricType::String,
            "group" => MetricType::Group,
            "xml" => MetricType::Xml,
            _ => return None,
        })
    }

    /// The authoritative spelling, as written back into `type=` attributes.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Int32 => "int32",
            MetricType::Uint32 => "uint32",
            MetricType::Int64 => "int64",
            MetricType::Uint64 => "uint64",
            MetricType::Real32 => "real32",
            MetricType::Real64 => "real64",
            MetricType::String => "string",
            MetricType::Group => "group",
            MetricType::Xml => "xml",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a metric describes the host or one guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Host,
    Vm,
}

impl Context {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Context::Host),
            "vm" => Some(Context::Vm),
            _ => None,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Context::Host => "host",
            Context::Vm => "vm",
        })
    }
}

/// One member of a `group` metric, from a `<variable name=… type=…/>` child.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub ty: MetricType,
}

/// A metric definition, immutable for the process lifetime once loaded.
#[derive(Debug, Clone)]
pub struct MetricDef {
    /// Comma-joined member names for `group`; the single name otherwise.
    pub name: String,
    pub context: Context,
    /// The representative type (the first member's type for `group`).
    pub ty: MetricType,
    /// Comma-joined member type spellings for `group`; `ty.as_str()` otherwise.
    pub type_str: String,
    pub action: String,
    pub unit: Option<String>,
    /// Member count: > 1 only for `group`.
    pub cnt: usize,
}

/// The parsed and validated configuration document.
#[derive(Debug, Clone)]
pub struct Config {
    pub globals: Globals,
    pub metrics: Vec<MetricDef>,
}

/// Loads and parses the configuration document at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// Parses an in-memory configuration document. Exposed separately from
/// [`load`] so tests and the guest CLI (which has no file path yet) can
/// feed a document directly.
pub fn parse(xml: &str) -> Result<Config, ConfigError> {
    dtd::check_doctype(xml, "vhostmd").map_err(|reason| ConfigError::DtdValidation { reason })?;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut globals = Globals::default();
    let mut metrics = Vec::new();

    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut size_unit: Option<String> = None;
    let mut metric: Option<MetricBuilder> = None;

    loop {
        let event = reader.read_event().map_err(ConfigError::Malformed)?;
        match event {
            Event::Start(e) => {
                let name = tag_name(&e);
                if name == "metric" {
                    metric = Some(MetricBuilder::new(attr(&e, "type"), attr(&e, "context")));
                } else if name == "size" {
                    size_unit = attr(&e, "unit");
                }
                path.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                let name = tag_name(&e);
                if name == "variable" {
                    if let Some(m) = metric.as_mut() {
                        m.push_variable(attr(&e, "name"), attr(&e, "type"));
                    }
                } else if name == "transport" {
                    // `<transport/>` with no text content never appears in
                    // practice, but an empty element shouldn't crash parsing.
                }
            }
            Event::Text(t) => {
                text.push_str(&t.unescape().unwrap_or_default());
            }
            Event::CData(t) => {
                text.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Event::End(_) => {
                let name = path.pop().unwrap_or_default();
                let value = std::mem::take(&mut text);
                let parent = path.last().map(String::as_str);

                match (parent, name.as_str()) {
                    (Some("disk"), "path") => globals.disk_path = PathBuf::from(value.trim()),
                    (Some("disk"), "size") => {
                        match parse_disk_size(value.trim(), size_unit.take()) {
                            Ok(bytes) => globals.disk_size = bytes,
                            Err(e) => return Err(e),
                        }
                    }
                    (Some("globals"), "update_period") => {
                        globals.update_period = parse_update_period(value.trim())?;
                    }
                    (Some("globals"), "path") => {
                        globals.path = Some(value.trim().to_string());
                    }
                    (Some("globals"), "transport") => {
                        match value.trim().parse::<Transport>() {
                            Ok(t) => globals.transports.push(t),
                            Err(e) => return Err(e),
                        }
                    }
                    (Some("metric"), "name") => {
                        if let Some(m) = metric.as_mut() {
                            m.name = Some(value.trim().to_string());
                        }
                    }
                    (Some("metric"), "action") => {
                        if let Some(m) = metric.as_mut() {
                            m.action = Some(value.trim().to_string());
                        }
                    }
                    (Some("metric"), "unit") => {
                        if let Some(m) = metric.as_mut() {
                            m.unit = Some(value.trim().to_string());
                        }
                    }
                    (_, "metric") => {
                        if let Some(m) = metric.take() {
                            match m.finish() {
                                Ok(def) => metrics.push(def),
                                Err(reason) => warn!(reason, "skipping malformed metric"),
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    // `globals/transport` replaces the implicit default once at least one
    // is given; if none were present we keep `Globals::default()`'s `[Vbd]`.
    if globals.transports.len() > 1 {
        globals.transports.remove(0);
    }

    if !(MIN_DISK_SIZE..=MAX_DISK_SIZE).contains(&globals.disk_size) {
        return Err(ConfigError::SizeOutOfRange {
            value: globals.disk_size,
            min: MIN_DISK_SIZE,
            max: MAX_DISK_SIZE,
        });
    }

    Ok(Config { globals, metrics })
}

fn parse_disk_size(value: &str, unit: Option<String>) -> Result<u64, ConfigError> {
    let base: u64 = value.parse().map_err(|_| ConfigError::InvalidSize {
        value: value.to_string(),
    })?;
    let mult: u64 = match unit.as_deref() {
        None | Some("") => 1,
        Some("k") | Some("K") => 1024,
        Some("m") | Some("M") => 1024 * 1024,
        Some(other) => {
            return Err(ConfigError::UnknownSizeUnit {
                unit: other.to_string(),
            })
        }
    };
    base.checked_mul(mult)
        .ok_or(ConfigError::SizeOverflow { value: base, mult })
}

fn parse_update_period(value: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = value
        .parse()
        .ok()
        .filter(|&s| s > 0)
        .ok_or_else(|| ConfigError::InvalidUpdatePeriod {
            value: value.to_string(),
        })?;
    Ok(Duration::from_secs(secs))
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == key.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

/// Accumulates a `<metric>` element's children while it's being parsed.
/// Metrics with missing required fields are skipped with a warning, per
/// the configuration loader's error policy, rather than aborting the
/// whole document.
struct MetricBuilder {
    ty: Option<MetricType>,
    raw_ty: Option<String>,
    context: Option<Context>,
    raw_context: Option<String>,
    name: Option<String>,
    action: Option<String>,
    unit: Option<String>,
    variables: Vec<Variable>,
}

impl MetricBuilder {
    fn new(raw_ty: Option<String>, raw_context: Option<String>) -> Self {
        MetricBuilder {
            ty: raw_ty.as_deref().and_then(MetricType::parse),
            raw_ty,
            context: raw_context.as_deref().and_then(Context::parse),
            raw_context,
            name: None,
            action: None,
            unit: None,
            variables: Vec::new(),
        }
    }

    fn push_variable(&mut self, name: Option<String>, ty: Option<String>) {
        if let (Some(name), Some(ty)) = (name, ty.as_deref().and_then(MetricType::parse)) {
            self.variables.push(Variable { name, ty });
        }
    }

    fn finish(self) -> Result<MetricDef, String> {
        let ty = self.ty.ok_or_else(|| {
            format!(
                "unknown or missing metric type {:?}",
                self.raw_ty.unwrap_or_default()
            )
        })?;
        let context = self.context.ok_or_else(|| {
            format!(
                "unsupported or missing context {:?}",
                self.raw_context.unwrap_or_default()
            )
        })?;
        let action = self.action.ok_or_else(|| "metric is missing action".to_string())?;
        let name = self.name.ok_or_else(|| "metric is missing name".to_string())?;

        if ty == MetricType::Group {
            if self.variables.is_empty() {
                return Err("group metric has no variable children".to_string());
            }
            let names = self
                .variables
                .iter()
                .map(|v| v.name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let types = self
                .variables
                .iter()
                .map(|v| v.ty.as_str())
                .collect::<Vec<_>>()
                .join(",");
            Ok(MetricDef {
                name: names,
                context,
                ty: self.variables[0].ty,
                type_str: types,
                action,
                unit: self.unit,
                cnt: self.variables.len(),
            })
        } else {
            Ok(MetricDef {
                name,
                context,
                ty,
                type_str: ty.as_str().to_string(),
                action,
                unit: self.unit,
                cnt: 1,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
<vhostmd>
  <globals>
    <disk>
      <path>/dev/shm/vhostmd0</path>
      <size unit="M">2</size>
    </disk>
    <update_period>5</update_period>
    <transport>vbd</transport>
    <transport>virtio</transport>
  </globals>
  <metrics>
    <metric type="uint64" context="host">
      <name>UsedMem</name>
      <action>echo 42</action>
    </metric>
    <metric type="group" context="host">
      <name>MemInfo</name>
      <action>echo "10,20"</action>
      <variable name="Used" type="uint64"/>
      <variable name="Free" type="uint64"/>
    </metric>
  </metrics>
</vhostmd>
"#;

    #[test]
    fn parses_globals() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.globals.disk_path, PathBuf::from("/dev/shm/vhostmd0"));
        assert_eq!(cfg.globals.disk_size, 2 * 1024 * 1024);
        assert_eq!(cfg.globals.update_period, Duration::from_secs(5));
        assert_eq!(cfg.globals.transports, vec![Transport::Vbd, Transport::Virtio]);
    }

    #[test]
    fn parses_scalar_metric() {
        let cfg = parse(SAMPLE).unwrap();
        let m = cfg.metrics.iter().find(|m| m.name == "UsedMem").unwrap();
        assert_eq!(m.ty, MetricType::Uint64);
        assert_eq!(m.context, Context::Host);
        assert_eq!(m.action, "echo 42");
        assert_eq!(m.cnt, 1);
    }

    #[test]
    fn parses_group_metric() {
        let cfg = parse(SAMPLE).unwrap();
        let m = cfg.metrics.iter().find(|m| m.name.starts_with("Used")).unwrap();
        assert_eq!(m.name, "Used,Free");
        assert_eq!(m.type_str, "uint64,uint64");
        assert_eq!(m.cnt, 2);
    }

    #[test]
    fn unknown_metric_type_is_skipped_not_fatal() {
        let xml = r#"<vhostmd><globals><disk><path>p</path><size>1</size></disk>
            <update_period>1</update_period></globals>
            <metrics><metric type="bogus" context="host"><name>n</name><action>a</action></metric></metrics></vhostmd>"#;
        let cfg = parse(xml).unwrap();
        assert!(cfg.metrics.is_empty());
    }

    #[test]
    fn missing_action_is_skipped_not_fatal() {
        let xml = r#"<vhostmd><globals><disk><path>p</path><size>1</size></disk>
            <update_period>1</update_period></globals>
            <metrics><metric type="uint64" context="host"><name>n</name></metric></metrics></vhostmd>"#;
        let cfg = parse(xml).unwrap();
        assert!(cfg.metrics.is_empty());
    }

    #[test]
    fn size_overflow_is_an_error() {
        let result = parse_disk_size(&u64::MAX.to_string(), Some("M".to_string()));
        assert!(matches!(result, Err(ConfigError::SizeOverflow { .. })));
    }

    #[test]
    fn unknown_size_unit_is_an_error() {
        let result = parse_disk_size("10", Some("G".to_string()));
        assert!(matches!(result, Err(ConfigError::UnknownSizeUnit { .. })));
    }

    #[test]
    fn default_transport_is_vbd() {
        let xml = r#"<vhostmd><globals><disk><path>p</path><size>1024</size></disk>
            <update_period>1</update_period></globals><metrics/></vhostmd>"#;
        let cfg = parse(xml).unwrap();
        assert_eq!(cfg.globals.transports, vec![Transport::Vbd]);
    }

    #[test]
    fn mismatched_doctype_is_fatal() {
        let xml = "<!DOCTYPE metrics SYSTEM \"vhostmd.dtd\">\n<vhostmd><globals><disk><path>p</path><size>1024</size></disk><update_period>1</update_period></globals><metrics/></vhostmd>";
        assert!(matches!(parse(xml), Err(ConfigError::DtdValidation { .. })));
    }
}
