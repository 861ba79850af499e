//! Evaluates metric definitions: substitutes `CONNECT`/`NAME`/`VMID`/`UUID`
//! into the action template, runs the action as a shell command, and
//! renders the result into one or more `<metric>` XML elements.

use std::process::{Command, Stdio};

use crate::buffer::Buffer;
use crate::config::{Context, MetricDef, MetricType};
use crate::domain::VmDescriptor;
use crate::dtd;
use crate::error::MetricError;

const SCALAR_VALUE_LIMIT: usize = 256;
const XML_VALUE_LIMIT: usize = 2048;

/// Action string pre-split into literal runs and named holes, built once
/// at registration time so a tick never re-scans the action string.
#[derive(Debug, Clone)]
struct ActionTemplate {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Connect,
    Name,
    Vmid,
    Uuid,
}

impl ActionTemplate {
    fn compile(action: &str) -> Self {
        const TOKENS: [&str; 4] = ["CONNECT", "NAME", "VMID", "UUID"];
        let mut segments = Vec::new();
        let mut rest = action;
        loop {
            let hit = TOKENS
                .iter()
                .filter_map(|tok| rest.find(tok).map(|idx| (idx, *tok)))
                .min_by_key(|(idx, _)| *idx);
            match hit {
                Some((idx, tok)) => {
                    if idx > 0 {
                        segments.push(Segment::Literal(rest[..idx].to_string()));
                    }
                    segments.push(match tok {
                        "CONNECT" => Segment::Connect,
                        "NAME" => Segment::Name,
                        "VMID" => Segment::Vmid,
                        _ => Segment::Uuid,
                    });
                    rest = &rest[idx + tok.len()..];
                }
                None => {
                    if !rest.is_empty() {
                        segments.push(Segment::Literal(rest.to_string()));
                    }
                    break;
                }
            }
        }
        ActionTemplate { segments }
    }

    fn render(&self, connect: &str, vm: Option<&VmDescriptor>) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Connect => out.push_str(connect),
                Segment::Name => out.push_str(vm.map_or("", |v| v.name.as_str())),
                Segment::Vmid => {
                    if let Some(vm) = vm {
                        out.push_str(&vm.id.to_string());
                    }
                }
                Segment::Uuid => out.push_str(vm.map_or("", |v| v.uuid.as_str())),
            }
        }
        out
    }
}

/// A metric definition paired with its compiled template and reusable
/// value storage. One of these is built per [`MetricDef`] at registration
/// and lives for the process lifetime; `value` is erased and overwritten
/// every tick, never freed.
pub struct MetricState {
    pub def: MetricDef,
    template: ActionTemplate,
    value: Buffer,
}

impl MetricState {
    pub fn new(def: MetricDef) -> Self {
        let template = ActionTemplate::compile(&def.action);
        let limit = value_limit(def.ty);
        MetricState {
            def,
            template,
            value: Buffer::create(limit),
        }
    }
}

fn value_limit(ty: MetricType) -> usize {
    if ty == MetricType::Xml {
        XML_VALUE_LIMIT
    } else {
        SCALAR_VALUE_LIMIT
    }
}

/// Evaluates `state`'s action (substituting `CONNECT`/`NAME`/`VMID`/`UUID`)
/// and stores the command's stdout into `state`'s reusable value buffer.
/// `vm` must be `Some` for vm-context metrics and `None` for host-context
/// ones. `path_override` comes from `globals/path` and replaces `PATH` for
/// the spawned command when set.
pub fn evaluate(
    state: &mut MetricState,
    connect: &str,
    vm: Option<&VmDescriptor>,
    path_override: Option<&str>,
) -> Result<(), MetricError> {
    state.value.erase();

    let command_line = state.template.render(connect, vm);

    let mut command = Command::new("sh");
    command.arg("-c").arg(&command_line);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());
    if let Some(path) = path_override {
        command.env("PATH", path);
    }

    let output = command.output().map_err(|source| MetricError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(MetricError::NonZeroExit {
            command: command_line,
            status: output.status.code().unwrap_or(-1),
        });
    }

    let limit = value_limit(state.def.ty);
    let mut stdout = output.stdout;
    if stdout.last() == Some(&b'\n') {
        stdout.pop();
    }
    if stdout.len() > limit {
        stdout.truncate(limit);
    }

    if state.def.ty == MetricType::Xml {
        let text = String::from_utf8_lossy(&stdout).into_owned();
        for fragment in split_metric_fragments(&text) {
            dtd::validate_metric_fragment(fragment).map_err(|reason| {
                MetricError::FragmentValidation {
                    name: state.def.name.clone(),
                    reason,
                }
            })?;
        }
    }

    state.value.add(&stdout);
    Ok(())
}

/// Splits a raw xml-metric action's stdout into successive
/// `<metric>…</metric>` fragments.
fn split_metric_fragments(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    let mut offset = 0usize;
    while let Some(start_rel) = rest.find("<metric") {
        let Some(end_rel) = rest[start_rel..].find("</metric>") else {
            break;
        };
        let end_rel = start_rel + end_rel + "</metric>".len();
        out.push(&text[offset + start_rel..offset + end_rel]);
        rest = &rest[end_rel..];
        offset += end_rel;
    }
    out
}

/// Emits one `<metric>` XML element per member of `state.def` (`cnt`
/// members total) into `out`.
pub fn emit(state: &MetricState, vm: Option<&VmDescriptor>, out: &mut Buffer) {
    let def = &state.def;

    if def.ty == MetricType::Xml {
        out.add(state.value.as_slice());
        out.add_str("\n");
        return;
    }

    let value_text = String::from_utf8_lossy(state.value.as_slice()).into_owned();
    let names = split_tokens(&def.name, def.cnt);
    let types = split_tokens(&def.type_str, def.cnt);
    let values = split_tokens(&value_text, def.cnt);

    for i in 0..def.cnt {
        out.add_str("<metric type='");
        out.add_str(types[i]);
        out.add_str("' context='");
        out.add_str(match def.context {
            Context::Host => "host",
            Context::Vm => "vm",
        });
        out.add_str("'");
        if def.context == Context::Vm {
            if let Some(vm) = vm {
                out.vsprintf(format_args!(" id='{}' uuid='{}'", vm.id, vm.uuid));
            }
        }
        if let Some(unit) = def.unit.as_deref().filter(|u| !u.is_empty()) {
            out.add_str(" unit='");
            out.add_str(unit);
            out.add_str("'");
        }
        out.add_str(">\n  <name>");
        out.add_str(names[i]);
        out.add_str("</name>\n  <value>");
        out.add_str(values[i]);
        out.add_str("</value>\n</metric>\n");
    }
}

/// Splits `s` on commas into exactly `cnt` tokens. If `s` has fewer than
/// `cnt - 1` delimiters the whole string is yielded for every index; an
/// empty string yields empty tokens.
fn split_tokens(s: &str, cnt: usize) -> Vec<&str> {
    if cnt <= 1 {
        return vec![s];
    }
    let parts: Vec<&str> = s.splitn(cnt, ',').collect();
    if parts.len() < cnt {
        vec![s; cnt]
    } else {
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, ty: MetricType, context: Context, action: &str, cnt: usize) -> MetricDef {
        MetricDef {
            name: name.to_string(),
            context,
            ty,
            type_str: ty.as_str().to_string(),
            action: action.to_string(),
            unit: None,
            cnt,
        }
    }

    #[test]
    fn template_substitutes_all_tokens_for_vm_context() {
        let tpl = ActionTemplate::compile("virsh CONNECT dominfo VMID # NAME UUID");
        let vm = VmDescriptor {
            id: 7,
            name: "web1".into(),
            uuid: "uuid-1".into(),
        };
        let rendered = tpl.render("--connect 'qemu:///system'", Some(&vm));
        assert_eq!(
            rendered,
            "virsh --connect 'qemu:///system' dominfo 7 # web1 uuid-1"
        );
    }

    #[test]
    fn template_host_context_leaves_vm_tokens_empty() {
        let tpl = ActionTemplate::compile("echo NAME-VMID");
        let rendered = tpl.render("", None);
        assert_eq!(rendered, "echo -");
    }

    #[test]
    fn evaluate_scalar_metric_reads_stdout() {
        let mut state = MetricState::new(def("UsedMem", MetricType::Uint64, Context::Host, "echo 42", 1));
        evaluate(&mut state, "", None, None).unwrap();
        assert_eq!(state.value.as_slice(), b"42");
    }

    #[test]
    fn evaluate_nonzero_exit_is_an_error() {
        let mut state = MetricState::new(def("Bad", MetricType::Uint64, Context::Host, "false", 1));
        assert!(evaluate(&mut state, "", None, None).is_err());
    }

    #[test]
    fn evaluate_truncates_to_scalar_limit() {
        let mut state = MetricState::new(def(
            "Big",
            MetricType::String,
            Context::Host,
            "yes | head -c 1000",
            1,
        ));
        evaluate(&mut state, "", None, None).unwrap();
        assert!(state.value.len() <= SCALAR_VALUE_LIMIT);
    }

    #[test]
    fn emit_group_metric_produces_cnt_elements() {
        let mut state = MetricState::new(def(
            "Used,Free",
            MetricType::Uint64,
            Context::Host,
            "echo '10,20'",
            2,
        ));
        state.def.type_str = "uint64,uint64".to_string();
        evaluate(&mut state, "", None, None).unwrap();
        let mut out = Buffer::create(0);
        emit(&state, None, &mut out);
        let xml = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert_eq!(xml.matches("<metric").count(), 2);
        assert!(xml.contains("<name>Used</name>"));
        assert!(xml.contains("<value>10</value>"));
        assert!(xml.contains("<name>Free</name>"));
        assert!(xml.contains("<value>20</value>"));
    }

    #[test]
    fn split_tokens_short_string_repeats_whole_value() {
        assert_eq!(split_tokens("same", 3), vec!["same", "same", "same"]);
    }

    #[test]
    fn split_tokens_reconstructs_with_commas() {
        let s = "a,b,c";
        let cnt = s.matches(',').count() + 1;
        let tokens = split_tokens(s, cnt);
        assert_eq!(tokens.join(","), s);
    }

    #[test]
    fn xml_metric_rejects_fragment_missing_context_attribute() {
        let mut state = MetricState::new(def(
            "Custom",
            MetricType::Xml,
            Context::Host,
            "echo '<metric type=\"uint64\"><name>x</name><value>1</value></metric>'",
            1,
        ));
        assert!(evaluate(&mut state, "", None, None).is_err());
    }

    #[test]
    fn xml_metric_accepts_well_formed_fragment() {
        let mut state = MetricState::new(def(
            "Custom",
            MetricType::Xml,
            Context::Host,
            "echo '<metric type=\"uint64\" context=\"host\"><name>x</name><value>1</value></metric>'",
            1,
        ));
        assert!(evaluate(&mut state, "", None, None).is_ok());
    }
}
