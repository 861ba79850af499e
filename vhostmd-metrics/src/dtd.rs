//! Structural stand-in for DTD validation.
//!
//! The DTD document itself is an external data dependency (see
//! [`crate::config`]'s module docs) and nothing in this project's
//! ecosystem neighborhood validates DTD content models — `DOCTYPE`
//! grammars aren't XML and no crate here parses them. What we *can* check
//! without the grammar is the part that actually matters for correctness:
//! that a present `<!DOCTYPE>` declaration names the root we expect, and
//! that the elements the rest of this crate depends on carry their
//! mandatory attributes and children.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Checks that a document's `<!DOCTYPE …>` declaration, when present,
/// names `expected_root`. A missing declaration is tolerated (plenty of
/// deployments strip it from the config file they hand-author) but a
/// declaration that names the wrong root is rejected.
pub fn check_doctype(xml: &str, expected_root: &str) -> Result<(), String> {
    let Some(start) = xml.find("<!DOCTYPE") else {
        return Ok(());
    };
    let Some(end) = xml[start..].find('>') else {
        return Err("unterminated <!DOCTYPE declaration".to_string());
    };
    let decl = &xml[start..start + end];
    let mut tokens = decl.trim_start_matches("<!DOCTYPE").split_whitespace();
    match tokens.next() {
        Some(root) if root == expected_root => Ok(()),
        Some(root) => Err(format!(
            "doctype declares root {root:?}, expected {expected_root:?}"
        )),
        None => Err("empty doctype declaration".to_string()),
    }
}

/// Validates a single `<metric>…</metric>` fragment against the shape the
/// DTD mandates: a `metric` root carrying `type` and `context` attributes,
/// with `name` and `value` children.
pub fn validate_metric_fragment(fragment: &str) -> Result<(), String> {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return Err("empty fragment".to_string());
    }

    let mut reader = Reader::from_str(trimmed);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut root_seen = false;
    let mut saw_name = false;
    let mut saw_value = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if depth == 0 {
                    if tag != "metric" {
                        return Err(format!("fragment root is {tag:?}, expected \"metric\""));
                    }
                    let has_type = e.attributes().flatten().any(|a| a.key.as_ref() == b"type");
                    let has_context = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"context");
                    if !has_type || !has_context {
                        return Err("metric element is missing type or context attribute".to_string());
                    }
                    root_seen = true;
                } else if depth == 1 {
                    match tag.as_str() {
                        "name" => saw_name = true,
                        "value" => saw_value = true,
                        _ => {}
                    }
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    return Err(format!(
                        "fragment root {tag:?} is self-closed and can carry no name/value"
                    ));
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed xml: {e}")),
            _ => {}
        }
    }

    if !root_seen {
        return Err("fragment produced no metric element".to_string());
    }
    if !saw_name || !saw_value {
        return Err("metric element is missing a name or value child".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctype_absent_is_ok() {
        assert!(check_doctype("<vhostmd><globals/></vhostmd>", "vhostmd").is_ok());
    }

    #[test]
    fn doctype_matching_root_is_ok() {
        let xml = "<!DOCTYPE vhostmd SYSTEM \"vhostmd.dtd\">\n<vhostmd/>";
        assert!(check_doctype(xml, "vhostmd").is_ok());
    }

    #[test]
    fn doctype_wrong_root_is_rejected() {
        let xml = "<!DOCTYPE metrics SYSTEM \"vhostmd.dtd\">\n<vhostmd/>";
        assert!(check_doctype(xml, "vhostmd").is_err());
    }

    #[test]
    fn well_formed_fragment_validates() {
        let xml = "<metric type='uint64' context='host'><name>UsedMem</name><value>42</value></metric>";
        assert!(validate_metric_fragment(xml).is_ok());
    }

    #[test]
    fn fragment_missing_value_is_rejected() {
        let xml = "<metric type='uint64' context='host'><name>UsedMem</name></metric>";
        assert!(validate_metric_fragment(xml).is_err());
    }

    #[test]
    fn fragment_wrong_root_is_rejected() {
        let xml = "<metrics><name>x</name><value>1</value></metrics>";
        assert!(validate_metric_fragment(xml).is_err());
    }

    #[test]
    fn fragment_missing_attributes_is_rejected() {
        let xml = "<metric><name>x</name><value>1</value></metric>";
        assert!(validate_metric_fragment(xml).is_err());
    }
}
