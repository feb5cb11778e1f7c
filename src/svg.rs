//! Preparing d2's standalone SVG documents for inlining into HTML.

use anyhow::{bail, Result};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};

/// Strips namespaces and labels the root `<svg>` for assistive technology
///
/// Element and attribute prefixes are dropped along with every `xmlns`
/// declaration, as are the XML declaration and doctype. The outermost
/// element receives `role="img"` and an `aria-label` holding `label`.
pub fn inline_svg(svg: &str, label: &str) -> Result<String> {
    let mut reader = Reader::from_str(svg);
    let mut writer = Writer::new(Vec::with_capacity(svg.len()));
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(elem)) => {
                let elem = strip_element(&elem, depth == 0, label)?;
                depth += 1;
                writer.write_event(Event::Start(elem))?;
            }
            Ok(Event::Empty(elem)) => {
                let elem = strip_element(&elem, depth == 0, label)?;
                writer.write_event(Event::Empty(elem))?;
            }
            Ok(Event::End(elem)) => {
                depth = depth.saturating_sub(1);
                let name = String::from_utf8_lossy(elem.local_name().as_ref()).into_owned();
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }
            Ok(Event::Decl(_) | Event::DocType(_) | Event::PI(_)) => {}
            Ok(Event::Eof) => break,
            Ok(event) => writer.write_event(event)?,
            Err(e) => bail!(
                "malformed SVG at position {}: {e}",
                reader.error_position()
            ),
        }
    }

    Ok(String::from_utf8(writer.into_inner())?)
}

fn strip_element(elem: &BytesStart<'_>, root: bool, label: &str) -> Result<BytesStart<'static>> {
    let name = String::from_utf8_lossy(elem.local_name().as_ref()).into_owned();
    let mut stripped = BytesStart::new(name);

    for attr in elem.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        if root && (key == b"role" || key == b"aria-label") {
            continue;
        }
        stripped.push_attribute(Attribute {
            key: QName(attr.key.local_name().into_inner()),
            value: attr.value,
        });
    }

    if root {
        stripped.push_attribute(("role", "img"));
        stripped.push_attribute(("aria-label", label));
    }

    Ok(stripped.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespaces_and_labels_root() {
        let svg = r#"<?xml version="1.0" encoding="utf-8"?><svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" viewBox="0 0 10 10"><a xlink:href="https://d2lang.com"><rect width="1"/></a></svg>"#;

        let inlined = inline_svg(svg, "Architecture").unwrap();

        assert_eq!(
            inlined,
            r#"<svg viewBox="0 0 10 10" role="img" aria-label="Architecture"><a href="https://d2lang.com"><rect width="1"/></a></svg>"#
        );
    }

    #[test]
    fn prefixed_elements_lose_their_prefix() {
        let svg = r#"<svg:svg xmlns:svg="http://www.w3.org/2000/svg"><svg:g></svg:g></svg:svg>"#;
        let inlined = inline_svg(svg, "").unwrap();
        assert_eq!(inlined, r#"<svg role="img" aria-label=""><g></g></svg>"#);
    }

    #[test]
    fn label_is_escaped() {
        let inlined = inline_svg("<svg/>", r#"a "quoted" <label>"#).unwrap();
        assert_eq!(
            inlined,
            r#"<svg role="img" aria-label="a &quot;quoted&quot; &lt;label&gt;"/>"#
        );
    }

    #[test]
    fn only_the_root_is_labelled() {
        let inlined = inline_svg(r#"<svg><svg role="x"/></svg>"#, "outer").unwrap();
        assert_eq!(
            inlined,
            r#"<svg role="img" aria-label="outer"><svg role="x"/></svg>"#
        );
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(inline_svg("<svg><g></svg>", "x").is_err());
    }
}
