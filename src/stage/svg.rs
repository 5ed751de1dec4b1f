//! SVG markup minification.
//!
//! Drops comments, doctype, processing instructions and insignificant
//! whitespace. A `viewBox` that only restates `width`/`height` is removed, and
//! ids nothing references are removed unless ids are preserved.

use std::collections::HashSet;

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::config::ImageSettings;

/// Minify SVG markup
pub fn minify_svg(input: &[u8], settings: &ImageSettings) -> Result<Vec<u8>, String> {
    let text = std::str::from_utf8(input).map_err(|e| e.to_string())?;
    let referenced = (!settings.svg_preserve_ids).then(|| referenced_ids(text));

    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    let mut writer = Writer::new(Vec::with_capacity(input.len()));

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let event = match event {
            Event::Eof => break,
            Event::Comment(_) | Event::DocType(_) | Event::PI(_) | Event::Decl(_) => continue,
            Event::Start(e) => Event::Start(clean_element(&e, settings, referenced.as_ref())?),
            Event::Empty(e) => Event::Empty(clean_element(&e, settings, referenced.as_ref())?),
            other => other,
        };
        writer.write_event(event).map_err(|e| e.to_string())?;
    }

    Ok(writer.into_inner())
}

fn clean_element(
    element: &BytesStart<'_>,
    settings: &ImageSettings,
    referenced: Option<&HashSet<String>>,
) -> Result<BytesStart<'static>, String> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let attributes: Vec<Attribute> = element
        .attributes()
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;

    let drop_viewbox = settings.svg_remove_viewbox
        && name == "svg"
        && viewbox_is_redundant(&attributes);

    let mut cleaned = BytesStart::new(name);
    for attr in &attributes {
        let key = attr.key.as_ref();
        if drop_viewbox && key == b"viewBox" {
            continue;
        }
        if key == b"id" {
            if let Some(referenced) = referenced {
                let id = String::from_utf8_lossy(&attr.value);
                if !referenced.contains(id.as_ref()) {
                    continue;
                }
            }
        }
        cleaned.push_attribute((key, attr.value.as_ref()));
    }
    Ok(cleaned)
}

fn attr_value<'a>(attributes: &'a [Attribute], key: &[u8]) -> Option<&'a [u8]> {
    attributes
        .iter()
        .find(|a| a.key.as_ref() == key)
        .map(|a| a.value.as_ref())
}

fn parse_length(value: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(value).ok()?.trim();
    text.strip_suffix("px").unwrap_or(text).parse().ok()
}

/// `viewBox="0 0 W H"` alongside `width="W" height="H"` adds nothing
fn viewbox_is_redundant(attributes: &[Attribute]) -> bool {
    let (Some(viewbox), Some(width), Some(height)) = (
        attr_value(attributes, b"viewBox"),
        attr_value(attributes, b"width").and_then(parse_length),
        attr_value(attributes, b"height").and_then(parse_length),
    ) else {
        return false;
    };
    let Ok(viewbox) = std::str::from_utf8(viewbox) else {
        return false;
    };
    let parts: Vec<f64> = viewbox
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect();
    parts == [0.0, 0.0, width, height]
}

/// Ids referenced as `url(#id)` or `href="#id"` anywhere in the document
fn referenced_ids(text: &str) -> HashSet<String> {
    let mut ids = HashSet::new();
    for marker in ["url(#", "\"#", "'#"] {
        let mut rest = text;
        while let Some(pos) = rest.find(marker) {
            rest = &rest[pos + marker.len()..];
            let id: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
                .collect();
            if !id.is_empty() {
                ids.insert(id);
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minify(svg: &str, settings: &ImageSettings) -> String {
        String::from_utf8(minify_svg(svg.as_bytes(), settings).unwrap()).unwrap()
    }

    #[test]
    fn test_strips_comments_and_whitespace() {
        let svg = r#"<?xml version="1.0"?>
<!-- exported -->
<svg xmlns="http://www.w3.org/2000/svg">
    <rect x="1" y="2"/>
</svg>"#;
        let out = minify(svg, &ImageSettings::default());
        assert_eq!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg"><rect x="1" y="2"/></svg>"#
        );
    }

    #[test]
    fn test_removes_redundant_viewbox() {
        let svg = r#"<svg width="24" height="24" viewBox="0 0 24 24"></svg>"#;
        let out = minify(svg, &ImageSettings::default());
        assert!(!out.contains("viewBox"));
    }

    #[test]
    fn test_keeps_scaling_viewbox() {
        let svg = r#"<svg width="48" height="48" viewBox="0 0 24 24"></svg>"#;
        let out = minify(svg, &ImageSettings::default());
        assert!(out.contains(r#"viewBox="0 0 24 24""#));
    }

    #[test]
    fn test_preserves_ids_by_default() {
        let svg = r#"<svg><g id="layer1"/></svg>"#;
        let out = minify(svg, &ImageSettings::default());
        assert!(out.contains(r#"id="layer1""#));
    }

    #[test]
    fn test_cleanup_drops_unreferenced_ids() {
        let settings = ImageSettings {
            svg_preserve_ids: false,
            ..ImageSettings::default()
        };
        let svg = r##"<svg><defs><linearGradient id="g"/></defs><g id="layer1"><rect fill="url(#g)"/></g></svg>"##;
        let out = minify(svg, &settings);
        assert!(out.contains(r#"id="g""#));
        assert!(!out.contains("layer1"));
    }

    #[test]
    fn test_invalid_markup_is_error() {
        let result = minify_svg(b"<svg><g></svg>", &ImageSettings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_referenced_ids() {
        let ids = referenced_ids(r##"<use href="#icon"/><path fill="url(#grad-1)"/>"##);
        assert!(ids.contains("icon"));
        assert!(ids.contains("grad-1"));
    }
}
