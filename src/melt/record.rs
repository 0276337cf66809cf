//! Record parsing
//!
//! Turns the raw text of one `<REC>` element into a small owned element
//! tree and reads the record identifier from its `<UID>` child.

use crate::error::{MeltError, Result};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

static UID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<UID>\s*([^<\s]+)\s*</UID>").unwrap()
});

/// Root tag of a record
pub const RECORD_TAG: &str = "REC";

/// Identifier child of the root
pub const IDENTIFIER_TAG: &str = "UID";

/// An XML element with its attributes, own text and children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    /// Concatenated direct text nodes; empty when the element has none
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// Parse a single-rooted XML fragment
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                MeltError::malformed(format!("{} at position {}", e, reader.buffer_position()))
            })?;

            match event {
                Event::Start(e) => {
                    if root.is_some() {
                        return Err(MeltError::malformed("content after the root element"));
                    }
                    stack.push(Self::from_start(&e)?);
                }
                Event::Empty(e) => {
                    let element = Self::from_start(&e)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| MeltError::malformed("unexpected closing tag"))?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(MeltError::malformed)?;
                    match stack.last_mut() {
                        Some(top) => top.text.push_str(&text),
                        None if text.trim().is_empty() => {}
                        None => return Err(MeltError::malformed("text outside the root element")),
                    }
                }
                Event::CData(c) => {
                    let raw = c.into_inner();
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&raw));
                    }
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions, doctype
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(MeltError::malformed(format!("unclosed element <{}>", open.tag)));
        }
        root.ok_or_else(|| MeltError::malformed("no root element"))
    }

    fn from_start(start: &BytesStart) -> Result<Element> {
        let tag = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(MeltError::malformed)?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(MeltError::malformed)?.into_owned();
            attrs.push((key, value));
        }
        Ok(Element {
            tag,
            attrs,
            ..Default::default()
        })
    }

    fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => *root = Some(element),
            None => return Err(MeltError::malformed("more than one root element")),
        }
        Ok(())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Elements reached by following `path` one child step at a time,
    /// in document order. `"a/b"` selects every `b` child of every `a` child.
    pub fn select<'a>(&'a self, path: &str) -> Vec<&'a Element> {
        let mut current = vec![self];
        for step in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            current = current
                .into_iter()
                .flat_map(|e| e.children.iter().filter(move |c| c.tag == step))
                .collect();
        }
        current
    }

    pub fn first(&self, path: &str) -> Option<&Element> {
        self.select(path).into_iter().next()
    }

    pub fn first_text(&self, path: &str) -> Option<&str> {
        self.first(path).map(Element::text)
    }

    /// This element and all of its descendants, depth-first in document order
    pub fn descendants(&self) -> impl Iterator<Item = &Element> + '_ {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.children.iter().rev());
            Some(next)
        })
    }

    /// Texts of every descendant named `tag`, in document order
    pub fn descendant_texts<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.descendants()
            .filter(move |e| e.tag == tag)
            .map(Element::text)
    }
}

/// A parsed record and its identifier
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub wos_id: String,
    pub root: Element,
}

/// Parse one record's raw text.
///
/// Fails with `MalformedRecord` if the text is not a well-formed `<REC>`
/// element and with `MissingIdentifier` if it has no non-empty `<UID>`.
pub fn parse_record(text: &str) -> Result<ParsedRecord> {
    let root = Element::parse(text)?;
    if root.tag != RECORD_TAG {
        return Err(MeltError::malformed(format!(
            "expected <{}> root, found <{}>",
            RECORD_TAG, root.tag
        )));
    }

    let wos_id = root
        .first_text(IDENTIFIER_TAG)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(MeltError::MissingIdentifier)?
        .to_string();

    Ok(ParsedRecord { wos_id, root })
}

/// Best-effort identifier for log lines about a record that failed to parse
pub fn identifier_hint(text: &str) -> Option<&str> {
    UID_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_reads_uid() {
        let record = parse_record(
            r#"<REC r_id_disclaimer="x"><UID> WOS:000123 </UID><static_data/></REC>"#,
        )
        .unwrap();
        assert_eq!(record.wos_id, "WOS:000123");
        assert_eq!(record.root.children.len(), 2);
        assert_eq!(record.root.attr("r_id_disclaimer"), Some("x"));
    }

    #[test]
    fn test_missing_uid() {
        let err = parse_record("<REC><static_data/></REC>").unwrap_err();
        assert!(matches!(err, MeltError::MissingIdentifier));

        let err = parse_record("<REC><UID>  </UID></REC>").unwrap_err();
        assert!(matches!(err, MeltError::MissingIdentifier));
    }

    #[test]
    fn test_malformed_record() {
        let err = parse_record("<REC><UID>WOS:1</UID>").unwrap_err();
        assert!(matches!(err, MeltError::MalformedRecord(_)));

        let err = parse_record("<REC><UID>WOS:1</uid></REC>").unwrap_err();
        assert!(matches!(err, MeltError::MalformedRecord(_)));

        let err = parse_record("").unwrap_err();
        assert!(matches!(err, MeltError::MalformedRecord(_)));

        let err = parse_record("<records><UID>WOS:1</UID></records>").unwrap_err();
        assert!(matches!(err, MeltError::MalformedRecord(_)));
    }

    #[test]
    fn test_text_is_unescaped_and_namespaces_dropped() {
        let root = Element::parse(
            r#"<wos:REC xmlns:wos="urn:x"><title type="item">Salt &amp; Pepper<![CDATA[ <raw>]]></title></wos:REC>"#,
        )
        .unwrap();
        assert_eq!(root.tag, "REC");
        assert!(root.attrs.is_empty());
        assert_eq!(root.first_text("title"), Some("Salt & Pepper <raw>"));
    }

    #[test]
    fn test_select_and_descendants() {
        let root = Element::parse(
            "<a><b><c>1</c><c>2</c></b><b><c>3</c><d><c>4</c></d></b></a>",
        )
        .unwrap();

        let direct: Vec<_> = root.select("./b/c").iter().map(|e| e.text()).collect();
        assert_eq!(direct, vec!["1", "2", "3"]);

        let all: Vec<_> = root.descendant_texts("c").collect();
        assert_eq!(all, vec!["1", "2", "3", "4"]);

        assert!(root.first("b/missing").is_none());
        assert_eq!(root.descendants().next().unwrap().tag, "a");
    }

    #[test]
    fn test_identifier_hint() {
        assert_eq!(identifier_hint("<REC><UID>WOS:42</UID><broken"), Some("WOS:42"));
        assert_eq!(identifier_hint("<REC><broken"), None);
    }
}
