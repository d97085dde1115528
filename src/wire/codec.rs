//! Structured text codecs
//!
//! Converts between the two wire encodings and the uniform structured
//! representation (`serde_json::Value`), and between structured values and
//! flat multi-valued parameter maps.
//!
//! The XML side is a deliberately small envelope subset: elements without
//! attributes, repeated tags for multi-valued keys, text content for
//! scalars. Decoding drops the root tag, so any root name is accepted.

use serde_json::{Map, Value};

use crate::core::error::{ServiceError, ServiceResult};

use super::{Encoding, ParamMap};

/// Tag used when a bare array or scalar has to be wrapped for XML output.
const ITEM_TAG: &str = "item";

/// Decode wire text into a structured value.
///
/// Malformed text fails with a `Decode` error naming the offending
/// fragment; no partial value is ever returned.
pub fn decode(encoding: Encoding, text: &str) -> ServiceResult<Value> {
    match encoding {
        Encoding::Json => serde_json::from_str(text)
            .map_err(|e| ServiceError::Decode(format!("{e} in {}", fragment(text)))),
        Encoding::Xml => XmlParser::new(text).parse_document(),
    }
}

/// Encode a structured value as wire text.
pub fn encode(encoding: Encoding, value: &Value) -> ServiceResult<String> {
    match encoding {
        Encoding::Json => {
            serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))
        }
        Encoding::Xml => {
            let mut out = String::new();
            match value {
                Value::Object(map) => {
                    out.push_str("<object>");
                    write_xml_object(&mut out, map);
                    out.push_str("</object>");
                }
                other => write_xml_element(&mut out, ITEM_TAG, other),
            }
            Ok(out)
        }
    }
}

/// Encode a value as payload content, suitable for embedding between the
/// envelope's payload markers.
///
/// JSON payloads are ordinary JSON values. XML payloads are element
/// content: an object contributes its child elements without a wrapper, an
/// array repeated `<item>` elements, a scalar escaped text. Decoding the
/// enclosing `data` element yields the original value back.
pub fn encode_payload(encoding: Encoding, value: &Value) -> ServiceResult<String> {
    match encoding {
        Encoding::Json => encode(Encoding::Json, value),
        Encoding::Xml => {
            let mut out = String::new();
            match value {
                Value::Object(map) => write_xml_object(&mut out, map),
                Value::Array(items) => {
                    for item in items {
                        write_xml_element(&mut out, ITEM_TAG, item);
                    }
                }
                other => out.push_str(&xml_escape(&scalar_to_string(other))),
            }
            Ok(out)
        }
    }
}

/// Extract a flat multi-valued parameter map from a structured value.
///
/// Non-object values yield an empty map; scalar entries become single-value
/// lists and arrays become multi-value lists with non-string scalars
/// stringified.
pub fn parameter_map_from_structured(value: &Value) -> ParamMap {
    let mut params = ParamMap::new();
    let Value::Object(map) = value else {
        return params;
    };
    for (key, entry) in map {
        let values = match entry {
            Value::Array(items) => items.iter().map(scalar_to_string).collect(),
            Value::Null => continue,
            other => vec![scalar_to_string(other)],
        };
        params.insert(key.clone(), values);
    }
    params
}

/// Build the structured form of a parameter map.
///
/// Single-valued keys become scalars, multi-valued keys arrays; keys with no
/// values are dropped. This is the inverse of
/// [`parameter_map_from_structured`] for any map without empty value lists.
pub fn structured_from_parameter_map(params: &ParamMap) -> Value {
    let mut map = Map::new();
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    for key in keys {
        let values = &params[key];
        match values.len() {
            0 => continue,
            1 => {
                map.insert(key.clone(), Value::String(values[0].clone()));
            }
            _ => {
                map.insert(
                    key.clone(),
                    Value::Array(values.iter().cloned().map(Value::String).collect()),
                );
            }
        }
    }
    Value::Object(map)
}

/// Render a scalar the way it appears as element text or a parameter value.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn fragment(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(48) {
        Some((idx, _)) => format!("'{}...'", &trimmed[..idx]),
        None => format!("'{trimmed}'"),
    }
}

// --- XML writing ---

pub(crate) fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn write_xml_object(out: &mut String, map: &Map<String, Value>) {
    for (key, value) in map {
        match value {
            // Repeated tags, one per array entry
            Value::Array(items) => {
                for item in items {
                    write_xml_element(out, key, item);
                }
            }
            other => write_xml_element(out, key, other),
        }
    }
}

pub(crate) fn write_xml_element(out: &mut String, tag: &str, value: &Value) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    match value {
        Value::Object(map) => write_xml_object(out, map),
        Value::Array(items) => {
            for item in items {
                write_xml_element(out, ITEM_TAG, item);
            }
        }
        other => out.push_str(&xml_escape(&scalar_to_string(other))),
    }
    out.push('<');
    out.push('/');
    out.push_str(tag);
    out.push('>');
}

// --- XML parsing ---

/// Recursive-descent parser for the envelope XML subset.
///
/// Attributes are tolerated and ignored; comments and an XML prolog are
/// skipped. Text content always decodes as a string.
struct XmlParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> XmlParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse_document(&mut self) -> ServiceResult<Value> {
        self.skip_misc();
        let (_, value) = self.parse_element()?;
        self.skip_misc();
        if self.pos < self.src.len() {
            return Err(self.error("trailing content after document element"));
        }
        Ok(value)
    }

    fn parse_element(&mut self) -> ServiceResult<(String, Value)> {
        if !self.rest().starts_with('<') {
            return Err(self.error("expected element start"));
        }
        self.pos += 1;
        let tag = self.read_name()?;
        self.skip_attributes();

        if self.rest().starts_with("/>") {
            self.pos += 2;
            return Ok((tag, Value::String(String::new())));
        }
        if !self.rest().starts_with('>') {
            return Err(self.error("malformed element start tag"));
        }
        self.pos += 1;

        let value = self.parse_content(&tag)?;
        Ok((tag, value))
    }

    fn parse_content(&mut self, tag: &str) -> ServiceResult<Value> {
        let mut children: Vec<(String, Value)> = Vec::new();
        let mut text = String::new();

        loop {
            self.skip_comments();
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.error(&format!("unterminated element '{tag}'")));
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let close = self.read_name()?;
                if close != tag {
                    return Err(self.error(&format!(
                        "mismatched close tag '{close}' for element '{tag}'"
                    )));
                }
                self.skip_whitespace();
                if !self.rest().starts_with('>') {
                    return Err(self.error("malformed close tag"));
                }
                self.pos += 1;
                break;
            }
            if rest.starts_with('<') {
                let child = self.parse_element()?;
                children.push(child);
                continue;
            }
            let chunk_end = rest.find('<').unwrap_or(rest.len());
            text.push_str(&rest[..chunk_end]);
            self.pos += chunk_end;
        }

        if children.is_empty() {
            return Ok(Value::String(xml_unescape(text.trim())));
        }

        // Repeated tags collapse into arrays, in document order.
        let mut map = Map::new();
        for (child_tag, child_value) in children {
            match map.get_mut(&child_tag) {
                None => {
                    map.insert(child_tag, child_value);
                }
                Some(Value::Array(items)) => items.push(child_value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, child_value]);
                }
            }
        }

        // A root holding only repeated <item> children is a bare array.
        if map.len() == 1 && matches!(map.get(ITEM_TAG), Some(Value::Array(_))) {
            if let Some(Value::Array(items)) = map.remove(ITEM_TAG) {
                return Ok(Value::Array(items));
            }
        }
        Ok(Value::Object(map))
    }

    fn read_name(&mut self) -> ServiceResult<String> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(self.error("expected tag name"));
        }
        let name = rest[..end].to_string();
        self.pos += end;
        Ok(name)
    }

    fn skip_attributes(&mut self) {
        // Attributes carry no envelope meaning; scan to the tag end.
        let rest = self.rest();
        let mut offset = 0;
        let bytes = rest.as_bytes();
        let mut quote: Option<u8> = None;
        while offset < bytes.len() {
            let b = bytes[offset];
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None if b == b'"' || b == b'\'' => quote = Some(b),
                None if b == b'>' => break,
                None if b == b'/' && rest[offset..].starts_with("/>") => break,
                None => {}
            }
            offset += 1;
        }
        self.pos += offset;
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn skip_comments(&mut self) {
        loop {
            let rest = self.rest();
            if let Some(stripped) = rest.strip_prefix("<!--") {
                match stripped.find("-->") {
                    Some(end) => self.pos += 4 + end + 3,
                    None => {
                        self.pos = self.src.len();
                        return;
                    }
                }
            } else {
                return;
            }
        }
    }

    fn skip_misc(&mut self) {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("<?") {
                match rest.find("?>") {
                    Some(end) => self.pos += end + 2,
                    None => {
                        self.pos = self.src.len();
                        return;
                    }
                }
            } else if rest.starts_with("<!--") {
                self.skip_comments();
            } else {
                return;
            }
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn error(&self, message: &str) -> ServiceError {
        let rest = self.rest();
        let shown = match rest.char_indices().nth(32) {
            Some((idx, _)) => &rest[..idx],
            None => rest,
        };
        ServiceError::Decode(format!("{message} at '{shown}'"))
    }
}

fn xml_unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let replaced = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ]
        .iter()
        .find_map(|(entity, c)| rest.strip_prefix(entity).map(|r| (r, *c)));
        match replaced {
            Some((remaining, c)) => {
                out.push(c);
                rest = remaining;
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
