//! The LLSD value model and its XML serialization, used by the HTTP
//! capability driver. Only the subset the capability contract needs, but
//! round-trip-correct for that subset.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LlsdError {
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Malformed LLSD: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, LlsdError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    Uuid(Uuid),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(r) => Some(*r as i32),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Map lookup; `None` for non-maps and missing keys alike.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }
}

/// Serializes a value as an LLSD-XML document.
pub fn to_xml(value: &Value) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Start(BytesStart::new("llsd")))
        .map_err(|e| LlsdError::Xml(e.to_string()))?;
    write_value(&mut writer, value)?;
    writer
        .write_event(Event::End(BytesEnd::new("llsd")))
        .map_err(|e| LlsdError::Xml(e.to_string()))?;
    let body = String::from_utf8(writer.into_inner())
        .map_err(|e| LlsdError::Xml(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body))
}

fn write_value(writer: &mut Writer<Vec<u8>>, value: &Value) -> Result<()> {
    let write = |writer: &mut Writer<Vec<u8>>, tag: &str, text: String| -> Result<()> {
        writer
            .write_event(Event::Start(BytesStart::new(tag)))
            .and_then(|_| writer.write_event(Event::Text(BytesText::new(&text))))
            .and_then(|_| writer.write_event(Event::End(BytesEnd::new(tag))))
            .map_err(|e| LlsdError::Xml(e.to_string()))
    };
    match value {
        Value::Undefined => writer
            .write_event(Event::Empty(BytesStart::new("undef")))
            .map_err(|e| LlsdError::Xml(e.to_string())),
        Value::Boolean(b) => write(writer, "boolean", if *b { "true" } else { "false" }.into()),
        Value::Integer(i) => write(writer, "integer", i.to_string()),
        Value::Real(r) => write(writer, "real", r.to_string()),
        Value::Uuid(u) => write(writer, "uuid", u.to_string()),
        Value::String(s) => write(writer, "string", s.clone()),
        Value::Binary(data) => {
            let start = BytesStart::new("binary")
                .with_attributes([("encoding", "base64")].into_iter());
            writer
                .write_event(Event::Start(start))
                .and_then(|_| {
                    writer.write_event(Event::Text(BytesText::new(&base64_encode(data))))
                })
                .and_then(|_| writer.write_event(Event::End(BytesEnd::new("binary"))))
                .map_err(|e| LlsdError::Xml(e.to_string()))
        }
        Value::Array(items) => {
            writer
                .write_event(Event::Start(BytesStart::new("array")))
                .map_err(|e| LlsdError::Xml(e.to_string()))?;
            for item in items {
                write_value(writer, item)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("array")))
                .map_err(|e| LlsdError::Xml(e.to_string()))
        }
        Value::Map(entries) => {
            writer
                .write_event(Event::Start(BytesStart::new("map")))
                .map_err(|e| LlsdError::Xml(e.to_string()))?;
            for (key, item) in entries {
                write(writer, "key", key.clone())?;
                write_value(writer, item)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("map")))
                .map_err(|e| LlsdError::Xml(e.to_string()))
        }
    }
}

/// Parses an LLSD-XML document.
pub fn from_xml(xml: &str) -> Result<Value> {
    let mut reader = Reader::from_str(xml);
    // Find the <llsd> wrapper.
    loop {
        match next_event(&mut reader)? {
            Event::Start(e) if e.name().as_ref() == b"llsd" => break,
            Event::Decl(_) | Event::Comment(_) => {}
            Event::Text(t) if is_blank(&t)? => {}
            Event::Eof => return Err(LlsdError::Malformed("missing <llsd> root".into())),
            other => {
                return Err(LlsdError::Malformed(format!(
                    "unexpected {:?} before <llsd>",
                    other
                )));
            }
        }
    }
    let value = loop {
        match next_event(&mut reader)? {
            Event::Start(e) => {
                let tag = e.name().as_ref().to_vec();
                break parse_element(&mut reader, &tag)?;
            }
            Event::Empty(e) => break empty_element(e.name().as_ref())?,
            Event::Text(t) if is_blank(&t)? => {}
            Event::End(e) if e.name().as_ref() == b"llsd" => return Ok(Value::Undefined),
            other => {
                return Err(LlsdError::Malformed(format!(
                    "unexpected {:?} inside <llsd>",
                    other
                )));
            }
        }
    };
    Ok(value)
}

fn next_event<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Event<'a>> {
    reader.read_event().map_err(|e| LlsdError::Xml(e.to_string()))
}

fn is_blank(text: &BytesText) -> Result<bool> {
    let unescaped = text
        .unescape()
        .map_err(|e| LlsdError::Xml(e.to_string()))?;
    Ok(unescaped.trim().is_empty())
}

/// Value for a self-closing element like `<integer/>`.
fn empty_element(tag: &[u8]) -> Result<Value> {
    Ok(match tag {
        b"undef" => Value::Undefined,
        b"boolean" => Value::Boolean(false),
        b"integer" => Value::Integer(0),
        b"real" => Value::Real(0.0),
        b"uuid" => Value::Uuid(Uuid::nil()),
        b"string" => Value::String(String::new()),
        b"binary" => Value::Binary(Vec::new()),
        b"array" => Value::Array(Vec::new()),
        b"map" => Value::Map(BTreeMap::new()),
        other => {
            return Err(LlsdError::Malformed(format!(
                "unknown element <{}/>",
                String::from_utf8_lossy(other)
            )));
        }
    })
}

/// Parses the contents of an already opened element named `tag`.
fn parse_element(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<Value> {
    match tag {
        b"map" => parse_map(reader),
        b"array" => parse_array(reader),
        _ => {
            let text = read_text_until_end(reader, tag)?;
            parse_scalar(tag, &text)
        }
    }
}

fn parse_scalar(tag: &[u8], text: &str) -> Result<Value> {
    let text = text.trim();
    Ok(match tag {
        b"undef" => Value::Undefined,
        b"boolean" => Value::Boolean(matches!(text, "true" | "1")),
        b"integer" => Value::Integer(text.parse().unwrap_or(0)),
        b"real" => Value::Real(text.parse().unwrap_or(0.0)),
        b"uuid" => Value::Uuid(Uuid::parse_str(text).unwrap_or(Uuid::nil())),
        b"string" => Value::String(text.to_string()),
        b"binary" => Value::Binary(base64_decode(text)?),
        other => {
            return Err(LlsdError::Malformed(format!(
                "unknown element <{}>",
                String::from_utf8_lossy(other)
            )));
        }
    })
}

fn read_text_until_end(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<String> {
    let mut text = String::new();
    loop {
        match next_event(reader)? {
            Event::Text(t) => {
                text.push_str(
                    &t.unescape()
                        .map_err(|e| LlsdError::Xml(e.to_string()))?,
                );
            }
            Event::End(e) if e.name().as_ref() == tag => return Ok(text),
            Event::Comment(_) => {}
            Event::Eof => {
                return Err(LlsdError::Malformed(format!(
                    "unterminated <{}>",
                    String::from_utf8_lossy(tag)
                )));
            }
            other => {
                return Err(LlsdError::Malformed(format!(
                    "unexpected {:?} inside <{}>",
                    other,
                    String::from_utf8_lossy(tag)
                )));
            }
        }
    }
}

fn parse_map(reader: &mut Reader<&[u8]>) -> Result<Value> {
    let mut entries = BTreeMap::new();
    loop {
        let key = loop {
            match next_event(reader)? {
                Event::Start(e) if e.name().as_ref() == b"key" => {
                    break Some(read_text_until_end(reader, b"key")?);
                }
                Event::End(e) if e.name().as_ref() == b"map" => break None,
                Event::Text(t) if is_blank(&t)? => {}
                Event::Comment(_) => {}
                Event::Eof => return Err(LlsdError::Malformed("unterminated <map>".into())),
                other => {
                    return Err(LlsdError::Malformed(format!(
                        "expected <key> in map, got {:?}",
                        other
                    )));
                }
            }
        };
        let Some(key) = key else {
            return Ok(Value::Map(entries));
        };
        let value = loop {
            match next_event(reader)? {
                Event::Start(e) => {
                    let tag = e.name().as_ref().to_vec();
                    break parse_element(reader, &tag)?;
                }
                Event::Empty(e) => break empty_element(e.name().as_ref())?,
                Event::Text(t) if is_blank(&t)? => {}
                Event::Comment(_) => {}
                Event::Eof => return Err(LlsdError::Malformed("unterminated <map>".into())),
                other => {
                    return Err(LlsdError::Malformed(format!(
                        "expected a value after <key>{}</key>, got {:?}",
                        key, other
                    )));
                }
            }
        };
        entries.insert(key, value);
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<Value> {
    let mut items = Vec::new();
    loop {
        match next_event(reader)? {
            Event::Start(e) => {
                let tag = e.name().as_ref().to_vec();
                items.push(parse_element(reader, &tag)?);
            }
            Event::Empty(e) => items.push(empty_element(e.name().as_ref())?),
            Event::End(e) if e.name().as_ref() == b"array" => return Ok(Value::Array(items)),
            Event::Text(t) if is_blank(&t)? => {}
            Event::Comment(_) => {}
            Event::Eof => return Err(LlsdError::Malformed("unterminated <array>".into())),
            other => {
                return Err(LlsdError::Malformed(format!(
                    "unexpected {:?} inside <array>",
                    other
                )));
            }
        }
    }
}

const B64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(B64_ALPHABET[(triple >> 18) as usize & 0x3F] as char);
        out.push(B64_ALPHABET[(triple >> 12) as usize & 0x3F] as char);
        out.push(if chunk.len() > 1 {
            B64_ALPHABET[(triple >> 6) as usize & 0x3F] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            B64_ALPHABET[triple as usize & 0x3F] as char
        } else {
            '='
        });
    }
    out
}

fn base64_decode(text: &str) -> Result<Vec<u8>> {
    fn value_of(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let mut out = Vec::new();
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for c in text.bytes() {
        if c.is_ascii_whitespace() || c == b'=' {
            continue;
        }
        let Some(v) = value_of(c) else {
            return Err(LlsdError::Malformed(format!(
                "invalid base64 character {:?}",
                c as char
            )));
        };
        acc = (acc << 6) | v;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        let cases = vec![
            Value::Undefined,
            Value::Boolean(true),
            Value::Integer(-7),
            Value::Real(2.5),
            Value::Uuid(Uuid::parse_str("c228d1cf-4b5d-4ba8-84f4-899a0796aa97").unwrap()),
            Value::String("hello <world> & \"friends\"".to_string()),
            Value::Binary(vec![0, 1, 2, 253, 254, 255]),
        ];
        for value in cases {
            let xml = to_xml(&value).unwrap();
            assert_eq!(from_xml(&xml).unwrap(), value, "xml: {}", xml);
        }
    }

    #[test]
    fn nested_map_round_trips() {
        let mut map = BTreeMap::new();
        map.insert("cof_version".to_string(), Value::Integer(14));
        map.insert("success".to_string(), Value::Boolean(true));
        map.insert(
            "textures".to_string(),
            Value::Array(vec![
                Value::Uuid(Uuid::nil()),
                Value::Uuid(Uuid::parse_str("18ded8d6-bcfc-e415-8539-944c0f5ea7a6").unwrap()),
            ]),
        );
        map.insert(
            "visual_params".to_string(),
            Value::Binary(vec![33, 128, 255]),
        );
        let value = Value::Map(map);
        let xml = to_xml(&value).unwrap();
        assert_eq!(from_xml(&xml).unwrap(), value);
    }

    #[test]
    fn parses_a_capability_style_reply_with_whitespace() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<llsd>
  <map>
    <key>success</key> <boolean>true</boolean>
    <key>cof_version</key> <integer>22</integer>
    <key>error</key> <string>none</string>
    <key>visual_params</key> <binary encoding="base64">IYD/</binary>
  </map>
</llsd>"#;
        let value = from_xml(xml).unwrap();
        assert_eq!(value.get("success").and_then(Value::as_boolean), Some(true));
        assert_eq!(
            value.get("cof_version").and_then(Value::as_integer),
            Some(22)
        );
        assert_eq!(
            value.get("visual_params").and_then(Value::as_binary),
            Some(&[0x21u8, 0x80, 0xFF][..])
        );
    }

    #[test]
    fn empty_elements_take_defaults() {
        let xml = "<llsd><map><key>expected</key><integer/></map></llsd>";
        let value = from_xml(xml).unwrap();
        assert_eq!(value.get("expected").and_then(Value::as_integer), Some(0));
    }

    #[test]
    fn base64_edge_lengths() {
        for len in 0..10usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let encoded = base64_encode(&data);
            assert_eq!(base64_decode(&encoded).unwrap(), data);
        }
        assert_eq!(base64_encode(b"foob"), "Zm9vYg==");
    }
}
