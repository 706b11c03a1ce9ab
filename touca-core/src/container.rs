//! # Binary Container
//!
//! Test results are persisted and submitted as a container of length-prefixed
//! case messages.
//!
//! ```text
//! container := ( u32 length | message )*
//! message   := u32 length | metadata | body
//! metadata  := str team | str suite | str version | str testcase | str built_at
//! body      := u32 count | result*  u32 count | metric*
//! result    := str key | u8 category | value | rule
//! metric    := str key | i64 milliseconds
//! str       := u32 length | utf-8 bytes
//! ```
//!
//! All integers are big-endian. The metadata record carries its own length so
//! that [`retag`] can rewrite team, suite and version without decoding the
//! result values that follow it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use serde_json::json;

use crate::{
    case::{ComparisonRule, Metadata, ResultCategory, ResultEntry},
    value::TypedValue,
    Error, Result,
};

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DECIMAL: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BLOB: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;

const CATEGORY_CHECK: u8 = 1;
const CATEGORY_ASSERT: u8 = 2;

const RULE_NONE: u8 = 0;
const RULE_ABSOLUTE: u8 = 1;
const RULE_RELATIVE: u8 = 2;

/// A case message decoded back into its structural form.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCase {
    pub metadata: Metadata,
    pub built_at: String,
    pub results: Vec<(String, ResultEntry)>,
    pub metrics: Vec<(String, i64)>,
}

impl DecodedCase {
    /// Same document layout as `Case::json`.
    pub fn to_json(&self) -> serde_json::Value {
        let entries = |category: ResultCategory| -> Vec<serde_json::Value> {
            self.results
                .iter()
                .filter(|(_, entry)| entry.category == category)
                .map(|(key, entry)| {
                    let mut item = json!({ "key": key, "value": entry.value.to_json() });
                    if let Some(rule) = &entry.rule {
                        item["rule"] = rule.to_json();
                    }
                    item
                })
                .collect()
        };
        json!({
            "metadata": self.metadata.to_json(&self.built_at),
            "results": entries(ResultCategory::Check),
            "assertions": entries(ResultCategory::Assert),
            "metrics": self
                .metrics
                .iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect::<Vec<_>>(),
        })
    }
}

pub(crate) fn encode_case(
    metadata: &Metadata,
    built_at: &str,
    results: &IndexMap<String, ResultEntry>,
    metrics: &[(String, i64)],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_metadata(&mut buf, metadata, built_at);

    buf.put_u32(results.len() as u32);
    for (key, entry) in results {
        put_str(&mut buf, key);
        buf.put_u8(match entry.category {
            ResultCategory::Check => CATEGORY_CHECK,
            ResultCategory::Assert => CATEGORY_ASSERT,
        });
        put_value(&mut buf, &entry.value);
        put_rule(&mut buf, entry.rule.as_ref());
    }

    buf.put_u32(metrics.len() as u32);
    for (key, value) in metrics {
        put_str(&mut buf, key);
        buf.put_i64(*value);
    }

    buf.to_vec()
}

/// Wrap case messages into a container.
pub fn encode<I, M>(messages: I) -> Vec<u8>
where
    I: IntoIterator<Item = M>,
    M: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for message in messages {
        let message = message.as_ref();
        buf.put_u32(message.len() as u32);
        buf.put_slice(message);
    }
    buf.to_vec()
}

/// Split a container into its case messages.
pub fn split(content: &[u8]) -> Result<Vec<Bytes>> {
    let mut buf = Bytes::copy_from_slice(content);
    let mut messages = Vec::new();
    while buf.has_remaining() {
        let len = get_u32(&mut buf)? as usize;
        messages.push(take(&mut buf, len)?);
    }
    Ok(messages)
}

/// Merge several containers into one, validating each of them.
pub fn concat<I, C>(containers: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut messages = Vec::new();
    for container in containers {
        messages.extend(split(container.as_ref())?);
    }
    Ok(encode(messages))
}

/// Rewrite team, suite and version of every message. Result values are copied
/// verbatim.
pub fn retag(
    content: &[u8],
    team: Option<&str>,
    suite: Option<&str>,
    version: Option<&str>,
) -> Result<Vec<u8>> {
    let mut messages = Vec::new();
    for mut message in split(content)? {
        let header_len = get_u32(&mut message)? as usize;
        let mut header = take(&mut message, header_len)?;
        let (mut metadata, built_at) = get_metadata_fields(&mut header)?;
        if let Some(team) = team {
            metadata.team = team.to_string();
        }
        if let Some(suite) = suite {
            metadata.suite = suite.to_string();
        }
        if let Some(version) = version {
            metadata.version = version.to_string();
        }
        let mut buf = BytesMut::new();
        put_metadata(&mut buf, &metadata, &built_at);
        buf.put_slice(&message);
        messages.push(buf.freeze());
    }
    Ok(encode(messages))
}

/// Fully decode every message of a container.
pub fn decode(content: &[u8]) -> Result<Vec<DecodedCase>> {
    split(content)?.into_iter().map(decode_case).collect()
}

/// Fully decode one case message.
pub fn decode_case(mut message: Bytes) -> Result<DecodedCase> {
    let header_len = get_u32(&mut message)? as usize;
    let mut header = take(&mut message, header_len)?;
    let (metadata, built_at) = get_metadata_fields(&mut header)?;

    let count = get_u32(&mut message)?;
    let mut results = Vec::new();
    for _ in 0..count {
        let key = get_str(&mut message)?;
        let category = match get_u8(&mut message)? {
            CATEGORY_CHECK => ResultCategory::Check,
            CATEGORY_ASSERT => ResultCategory::Assert,
            other => return Err(Error::Decode(format!("unknown result category {other}"))),
        };
        let value = get_value(&mut message)?;
        let rule = get_rule(&mut message)?;
        results.push((
            key,
            ResultEntry {
                category,
                value,
                rule,
            },
        ));
    }

    let count = get_u32(&mut message)?;
    let mut metrics = Vec::new();
    for _ in 0..count {
        let key = get_str(&mut message)?;
        metrics.push((key, get_i64(&mut message)?));
    }

    if message.has_remaining() {
        return Err(Error::Decode(format!(
            "{} trailing bytes after case message",
            message.remaining()
        )));
    }

    Ok(DecodedCase {
        metadata,
        built_at,
        results,
        metrics,
    })
}

fn put_metadata(buf: &mut BytesMut, metadata: &Metadata, built_at: &str) {
    let mut header = BytesMut::new();
    put_str(&mut header, &metadata.team);
    put_str(&mut header, &metadata.suite);
    put_str(&mut header, &metadata.version);
    put_str(&mut header, &metadata.testcase);
    put_str(&mut header, built_at);
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_value(buf: &mut BytesMut, value: &TypedValue) {
    match value {
        TypedValue::Bool(v) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*v));
        }
        TypedValue::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*v);
        }
        TypedValue::Decimal(v) => {
            buf.put_u8(TAG_DECIMAL);
            buf.put_f64(*v);
        }
        TypedValue::String(v) => {
            buf.put_u8(TAG_STRING);
            put_str(buf, v);
        }
        TypedValue::Blob(v) => {
            buf.put_u8(TAG_BLOB);
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        TypedValue::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32(items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        TypedValue::Object(fields) => {
            buf.put_u8(TAG_OBJECT);
            buf.put_u32(fields.len() as u32);
            for (name, field) in fields {
                put_str(buf, name);
                put_value(buf, field);
            }
        }
    }
}

fn put_rule(buf: &mut BytesMut, rule: Option<&ComparisonRule>) {
    match rule {
        None => buf.put_u8(RULE_NONE),
        Some(ComparisonRule::Absolute { min, max }) => {
            buf.put_u8(RULE_ABSOLUTE);
            for bound in [min, max] {
                match bound {
                    Some(v) => {
                        buf.put_u8(1);
                        buf.put_f64(*v);
                    }
                    None => buf.put_u8(0),
                }
            }
        }
        Some(ComparisonRule::Relative { max, percent }) => {
            buf.put_u8(RULE_RELATIVE);
            buf.put_f64(*max);
            buf.put_u8(u8::from(*percent));
        }
    }
}

fn ensure(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Decode(format!(
            "expected {len} more bytes but only {} remain",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_f64(buf: &mut Bytes) -> Result<f64> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    let len = get_u32(buf)? as usize;
    let raw = take(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Decode(format!("invalid utf-8: {e}")))
}

fn get_metadata_fields(header: &mut Bytes) -> Result<(Metadata, String)> {
    let metadata = Metadata {
        team: get_str(header)?,
        suite: get_str(header)?,
        version: get_str(header)?,
        testcase: get_str(header)?,
    };
    let built_at = get_str(header)?;
    Ok((metadata, built_at))
}

fn get_value(buf: &mut Bytes) -> Result<TypedValue> {
    Ok(match get_u8(buf)? {
        TAG_BOOL => TypedValue::Bool(get_u8(buf)? != 0),
        TAG_INT => TypedValue::Int(get_i64(buf)?),
        TAG_DECIMAL => TypedValue::Decimal(get_f64(buf)?),
        TAG_STRING => TypedValue::String(get_str(buf)?),
        TAG_BLOB => {
            let len = get_u32(buf)? as usize;
            TypedValue::Blob(take(buf, len)?.to_vec())
        }
        TAG_ARRAY => {
            let count = get_u32(buf)?;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(get_value(buf)?);
            }
            TypedValue::Array(items)
        }
        TAG_OBJECT => {
            let count = get_u32(buf)?;
            let mut fields = IndexMap::new();
            for _ in 0..count {
                let name = get_str(buf)?;
                fields.insert(name, get_value(buf)?);
            }
            TypedValue::Object(fields)
        }
        other => return Err(Error::Decode(format!("unknown value tag {other}"))),
    })
}

fn get_rule(buf: &mut Bytes) -> Result<Option<ComparisonRule>> {
    Ok(match get_u8(buf)? {
        RULE_NONE => None,
        RULE_ABSOLUTE => {
            let mut bounds = [None, None];
            for bound in &mut bounds {
                if get_u8(buf)? != 0 {
                    *bound = Some(get_f64(buf)?);
                }
            }
            let [min, max] = bounds;
            Some(ComparisonRule::Absolute { min, max })
        }
        RULE_RELATIVE => {
            let max = get_f64(buf)?;
            let percent = get_u8(buf)? != 0;
            Some(ComparisonRule::Relative { max, percent })
        }
        other => return Err(Error::Decode(format!("unknown rule kind {other}"))),
    })
}
