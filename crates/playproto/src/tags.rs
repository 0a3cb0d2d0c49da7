//! Metadata tags and their `TAGS` reply encoding.
//!
//! A `TAGS` reply body is a flat list of `key\nvalue` line pairs. Each key is
//! rendered `<name>_<index>`, where the index is the position of the value
//! among the values carried for that tag name. Clients regroup them with
//! [`parse_tag_reply`].

use chrono::NaiveDate;
use std::fmt;

/// A single typed tag value as reported by a media backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Binary(Vec<u8>),
    Date(NaiveDate),
    /// Anything the formatter has no rendering for; carries the type name.
    Other(String),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:.6}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Binary(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Other(type_name) => write!(f, "tag of type '{}'", type_name),
        }
    }
}

/// One metadata notification: tag names with every value carried for each.
pub type TagList = Vec<(String, Vec<TagValue>)>;

/// Accumulates tag notifications into reply entries.
///
/// Entries keep first-seen order; a later notification with the same
/// name and index replaces the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagTable {
    entries: Vec<(String, String)>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one notification into the table.
    pub fn insert_list(&mut self, tags: &TagList) {
        for (name, values) in tags {
            for (index, value) in values.iter().enumerate() {
                self.insert(format!("{}_{}", name, index), value.to_string());
            }
        }
    }

    fn insert(&mut self, key: String, value: String) {
        // a newline inside a value would break the key/value line pairing
        let value = value.replace(['\r', '\n'], " ");
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Reply lines: key, value, key, value, ...
    pub fn to_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .collect()
    }

    /// Reply body: the lines joined with `\n`.
    pub fn to_reply_body(&self) -> String {
        self.to_lines().join("\n")
    }
}

/// Regroup a `TAGS` reply body into `name -> values`, in first-seen order.
///
/// Keys without a numeric `_<index>` suffix are kept whole with index 0.
/// A trailing key without a value is dropped.
pub fn parse_tag_reply(body: &str) -> Vec<(String, Vec<String>)> {
    let lines: Vec<&str> = body.lines().collect();
    let mut grouped: Vec<(String, Vec<(usize, String)>)> = Vec::new();

    for pair in lines.chunks_exact(2) {
        let (name, index) = split_indexed_key(pair[0]);
        let value = pair[1].to_string();
        match grouped.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push((index, value)),
            None => grouped.push((name.to_string(), vec![(index, value)])),
        }
    }

    grouped
        .into_iter()
        .map(|(name, mut values)| {
            values.sort_by_key(|(index, _)| *index);
            (name, values.into_iter().map(|(_, v)| v).collect())
        })
        .collect()
}

fn split_indexed_key(key: &str) -> (&str, usize) {
    key.rsplit_once('_')
        .and_then(|(name, index)| index.parse().ok().map(|i| (name, i)))
        .unwrap_or((key, 0))
}
