//! Shared model of a captured V8 heap snapshot document.
//!
//! Both decoders read the same JSON envelope: a `snapshot.meta` section that
//! names the fields of flat numeric record tables, the tables themselves, and
//! a string table the records index into.

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;

use super::issue::CaptureIssue;

/// A decoding strategy over a captured document.
pub trait CaptureDecoder {
    type Summary;

    fn decode_document(
        &self,
        doc: &SnapshotDocument,
        top_n: usize,
    ) -> Result<Self::Summary, CaptureIssue>;

    fn decode(&self, text: &str, top_n: usize) -> Result<Self::Summary, CaptureIssue> {
        let doc = SnapshotDocument::parse(text)?;
        self.decode_document(&doc, top_n)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub snapshot: SnapshotHeader,
    #[serde(default)]
    pub nodes: Vec<Num>,
    #[serde(default)]
    pub strings: Vec<String>,
    #[serde(default)]
    pub trace_function_infos: Vec<Num>,
    /// Kept generic: V8 nests child records as arrays, flat encodings use counts.
    #[serde(default)]
    pub trace_tree: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotHeader {
    #[serde(default)]
    pub meta: SnapshotMeta,
    #[serde(default)]
    pub node_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotMeta {
    #[serde(default)]
    pub node_fields: Vec<String>,
    #[serde(default)]
    pub node_types: Vec<Value>,
    #[serde(default)]
    pub trace_function_info_fields: Vec<String>,
    #[serde(default)]
    pub trace_node_fields: Vec<String>,
}

impl SnapshotDocument {
    /// Parse a document of any nesting depth; the stack grows on demand.
    pub fn parse(text: &str) -> Result<Self, CaptureIssue> {
        let mut de = serde_json::Deserializer::from_str(text);
        de.disable_recursion_limit();
        let doc = Self::deserialize(serde_stacker::Deserializer::new(&mut de))?;
        de.end()?;
        Ok(doc)
    }
}

impl Drop for SnapshotDocument {
    // Nested trace children are unlinked one level at a time.
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.trace_tree);
        while let Some(value) = stack.pop() {
            match value {
                Value::Array(items) => stack.extend(items),
                Value::Object(map) => stack.extend(map.into_iter().map(|(_, v)| v)),
                _ => {}
            }
        }
    }
}

/// A lenient non-negative integer: negatives, nulls and non-numbers read as 0,
/// fractions are truncated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Num(pub u64);

impl<'de> Deserialize<'de> for Num {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NumVisitor;

        impl<'de> Visitor<'de> for NumVisitor {
            type Value = Num;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a number")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Num, E> {
                Ok(Num(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Num, E> {
                Ok(Num(v.max(0) as u64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Num, E> {
                Ok(Num(if v.is_finite() && v > 0.0 { v as u64 } else { 0 }))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Num, E> {
                Ok(Num(0))
            }

            fn visit_none<E: de::Error>(self) -> Result<Num, E> {
                Ok(Num(0))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Num, E> {
                Ok(Num(0))
            }

            fn visit_str<E: de::Error>(self, _: &str) -> Result<Num, E> {
                Ok(Num(0))
            }
        }

        deserializer.deserialize_any(NumVisitor)
    }
}

/// Same leniency as [`Num`] for values kept as generic JSON.
pub fn value_u64(v: &Value) -> u64 {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Resolves field positions inside fixed-width records from a field-name manifest.
#[derive(Debug, Clone, Copy)]
pub struct FieldLayout<'a> {
    section: &'static str,
    fields: &'a [String],
}

impl<'a> FieldLayout<'a> {
    pub fn new(section: &'static str, fields: &'a [String]) -> Self {
        Self { section, fields }
    }

    /// Record width in numbers.
    pub fn width(&self) -> usize {
        self.fields.len()
    }

    /// Position of the first field matching any alias.
    pub fn index_of(&self, aliases: &[&str]) -> Option<usize> {
        aliases
            .iter()
            .find_map(|alias| self.fields.iter().position(|f| f == alias))
    }

    pub fn require(&self, aliases: &[&str]) -> Result<usize, CaptureIssue> {
        self.index_of(aliases).ok_or_else(|| {
            CaptureIssue::malformed(format!(
                "{} has no '{}' field (fields: [{}])",
                self.section,
                aliases[0],
                self.fields.join(", ")
            ))
        })
    }
}

/// Index-based lookup into the document's string table.
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a>(&'a [String]);

impl<'a> StringTable<'a> {
    pub fn new(strings: &'a [String]) -> Self {
        Self(strings)
    }

    /// Out-of-range indices resolve to the index itself rendered as text.
    pub fn resolve(&self, index: u64) -> Cow<'a, str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.0.get(i))
            .map(|s| Cow::Borrowed(s.as_str()))
            .unwrap_or_else(|| Cow::Owned(index.to_string()))
    }

    pub fn get(&self, index: u64) -> Option<&'a str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.0.get(i))
            .map(String::as_str)
    }
}

struct Ranked<T> {
    size: u64,
    seq: u64,
    item: T,
}

impl<T> Ranked<T> {
    // Larger size ranks higher; among equal sizes the earlier arrival ranks higher.
    fn key(&self) -> (u64, Reverse<u64>) {
        (self.size, Reverse(self.seq))
    }
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Keeps the `limit` largest items seen, by size.
///
/// Backed by a min-heap: a new item displaces the current minimum only when it
/// is strictly larger, so ties keep the earlier arrival.
pub struct TopK<T> {
    limit: usize,
    seq: u64,
    heap: BinaryHeap<Reverse<Ranked<T>>>,
}

impl<T> TopK<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            seq: 0,
            heap: BinaryHeap::with_capacity(limit.min(1024)),
        }
    }

    /// Whether an item of `size` would currently make the cut.
    pub fn admits(&self, size: u64) -> bool {
        if self.limit == 0 {
            return false;
        }
        if self.heap.len() < self.limit {
            return true;
        }
        self.heap.peek().is_some_and(|min| size > min.0.size)
    }

    pub fn push(&mut self, size: u64, item: T) {
        let seq = self.seq;
        self.seq += 1;
        if !self.admits(size) {
            return;
        }
        let ranked = Reverse(Ranked { size, seq, item });
        if self.heap.len() < self.limit {
            self.heap.push(ranked);
        } else if let Some(mut min) = self.heap.peek_mut() {
            *min = ranked;
        }
    }

    /// Count an item that was rejected up front via [`TopK::admits`].
    pub fn skip(&mut self) {
        self.seq += 1;
    }

    /// Items in descending size order, ties in arrival order.
    pub fn into_sorted(self) -> Vec<T> {
        let mut ranked: Vec<Ranked<T>> = self.heap.into_iter().map(|r| r.0).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        ranked.into_iter().map(|r| r.item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_is_lenient() {
        let nums: Vec<Num> = serde_json::from_str(r#"[1, -5, 2.9, null, "x", true]"#).unwrap();
        assert_eq!(nums, vec![Num(1), Num(0), Num(2), Num(0), Num(0), Num(0)]);
    }

    #[test]
    fn test_value_u64() {
        assert_eq!(value_u64(&serde_json::json!(7)), 7);
        assert_eq!(value_u64(&serde_json::json!(-7)), 0);
        assert_eq!(value_u64(&serde_json::json!(3.5)), 3);
        assert_eq!(value_u64(&serde_json::json!([1])), 0);
    }

    #[test]
    fn test_field_layout_aliases() {
        let fields: Vec<String> = ["id", "function_info_index", "count"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let layout = FieldLayout::new("trace_node_fields", &fields);
        assert_eq!(layout.width(), 3);
        assert_eq!(layout.index_of(&["function_index", "function_info_index"]), Some(1));
        let err = layout.require(&["size", "allocation_size"]).unwrap_err();
        assert!(err.to_string().contains("'size'"));
    }

    #[test]
    fn test_string_table_fallback() {
        let strings = vec!["Foo".to_string()];
        let table = StringTable::new(&strings);
        assert_eq!(table.resolve(0), "Foo");
        assert_eq!(table.resolve(42), "42");
        assert_eq!(table.get(42), None);
    }

    #[test]
    fn test_top_k_keeps_largest_in_order() {
        let mut top = TopK::new(3);
        for (size, name) in [(5, "a"), (1, "b"), (9, "c"), (5, "d"), (7, "e")] {
            top.push(size, name);
        }
        assert_eq!(top.into_sorted(), vec!["c", "e", "a"]);
    }

    #[test]
    fn test_top_k_ties_keep_arrival_order() {
        let mut top = TopK::new(2);
        for name in ["first", "second", "third"] {
            top.push(10, name);
        }
        assert_eq!(top.into_sorted(), vec!["first", "second"]);
    }

    #[test]
    fn test_top_k_zero_limit() {
        let mut top = TopK::new(0);
        top.push(100, "x");
        assert!(!top.admits(1000));
        assert!(top.into_sorted().is_empty());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(SnapshotDocument::parse("{} {}").is_err());
    }

    #[test]
    fn test_missing_sections_default() {
        let doc = SnapshotDocument::parse("{}").unwrap();
        assert!(doc.snapshot.meta.node_fields.is_empty());
        assert!(doc.nodes.is_empty());
        assert!(SnapshotDocument::parse("not json").is_err());
    }
}
