//! Object-graph decoder: aggregates the flat node table of a heap snapshot.

use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;

use super::document::{CaptureDecoder, FieldLayout, SnapshotDocument, StringTable, TopK};
use super::issue::CaptureIssue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstructorStat {
    pub name: String,
    pub count: u64,
    pub self_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub self_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectGraphSummary {
    pub total_nodes: u64,
    pub total_self_size_bytes: u64,
    pub top_constructors: Vec<ConstructorStat>,
    pub top_nodes: Vec<NodeStat>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectGraphDecoder;

impl CaptureDecoder for ObjectGraphDecoder {
    type Summary = ObjectGraphSummary;

    fn decode_document(
        &self,
        doc: &SnapshotDocument,
        top_n: usize,
    ) -> Result<ObjectGraphSummary, CaptureIssue> {
        let meta = &doc.snapshot.meta;
        let layout = FieldLayout::new("snapshot.meta.node_fields", &meta.node_fields);
        let width = layout.width();
        if width == 0 {
            return Err(CaptureIssue::malformed(
                "snapshot.meta.node_fields is missing or empty",
            ));
        }

        let type_idx = layout.require(&["type"])?;
        let name_idx = layout.require(&["name"])?;
        let size_idx = layout.require(&["self_size"])?;
        let id_idx = layout.index_of(&["id"]);

        // Only the "type" field is required to carry an enumeration.
        let type_names: Option<Vec<&str>> = meta
            .node_types
            .get(type_idx)
            .and_then(|v| v.as_array())
            .map(|names| names.iter().map(|n| n.as_str().unwrap_or("")).collect());

        let available = (doc.nodes.len() / width) as u64;
        let node_count = match doc.snapshot.node_count {
            Some(declared) if declared > available => {
                return Err(CaptureIssue::malformed(format!(
                    "snapshot declares {} nodes but the node table holds only {}",
                    declared, available
                )));
            }
            Some(declared) => declared,
            None => available,
        };

        let strings = StringTable::new(&doc.strings);
        let mut total_self_size: u64 = 0;
        let mut buckets: Vec<ConstructorStat> = Vec::new();
        let mut bucket_index: HashMap<Cow<'_, str>, usize> = HashMap::new();
        let mut top_nodes = TopK::new(top_n);

        for record in doc.nodes.chunks_exact(width).take(node_count as usize) {
            let self_size = record[size_idx].0;
            total_self_size = total_self_size.saturating_add(self_size);

            let name = strings.resolve(record[name_idx].0);
            let slot = match bucket_index.get(&name) {
                Some(&slot) => slot,
                None => {
                    buckets.push(ConstructorStat {
                        name: name.to_string(),
                        count: 0,
                        self_size_bytes: 0,
                    });
                    bucket_index.insert(name.clone(), buckets.len() - 1);
                    buckets.len() - 1
                }
            };
            let bucket = &mut buckets[slot];
            bucket.count += 1;
            bucket.self_size_bytes = bucket.self_size_bytes.saturating_add(self_size);

            if !top_nodes.admits(self_size) {
                top_nodes.skip();
                continue;
            }
            let raw_type = record[type_idx].0;
            let node_type = type_names
                .as_ref()
                .and_then(|names| usize::try_from(raw_type).ok().and_then(|i| names.get(i)))
                .map(|s| s.to_string())
                .unwrap_or_else(|| raw_type.to_string());
            top_nodes.push(
                self_size,
                NodeStat {
                    id: id_idx.map(|i| record[i].0),
                    name: name.into_owned(),
                    node_type,
                    self_size_bytes: self_size,
                },
            );
        }

        let mut top_constructors = TopK::new(top_n);
        for bucket in buckets {
            top_constructors.push(bucket.self_size_bytes, bucket);
        }

        Ok(ObjectGraphSummary {
            total_nodes: node_count,
            total_self_size_bytes: total_self_size,
            top_constructors: top_constructors.into_sorted(),
            top_nodes: top_nodes.into_sorted(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(nodes: Vec<u64>, strings: Vec<&str>) -> String {
        json!({
            "snapshot": {
                "meta": {
                    "node_fields": ["type", "name", "id", "self_size", "edge_count"],
                    "node_types": [["hidden", "array", "string", "object"], "string", "number", "number", "number"]
                }
            },
            "nodes": nodes,
            "strings": strings
        })
        .to_string()
    }

    #[test]
    fn test_aggregates_by_constructor() {
        // Two Foo (1000, 2000) and one Bar (5000)
        let text = snapshot(
            vec![3, 0, 1, 1000, 0, 3, 0, 3, 2000, 0, 3, 1, 5, 5000, 0],
            vec!["Foo", "Bar"],
        );
        let summary = ObjectGraphDecoder.decode(&text, 20).unwrap();
        assert_eq!(summary.total_nodes, 3);
        assert_eq!(summary.total_self_size_bytes, 8000);
        assert_eq!(
            summary.top_constructors,
            vec![
                ConstructorStat { name: "Bar".into(), count: 1, self_size_bytes: 5000 },
                ConstructorStat { name: "Foo".into(), count: 2, self_size_bytes: 3000 },
            ]
        );
        assert_eq!(summary.top_nodes[0].name, "Bar");
        assert_eq!(summary.top_nodes[0].node_type, "object");
        assert_eq!(summary.top_nodes[0].id, Some(5));
        assert_eq!(summary.top_nodes.len(), 3);
    }

    #[test]
    fn test_rankings_truncated_and_sorted() {
        let mut nodes = Vec::new();
        for i in 0..10u64 {
            nodes.extend([3, i, i, (i * 37) % 11, 0]);
        }
        let names: Vec<String> = (0..10).map(|i| format!("C{}", i)).collect();
        let text = snapshot(nodes, names.iter().map(String::as_str).collect());
        let summary = ObjectGraphDecoder.decode(&text, 4).unwrap();
        assert_eq!(summary.total_nodes, 10);
        assert_eq!(summary.top_nodes.len(), 4);
        assert_eq!(summary.top_constructors.len(), 4);
        assert!(summary
            .top_nodes
            .windows(2)
            .all(|w| w[0].self_size_bytes >= w[1].self_size_bytes));
        assert!(summary
            .top_constructors
            .windows(2)
            .all(|w| w[0].self_size_bytes >= w[1].self_size_bytes));
    }

    #[test]
    fn test_bad_string_index_and_unknown_type() {
        let text = snapshot(vec![99, 7, 1, 10, 0], vec!["Foo"]);
        let summary = ObjectGraphDecoder.decode(&text, 5).unwrap();
        assert_eq!(summary.top_nodes[0].name, "7");
        assert_eq!(summary.top_nodes[0].node_type, "99");
    }

    #[test]
    fn test_missing_self_size_is_malformed() {
        let text = json!({
            "snapshot": {"meta": {"node_fields": ["type", "name", "id"], "node_types": []}},
            "nodes": [0, 0, 1],
            "strings": ["x"]
        })
        .to_string();
        let err = ObjectGraphDecoder.decode(&text, 5).unwrap_err();
        assert!(matches!(err, CaptureIssue::MalformedCapture(_)));
        assert!(err.to_string().contains("self_size"));
    }

    #[test]
    fn test_declared_count_respected_and_checked() {
        let mut doc = json!({
            "snapshot": {
                "meta": {"node_fields": ["type", "name", "self_size"], "node_types": [["object"]]},
                "node_count": 1
            },
            "nodes": [0, 0, 5, 0, 0, 7],
            "strings": ["A"]
        });
        let summary = ObjectGraphDecoder.decode(&doc.to_string(), 5).unwrap();
        assert_eq!(summary.total_nodes, 1);
        assert_eq!(summary.total_self_size_bytes, 5);

        doc["snapshot"]["node_count"] = json!(3);
        assert!(ObjectGraphDecoder.decode(&doc.to_string(), 5).is_err());
    }

    #[test]
    fn test_null_self_size_counts_as_zero() {
        let text = r#"{"snapshot":{"meta":{"node_fields":["type","name","self_size"],"node_types":[["object"]]}},
            "nodes":[0,0,null,0,0,4],"strings":["A"]}"#;
        let summary = ObjectGraphDecoder.decode(text, 5).unwrap();
        assert_eq!(summary.total_nodes, 2);
        assert_eq!(summary.total_self_size_bytes, 4);
    }

    #[test]
    fn test_top_n_zero_keeps_totals() {
        let text = snapshot(vec![3, 0, 1, 1000, 0], vec!["Foo"]);
        let summary = ObjectGraphDecoder.decode(&text, 0).unwrap();
        assert_eq!(summary.total_self_size_bytes, 1000);
        assert!(summary.top_nodes.is_empty());
        assert!(summary.top_constructors.is_empty());
    }

    #[test]
    fn test_decoding_is_idempotent() {
        let text = snapshot(vec![3, 0, 1, 10, 0, 3, 1, 2, 10, 0], vec!["A", "B"]);
        let first = ObjectGraphDecoder.decode(&text, 5).unwrap();
        let second = ObjectGraphDecoder.decode(&text, 5).unwrap();
        assert_eq!(first, second);
        // equal sizes keep encounter order
        assert_eq!(first.top_constructors[0].name, "A");
    }
}
