//! Allocation-trace decoder: ranks leaf call stacks of the allocation tree.
//!
//! The tree is stored pre-order. Each record carries a function reference, an
//! allocation count, allocated bytes and its children, either as a count (the
//! children follow in sequence) or, as V8 emits it, as a nested array holding
//! the children's records. Both encodings are normalized into one flat
//! pre-order sequence and walked with explicit stacks, never by recursion.
//! Document parsing itself grows the stack on demand for deeply nested trees.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

use super::document::{
    value_u64, CaptureDecoder, FieldLayout, Num, SnapshotDocument, StringTable, TopK,
};
use super::issue::CaptureIssue;

const FUNCTION_ALIASES: &[&str] = &["function_info_index", "function_index", "function_id"];
const COUNT_ALIASES: &[&str] = &["count", "allocation_count"];
const SIZE_ALIASES: &[&str] = &["size", "allocation_size", "self_size"];
const CHILDREN_ALIASES: &[&str] = &["children", "child_count", "children_count"];

const NAME_ALIASES: &[&str] = &["name", "function_name"];
const FILE_ALIASES: &[&str] = &["script_name", "url", "source"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackStat {
    pub stack_trace: Vec<String>,
    pub size_bytes: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationTraceSummary {
    pub total_allocated_bytes: u64,
    pub total_count: u64,
    pub top_stacks: Vec<StackStat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TraceRecord {
    function_index: u64,
    count: u64,
    size: u64,
    child_count: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllocationTraceDecoder;

impl CaptureDecoder for AllocationTraceDecoder {
    type Summary = AllocationTraceSummary;

    fn decode_document(
        &self,
        doc: &SnapshotDocument,
        top_n: usize,
    ) -> Result<AllocationTraceSummary, CaptureIssue> {
        let meta = &doc.snapshot.meta;
        if meta.trace_node_fields.is_empty() {
            return Err(CaptureIssue::malformed(
                "snapshot has no trace_node_fields; allocation tracking data is absent",
            ));
        }
        if doc.trace_tree.is_empty() {
            return Err(CaptureIssue::malformed("trace_tree is empty"));
        }

        let records = flatten_tree(
            &doc.trace_tree,
            FieldLayout::new("snapshot.meta.trace_node_fields", &meta.trace_node_fields),
        )?;
        let mut frames = FrameResolver::new(doc)?;
        walk(&records, &mut frames, top_n)
    }
}

/// Normalize either tree encoding into flat pre-order records.
fn flatten_tree(tree: &[Value], layout: FieldLayout<'_>) -> Result<Vec<TraceRecord>, CaptureIssue> {
    let width = layout.width();
    let function_idx = layout.require(FUNCTION_ALIASES)?;
    let count_idx = layout.require(COUNT_ALIASES)?;
    let size_idx = layout.require(SIZE_ALIASES)?;
    let children_idx = layout.require(CHILDREN_ALIASES)?;

    let mut records = Vec::new();
    // Sibling sequences still to read; the top is read first.
    let mut pending: Vec<&[Value]> = vec![tree];

    while let Some(seq) = pending.pop() {
        if seq.is_empty() {
            continue;
        }
        if seq.len() < width {
            return Err(CaptureIssue::malformed(format!(
                "trace_tree ends inside a record ({} of {} fields present)",
                seq.len(),
                width
            )));
        }
        let (record, rest) = seq.split_at(width);
        let (child_count, nested) = match &record[children_idx] {
            Value::Array(children) => {
                if children.len() % width != 0 {
                    return Err(CaptureIssue::malformed(format!(
                        "nested trace children hold {} values, not a multiple of {}",
                        children.len(),
                        width
                    )));
                }
                ((children.len() / width) as u64, Some(children.as_slice()))
            }
            other => (value_u64(other), None),
        };

        records.push(TraceRecord {
            function_index: value_u64(&record[function_idx]),
            count: value_u64(&record[count_idx]),
            size: value_u64(&record[size_idx]),
            child_count,
        });

        pending.push(rest);
        if let Some(children) = nested {
            pending.push(children);
        }
    }

    Ok(records)
}

/// Depth-first walk over pre-order records, collecting ranked leaf stacks.
fn walk(
    records: &[TraceRecord],
    frames: &mut FrameResolver<'_>,
    top_n: usize,
) -> Result<AllocationTraceSummary, CaptureIssue> {
    let mut iter = records.iter();
    let root = iter
        .next()
        .ok_or_else(|| CaptureIssue::malformed("trace_tree holds no root record"))?;

    let mut top = TopK::new(top_n);
    // Remaining children per open level; the root level is the bottom entry.
    let mut remaining: Vec<u64> = vec![root.child_count];
    // Frame labels of the open non-root levels.
    let mut path: Vec<Rc<str>> = Vec::new();

    while let Some(left) = remaining.last_mut() {
        if *left == 0 {
            remaining.pop();
            if !remaining.is_empty() {
                path.pop();
            }
            continue;
        }
        *left -= 1;

        let node = iter.next().ok_or_else(|| {
            CaptureIssue::malformed(format!(
                "trace_tree is truncated: child counts declare more than {} records",
                records.len()
            ))
        })?;
        let label = frames.label(node.function_index);

        if node.child_count > 0 {
            path.push(label);
            remaining.push(node.child_count);
        } else if node.size > 0 {
            if top.admits(node.size) {
                let stack_trace = path
                    .iter()
                    .chain(std::iter::once(&label))
                    .map(|frame| frame.to_string())
                    .collect();
                top.push(
                    node.size,
                    StackStat {
                        stack_trace,
                        size_bytes: node.size,
                        count: node.count,
                    },
                );
            } else {
                top.skip();
            }
        }
    }

    let trailing = iter.count();
    if trailing > 0 {
        debug!(trailing = trailing, "Ignoring records after the allocation tree");
    }

    Ok(AllocationTraceSummary {
        total_allocated_bytes: root.size,
        total_count: root.count,
        top_stacks: top.into_sorted(),
    })
}

/// Turns function-descriptor indices into `name (file:line:column)` labels.
struct FrameResolver<'a> {
    infos: &'a [Num],
    width: usize,
    name_idx: usize,
    file_idx: Option<usize>,
    line_idx: Option<usize>,
    column_idx: Option<usize>,
    strings: StringTable<'a>,
    cache: HashMap<u64, Rc<str>>,
}

impl<'a> FrameResolver<'a> {
    fn new(doc: &'a SnapshotDocument) -> Result<Self, CaptureIssue> {
        let layout = FieldLayout::new(
            "snapshot.meta.trace_function_info_fields",
            &doc.snapshot.meta.trace_function_info_fields,
        );
        let width = layout.width();
        if width == 0 {
            return Err(CaptureIssue::malformed(
                "snapshot has no trace_function_info_fields",
            ));
        }
        Ok(Self {
            infos: &doc.trace_function_infos,
            width,
            name_idx: layout.require(NAME_ALIASES)?,
            file_idx: layout.index_of(FILE_ALIASES),
            line_idx: layout.index_of(&["line"]),
            column_idx: layout.index_of(&["column"]),
            strings: StringTable::new(&doc.strings),
            cache: HashMap::new(),
        })
    }

    fn label(&mut self, function_index: u64) -> Rc<str> {
        if let Some(label) = self.cache.get(&function_index) {
            return label.clone();
        }
        let label: Rc<str> = self.render(function_index).into();
        self.cache.insert(function_index, label.clone());
        label
    }

    fn render(&self, function_index: u64) -> String {
        let Some(info) = usize::try_from(function_index)
            .ok()
            .and_then(|i| i.checked_mul(self.width))
            .and_then(|start| Some(start..start.checked_add(self.width)?))
            .and_then(|range| self.infos.get(range))
        else {
            return format!("(unknown function #{})", function_index);
        };

        let name = match self.strings.get(info[self.name_idx].0) {
            Some("") | None => "(anonymous)",
            Some(name) => name,
        };
        let file = self
            .file_idx
            .and_then(|i| self.strings.get(info[i].0))
            .filter(|f| !f.is_empty());

        match file {
            Some(file) => {
                let line = self.line_idx.map(|i| info[i].0).unwrap_or(0);
                let column = self.column_idx.map(|i| info[i].0).unwrap_or(0);
                format!("{} ({}:{}:{})", name, file, line, column)
            }
            None => name.to_string(),
        }
    }
}
