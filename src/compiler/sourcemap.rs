//! Mapping from emitted instructions back to graph nodes and syntax.
//!
//! Ranges are half-open instruction-index ranges into the program section.
//! `word_offsets` converts an instruction index into the word offset used by
//! the machine's pointer.

use serde::{Deserialize, Serialize};

use super::graph::{NodeId, SourceOrigin};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpan {
    pub node: NodeId,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpan {
    pub label: u32,
    pub origin: SourceOrigin,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineSpan {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    pub nodes: Vec<NodeSpan>,
    pub labels: Vec<LabelSpan>,
    pub routines: Vec<RoutineSpan>,
    /// Word offset of every instruction, plus one trailing entry for the end.
    pub word_offsets: Vec<usize>,
}

impl SourceMap {
    /// Span of the instructions emitted for `node`.
    pub fn node_span(&self, node: NodeId) -> Option<&NodeSpan> {
        self.nodes.iter().find(|span| span.node == node)
    }

    /// Labels covering instruction `index`, innermost first.
    pub fn entries_at(&self, index: usize) -> Vec<&LabelSpan> {
        let mut entries: Vec<&LabelSpan> = self
            .labels
            .iter()
            .filter(|span| span.start <= index && index < span.end)
            .collect();
        entries.sort_by_key(|span| span.end - span.start);
        entries
    }

    /// Instruction index starting at word `offset` of the program section.
    pub fn instruction_at(&self, offset: usize) -> Option<usize> {
        let index = self.word_offsets.binary_search(&offset).ok()?;
        (index + 1 < self.word_offsets.len()).then_some(index)
    }

    pub fn routine_at(&self, index: usize) -> Option<&RoutineSpan> {
        self.routines
            .iter()
            .find(|span| span.start <= index && index < span.end)
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("failed to encode source map: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(label: u32, start: usize, end: usize) -> LabelSpan {
        LabelSpan {
            label,
            origin: SourceOrigin::new("ExpressionStatement"),
            start,
            end,
        }
    }

    #[test]
    fn test_entries_at_innermost_first() {
        let map = SourceMap {
            labels: vec![label(0, 0, 10), label(1, 2, 4), label(2, 10, 12)],
            ..SourceMap::default()
        };
        let labels: Vec<u32> = map.entries_at(3).iter().map(|span| span.label).collect();
        assert_eq!(labels, vec![1, 0]);
        assert_eq!(map.entries_at(10)[0].label, 2);
        assert!(map.entries_at(12).is_empty());
    }

    #[test]
    fn test_instruction_at() {
        let map = SourceMap {
            word_offsets: vec![0, 2, 3, 5],
            ..SourceMap::default()
        };
        assert_eq!(map.instruction_at(2), Some(1));
        assert_eq!(map.instruction_at(1), None);
        assert_eq!(map.instruction_at(5), None);
    }

    #[test]
    fn test_routine_at() {
        let routine = |name: &str, start, end| RoutineSpan {
            name: name.to_string(),
            start,
            end,
        };
        let map = SourceMap {
            routines: vec![routine("f", 4, 9), routine("g", 9, 12)],
            ..SourceMap::default()
        };
        assert!(map.routine_at(3).is_none());
        assert_eq!(map.routine_at(4).map(|r| r.name.as_str()), Some("f"));
        assert_eq!(map.routine_at(9).map(|r| r.name.as_str()), Some("g"));
        assert!(map.routine_at(12).is_none());
    }
}
