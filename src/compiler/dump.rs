//! Pretty-printers for the Graph IR and linked images.
//!
//! This module provides human-readable output for debugging the compiler pipeline.

use super::data::DataBlock;
use super::graph::{Graph, GraphNode, NodeId};
use super::link::ImageLayout;
use super::sourcemap::SourceMap;
use super::Compilation;
use crate::vm::bytecode::{self, EncodingError};

/// Pretty-printer for the Graph IR.
pub struct GraphPrinter<'a> {
    graph: &'a Graph,
    output: String,
}

impl<'a> GraphPrinter<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        Self {
            graph,
            output: String::new(),
        }
    }

    pub fn print(&mut self, root: NodeId) -> &str {
        self.output.push_str("Program\n");
        self.print_node(root, "", true);
        for routine in self.graph.routines() {
            let Some(root) = routine.root else {
                continue;
            };
            self.output.push_str(&format!(
                "Routine {} ({} call sites)\n",
                routine.name, routine.sites
            ));
            self.print_node(root, "", true);
        }
        &self.output
    }

    fn print_node(&mut self, id: NodeId, indent: &str, is_last: bool) {
        let prefix = if is_last { "└── " } else { "├── " };
        let child_indent = format!("{}{}", indent, if is_last { "    " } else { "│   " });

        let node = self.graph.node(id);
        let (text, children): (String, Vec<NodeId>) = match node {
            GraphNode::MachineOp { op, inputs } => (format!("{}", op), inputs.clone()),
            GraphNode::SetVar { id, value, body } => {
                (format!("SetVar {}", id), vec![*value, *body])
            }
            GraphNode::GetVar(id) => (format!("GetVar {}", id), Vec::new()),
            GraphNode::List(nodes) => ("List".to_string(), nodes.clone()),
            GraphNode::Branch {
                condition,
                on_true,
                on_false,
            } => ("Branch".to_string(), vec![*condition, *on_true, *on_false]),
            GraphNode::JumpTable { index, cases } => {
                let mut children = vec![*index];
                children.extend(cases);
                (format!("JumpTable ({} cases)", cases.len()), children)
            }
            GraphNode::LabelStart { label, origin } => {
                (format!("LabelStart {} {}", label, origin.construct), Vec::new())
            }
            GraphNode::LabelEnd { label } => (format!("LabelEnd {}", label), Vec::new()),
            GraphNode::DataLiteral(block) => (format!("Data [{}]", block), Vec::new()),
            GraphNode::Mark(label) => (format!("Mark {}", label), Vec::new()),
            GraphNode::Goto(label) => (format!("Goto {}", label), Vec::new()),
            GraphNode::Call { routine, site } => (
                format!("Call {} site {}", self.graph.routine(*routine).name, site),
                Vec::new(),
            ),
        };

        self.output
            .push_str(&format!("{}{}{} {}\n", indent, prefix, id, text));
        for (i, child) in children.iter().enumerate() {
            self.print_node(*child, &child_indent, i == children.len() - 1);
        }
    }
}

/// Format a graph as a tree, followed by every finished routine.
pub fn format_graph(graph: &Graph, root: NodeId) -> String {
    let mut printer = GraphPrinter::new(graph);
    printer.print(root).to_string()
}

/// Disassembler for linked images.
pub struct Disassembler<'a> {
    memory: &'a [i32],
    layout: ImageLayout,
    source_map: Option<&'a SourceMap>,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(memory: &'a [i32], layout: ImageLayout) -> Self {
        Self {
            memory,
            layout,
            source_map: None,
            output: String::new(),
        }
    }

    pub fn with_source_map(mut self, source_map: &'a SourceMap) -> Self {
        self.source_map = Some(source_map);
        self
    }

    pub fn disassemble(&mut self) -> Result<&str, EncodingError> {
        self.output.push_str(&format!(
            "== Image ({} words, header at {}) ==\n",
            self.layout.end, self.layout.header
        ));

        if self.layout.lookup > self.layout.data {
            self.output.push_str("== Data ==\n");
            for (i, word) in self.memory[self.layout.data..self.layout.lookup]
                .iter()
                .enumerate()
            {
                self.output
                    .push_str(&format!("{:04}: {}\n", self.layout.data + i, word));
            }
            self.output.push_str("== Lookup ==\n");
            for (i, offset) in self.memory[self.layout.lookup..self.layout.program]
                .iter()
                .enumerate()
            {
                self.output.push_str(&format!(
                    "  [{}] header{:+} = {:04}\n",
                    i,
                    offset,
                    self.layout.header as i64 + *offset as i64
                ));
            }
        }

        self.output.push_str("== Program ==\n");
        let program = &self.memory[self.layout.program..self.layout.header];
        for (index, (offset, op)) in bytecode::decode_program(program)?.into_iter().enumerate() {
            if let Some(routine) = self
                .source_map
                .and_then(|map| map.routine_at(index))
                .filter(|span| span.start == index)
            {
                self.output
                    .push_str(&format!("-- routine {} --\n", routine.name));
            }
            self.output.push_str(&format!(
                "{:04}  +{:04}  {}",
                self.layout.program + offset,
                offset,
                op
            ));
            if let Some(map) = self.source_map
                && let Some(label) = map.entries_at(index).first()
                && label.start == index
            {
                self.output
                    .push_str(&format!("    ; {}", label.origin.construct));
            }
            self.output.push('\n');
        }

        self.output.push_str("== Runtime Header ==\n");
        for (i, word) in self.memory[self.layout.header..self.layout.end]
            .iter()
            .enumerate()
        {
            self.output
                .push_str(&format!("{:04}: {}\n", self.layout.header + i, word));
        }
        Ok(&self.output)
    }
}

/// Format the linked image of a compilation.
pub fn format_bytecode(compilation: &Compilation) -> Result<String, EncodingError> {
    let mut disassembler = Disassembler::new(&compilation.executable.memory, compilation.layout)
        .with_source_map(&compilation.source_map);
    disassembler.disassemble().map(str::to_string)
}

/// One-line description of each static data block.
pub fn format_data(blocks: &[DataBlock]) -> String {
    let mut output = String::new();
    for (i, block) in blocks.iter().enumerate() {
        let text = match block {
            DataBlock::Number(value) => format!("number {}", value),
            DataBlock::Bytes(bytes) => format!("bytes {:?}", String::from_utf8_lossy(bytes)),
            DataBlock::StringValue(raw) => format!("string -> [{}]", raw),
        };
        output.push_str(&format!("  [{:04}] {}\n", i, text));
    }
    output
}
