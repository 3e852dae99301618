//! Graph IR.
//!
//! Nodes live in one arena and refer to each other by [`NodeId`]. A graph is
//! built once by the frontend and only read by the code generator.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::CompileError;
use crate::vm::Op;
use crate::vm::layout::RuntimeStruct;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutineId(pub u32);

/// A variable bound by [`GraphNode::SetVar`].
///
/// Only `Named` comes from user code, so runtime and scratch bindings can
/// never be captured or shadowed by a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarId {
    Named(String),
    /// Absolute address of the Runtime Header.
    Runtime,
    /// Absolute address of the data lookup table.
    Lookup,
    /// Absolute address of the first data block.
    Data,
    /// Absolute address of the first program word.
    Program,
    /// Call site index inside a routine frame.
    Return,
    Scratch(&'static str),
}

impl VarId {
    pub fn named(name: impl Into<String>) -> Self {
        VarId::Named(name.into())
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarId::Named(name) => write!(f, "{}", name),
            VarId::Runtime => write!(f, "%runtime"),
            VarId::Lookup => write!(f, "%lookup"),
            VarId::Data => write!(f, "%data"),
            VarId::Program => write!(f, "%program"),
            VarId::Return => write!(f, "%return"),
            VarId::Scratch(name) => write!(f, "%{}", name),
        }
    }
}

/// A position in the instruction stream that jumps can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpLabel {
    /// First instruction of a routine.
    Entry(RoutineId),
    /// Instruction after a call site returns.
    Return(RoutineId, u32),
    /// Allocated by the code generator for branches and tables.
    Local(u32),
}

impl fmt::Display for JumpLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpLabel::Entry(routine) => write!(f, "entry{}", routine.0),
            JumpLabel::Return(routine, site) => write!(f, "return{}.{}", routine.0, site),
            JumpLabel::Local(id) => write!(f, "L{}", id),
        }
    }
}

/// Syntax construct a label stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOrigin {
    pub construct: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u32>,
}

impl SourceOrigin {
    pub fn new(construct: impl Into<String>) -> Self {
        Self {
            construct: construct.into(),
            start: None,
            end: None,
        }
    }

    pub fn with_range(mut self, start: Option<u32>, end: Option<u32>) -> Self {
        self.start = start;
        self.end = end;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    /// Evaluate every input (each leaves one value) then run `op`.
    MachineOp { op: Op, inputs: Vec<NodeId> },
    /// Bind `value` to `id` while `body` runs; leaves only the body's value.
    SetVar { id: VarId, value: NodeId, body: NodeId },
    GetVar(VarId),
    List(Vec<NodeId>),
    /// Run `on_true` when `condition` is 1, `on_false` otherwise.
    Branch {
        condition: NodeId,
        on_true: NodeId,
        on_false: NodeId,
    },
    /// Run `cases[index]`.
    JumpTable { index: NodeId, cases: Vec<NodeId> },
    LabelStart { label: u32, origin: SourceOrigin },
    LabelEnd { label: u32 },
    /// Push the absolute address of a static data block.
    DataLiteral(usize),
    /// Place a jump label here.
    Mark(JumpLabel),
    /// Jump unconditionally to a label.
    Goto(JumpLabel),
    /// Run a routine and leave its result.
    Call { routine: RoutineId, site: u32 },
}

/// A shared subroutine, compiled once after the main program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub name: String,
    /// Body evaluated in the routine frame, set once the routine is finished.
    pub root: Option<NodeId>,
    /// Number of call sites, including those in other routines.
    pub sites: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    routines: Vec<Routine>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: GraphNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn routines(&self) -> &[Routine] {
        &self.routines
    }

    pub fn routine(&self, id: RoutineId) -> &Routine {
        &self.routines[id.0 as usize]
    }

    pub fn add_routine(&mut self, name: impl Into<String>) -> RoutineId {
        let id = RoutineId(self.routines.len() as u32);
        self.routines.push(Routine {
            name: name.into(),
            root: None,
            sites: 0,
        });
        id
    }

    pub fn set_routine_root(&mut self, id: RoutineId, root: NodeId) {
        self.routines[id.0 as usize].root = Some(root);
    }

    /// Reserve the next call site of `routine` and return its call node.
    pub fn call(&mut self, routine: RoutineId) -> NodeId {
        let entry = &mut self.routines[routine.0 as usize];
        let site = entry.sites;
        entry.sites += 1;
        self.insert(GraphNode::Call { routine, site })
    }

    // ========================================
    // Construction helpers
    // ========================================

    pub fn op(&mut self, op: Op, inputs: Vec<NodeId>) -> NodeId {
        self.insert(GraphNode::MachineOp { op, inputs })
    }

    pub fn push(&mut self, value: i32) -> NodeId {
        self.op(Op::Push(value), Vec::new())
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.op(Op::Add, vec![a, b])
    }

    pub fn mult(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.op(Op::Mult, vec![a, b])
    }

    pub fn read(&mut self, address: NodeId) -> NodeId {
        self.op(Op::Read, vec![address])
    }

    /// Store `value` at `address`; leaves nothing.
    pub fn write(&mut self, address: NodeId, value: NodeId) -> NodeId {
        self.op(Op::Write, vec![address, value])
    }

    /// Evaluate `value` and drop it.
    pub fn discard(&mut self, value: NodeId) -> NodeId {
        let null = self.push(0);
        self.write(null, value)
    }

    pub fn get_var(&mut self, id: VarId) -> NodeId {
        self.insert(GraphNode::GetVar(id))
    }

    pub fn set_var(&mut self, id: VarId, value: NodeId, body: NodeId) -> NodeId {
        self.insert(GraphNode::SetVar { id, value, body })
    }

    pub fn list(&mut self, nodes: Vec<NodeId>) -> NodeId {
        self.insert(GraphNode::List(nodes))
    }

    pub fn branch(&mut self, condition: NodeId, on_true: NodeId, on_false: NodeId) -> NodeId {
        self.insert(GraphNode::Branch {
            condition,
            on_true,
            on_false,
        })
    }

    pub fn jump_table(&mut self, index: NodeId, cases: Vec<NodeId>) -> NodeId {
        self.insert(GraphNode::JumpTable { index, cases })
    }

    pub fn data_literal(&mut self, block: usize) -> NodeId {
        self.insert(GraphNode::DataLiteral(block))
    }

    /// Address of `field` in the struct at `base`.
    pub fn field(
        &mut self,
        base: NodeId,
        layout: &RuntimeStruct,
        field: &str,
    ) -> Result<NodeId, CompileError> {
        let index = layout
            .field_index(field)
            .ok_or_else(|| CompileError::UnknownStructField {
                structure: layout.name.to_string(),
                field: field.to_string(),
            })?;
        let offset = self.push(index as i32);
        Ok(self.add(base, offset))
    }

    /// Address of `field` in the struct whose address is bound to `var`.
    pub fn var_field(
        &mut self,
        var: VarId,
        layout: &RuntimeStruct,
        field: &str,
    ) -> Result<NodeId, CompileError> {
        let base = self.get_var(var);
        self.field(base, layout, field)
    }

    /// Wrap `body` in a labelled span.
    pub fn labelled(&mut self, label: u32, origin: SourceOrigin, body: NodeId) -> NodeId {
        let start = self.insert(GraphNode::LabelStart { label, origin });
        let end = self.insert(GraphNode::LabelEnd { label });
        self.list(vec![start, body, end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::layout::RUNTIME_HEADER;

    #[test]
    fn test_arena_ids_are_sequential() {
        let mut graph = Graph::new();
        let a = graph.push(1);
        let b = graph.push(2);
        let sum = graph.add(a, b);
        assert_eq!((a, b, sum), (NodeId(0), NodeId(1), NodeId(2)));
        assert_eq!(
            graph.node(sum),
            &GraphNode::MachineOp {
                op: Op::Add,
                inputs: vec![a, b]
            }
        );
    }

    #[test]
    fn test_unknown_field() {
        let mut graph = Graph::new();
        let err = graph
            .var_field(VarId::Runtime, &RUNTIME_HEADER, "stackOffset")
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownStructField {
                structure: "RuntimeHeader".to_string(),
                field: "stackOffset".to_string()
            }
        );
    }

    #[test]
    fn test_call_sites_are_numbered() {
        let mut graph = Graph::new();
        let routine = graph.add_routine("test");
        let first = graph.call(routine);
        let second = graph.call(routine);
        assert_eq!(graph.node(first), &GraphNode::Call { routine, site: 0 });
        assert_eq!(graph.node(second), &GraphNode::Call { routine, site: 1 });
        assert_eq!(graph.routine(routine).sites, 2);
    }

    #[test]
    fn test_reserved_names_do_not_collide() {
        assert_ne!(VarId::named("runtime"), VarId::Runtime);
        assert_eq!(VarId::Runtime.to_string(), "%runtime");
    }
}
