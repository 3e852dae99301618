//! Lowers the Graph IR to a linear instruction sequence.
//!
//! One depth-first pass tracks the operand stack depth at every point.
//! Variables are stack slots addressed by their distance from the top, and
//! jumps target labels that are resolved to program-relative word offsets in
//! a second pass once every instruction width is known.

use std::collections::HashMap;

use super::error::CompileError;
use super::graph::{Graph, GraphNode, JumpLabel, NodeId, RoutineId, SourceOrigin, VarId};
use super::runtime::{self, FRAME};
use super::sourcemap::{LabelSpan, NodeSpan, RoutineSpan, SourceMap};
use crate::vm::Op;

/// Words in one jump table dispatch entry:
/// `push 1; push d; peek; push offset; add; jump`.
pub const DISPATCH_WIDTH: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    Op(Op),
    /// `push` of a label's program-relative word offset.
    Offset(JumpLabel),
}

impl Emit {
    fn width(&self) -> usize {
        match self {
            Emit::Op(op) => op.width(),
            Emit::Offset(_) => 2,
        }
    }
}

/// Mutable context for one compilation.
#[derive(Debug, Default)]
pub struct CompilerState {
    depth: usize,
    /// Node being compiled, for error reports.
    current: NodeId,
    variables: HashMap<VarId, usize>,
    nodes: Vec<NodeSpan>,
    open_labels: HashMap<u32, (usize, SourceOrigin)>,
    labels: Vec<LabelSpan>,
    routines: Vec<RoutineSpan>,
    code: Vec<Emit>,
    marks: HashMap<JumpLabel, usize>,
    next_label: u32,
}

impl CompilerState {
    pub fn new(bindings: Vec<(VarId, usize)>, depth: usize) -> Self {
        Self {
            depth,
            variables: bindings.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Append `op`; fails if it would take more values than the stack holds.
    fn emit(&mut self, op: Op) -> Result<(), CompileError> {
        if self.depth < op.stack_inputs() {
            return Err(CompileError::InvalidStackState {
                node: self.current,
                expected: op.stack_inputs() as i64,
                actual: self.depth as i64,
                context: "instruction inputs",
            });
        }
        self.depth = (self.depth as i64 + op.stack_effect() as i64) as usize;
        self.code.push(Emit::Op(op));
        Ok(())
    }

    fn emit_offset(&mut self, label: JumpLabel) {
        self.depth += 1;
        self.code.push(Emit::Offset(label));
    }

    /// `swap; push 0; swap; write`: drop the value under the top.
    fn emit_drop_under(&mut self) -> Result<(), CompileError> {
        self.emit(Op::Swap)?;
        self.emit(Op::Push(0))?;
        self.emit(Op::Swap)?;
        self.emit(Op::Write)
    }

    fn mark(&mut self, label: JumpLabel) {
        self.marks.insert(label, self.code.len());
    }

    fn new_label(&mut self) -> JumpLabel {
        let label = JumpLabel::Local(self.next_label);
        self.next_label += 1;
        label
    }

    fn expect_net(
        &self,
        node: NodeId,
        before: usize,
        expected: i64,
        context: &'static str,
    ) -> Result<(), CompileError> {
        let actual = self.depth as i64 - before as i64;
        if actual != expected {
            return Err(CompileError::InvalidStackState {
                node,
                expected,
                actual,
                context,
            });
        }
        Ok(())
    }

    /// Resolve every label offset and produce the final instructions.
    fn finish(self) -> Result<Assembly, CompileError> {
        let mut word_offsets = Vec::with_capacity(self.code.len() + 1);
        let mut offset = 0;
        for emit in &self.code {
            word_offsets.push(offset);
            offset += emit.width();
        }
        word_offsets.push(offset);

        let mut ops = Vec::with_capacity(self.code.len());
        for emit in &self.code {
            let op = match emit {
                Emit::Op(op) => *op,
                Emit::Offset(label) => {
                    let index = self.marks.get(label).ok_or_else(|| {
                        CompileError::UnresolvedLabel {
                            label: label.to_string(),
                        }
                    })?;
                    Op::Push(word_offsets[*index] as i32)
                }
            };
            ops.push(op);
        }

        Ok(Assembly {
            ops,
            source_map: SourceMap {
                nodes: self.nodes,
                labels: self.labels,
                routines: self.routines,
                word_offsets,
            },
        })
    }
}

/// Output of code generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub ops: Vec<Op>,
    pub source_map: SourceMap,
}

impl Assembly {
    /// Encoded size in words.
    pub fn word_len(&self) -> usize {
        self.ops.iter().map(Op::width).sum()
    }
}

/// Code generator over one immutable graph.
pub struct Codegen<'g> {
    graph: &'g Graph,
    trace: bool,
}

impl<'g> Codegen<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            trace: false,
        }
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Compile a program root, then every routine.
    ///
    /// `root` runs with only the Runtime Header address on the stack and
    /// must end in `exit`; routines are placed after it. A routine root
    /// starts with the routine's entry mark and runs on its five-word frame.
    pub fn compile(&self, root: NodeId) -> Result<Assembly, CompileError> {
        let mut state = CompilerState::new(runtime::entry_bindings(), runtime::ENTRY_DEPTH);
        self.compile_node(&mut state, root)?;
        let main_len = state.code.len();

        for routine in self.graph.routines() {
            let body = routine.root.ok_or_else(|| CompileError::UndefinedFunction {
                name: routine.name.clone(),
            })?;

            state.depth = FRAME.len();
            state.variables = FRAME
                .iter()
                .cloned()
                .enumerate()
                .map(|(slot, var)| (var, slot + 1))
                .collect();

            let start = state.code.len();
            self.compile_node(&mut state, body)?;
            state.expect_net(body, 0, FRAME.len() as i64 + 1, "routine body")?;
            state.routines.push(RoutineSpan {
                name: routine.name.clone(),
                start,
                end: state.code.len(),
            });
        }

        let assembly = state.finish()?;
        if self.trace {
            eprintln!(
                "[CODEGEN] {} instructions ({} main), {} words, {} routines",
                assembly.ops.len(),
                main_len,
                assembly.word_len(),
                assembly.source_map.routines.len()
            );
        }
        Ok(assembly)
    }

    /// Compile a self-contained fragment on an empty stack.
    ///
    /// Returns the instructions and the stack depth they leave. Fragments
    /// may not jump, since no `Program` variable is bound.
    pub fn compile_fragment(&self, root: NodeId) -> Result<(Vec<Op>, usize), CompileError> {
        let mut state = CompilerState::new(Vec::new(), 0);
        self.compile_node(&mut state, root)?;
        let depth = state.depth;
        Ok((state.finish()?.ops, depth))
    }

    fn compile_node(&self, state: &mut CompilerState, node: NodeId) -> Result<(), CompileError> {
        let start = state.code.len();
        let parent = std::mem::replace(&mut state.current, node);
        match self.graph.node(node) {
            GraphNode::MachineOp { op, inputs } => {
                for input in inputs {
                    self.compile_value(state, *input, "operand")?;
                }
                if state.depth < op.stack_inputs() {
                    return Err(CompileError::InvalidStackState {
                        node,
                        expected: op.stack_inputs() as i64,
                        actual: state.depth as i64,
                        context: "machine op inputs",
                    });
                }
                state.emit(*op)?;
            }
            GraphNode::SetVar { id, value, body } => {
                self.compile_value(state, *value, "variable value")?;
                let previous = state.variables.insert(id.clone(), state.depth);
                self.compile_value(state, *body, "variable body")?;
                state.emit_drop_under()?;
                match previous {
                    Some(depth) => state.variables.insert(id.clone(), depth),
                    None => state.variables.remove(id),
                };
            }
            GraphNode::GetVar(id) => self.load_var(state, id)?,
            GraphNode::List(nodes) => {
                for child in nodes {
                    self.compile_node(state, *child)?;
                }
            }
            GraphNode::Branch {
                condition,
                on_true,
                on_false,
            } => self.compile_branch(state, *condition, *on_true, *on_false)?,
            GraphNode::JumpTable { index, cases } => {
                self.compile_jump_table(state, node, *index, cases)?
            }
            GraphNode::LabelStart { label, origin } => {
                state
                    .open_labels
                    .insert(*label, (state.code.len(), origin.clone()));
            }
            GraphNode::LabelEnd { label } => {
                let (start, origin) = state.open_labels.remove(label).ok_or_else(|| {
                    CompileError::UnresolvedLabel {
                        label: format!("span {}", label),
                    }
                })?;
                state.labels.push(LabelSpan {
                    label: *label,
                    origin,
                    start,
                    end: state.code.len(),
                });
            }
            GraphNode::DataLiteral(block) => {
                self.load_var(state, &VarId::Lookup)?;
                state.emit(Op::Push(*block as i32))?;
                state.emit(Op::Add)?;
                state.emit(Op::Read)?;
                self.load_var(state, &VarId::Runtime)?;
                state.emit(Op::Add)?;
            }
            GraphNode::Mark(label) => state.mark(*label),
            GraphNode::Goto(label) => self.emit_goto(state, *label)?,
            GraphNode::Call { routine, site } => self.compile_call(state, *routine, *site)?,
        }
        state.nodes.push(NodeSpan {
            node,
            start,
            end: state.code.len(),
        });
        state.current = parent;
        Ok(())
    }

    /// Compile a node that must leave exactly one value.
    fn compile_value(
        &self,
        state: &mut CompilerState,
        node: NodeId,
        context: &'static str,
    ) -> Result<(), CompileError> {
        let before = state.depth;
        self.compile_node(state, node)?;
        state.expect_net(node, before, 1, context)
    }

    /// `push distance; peek`
    fn load_var(&self, state: &mut CompilerState, id: &VarId) -> Result<(), CompileError> {
        let defined = *state
            .variables
            .get(id)
            .ok_or_else(|| CompileError::UndefinedVariable {
                name: id.to_string(),
            })?;
        state.emit(Op::Push((state.depth - defined) as i32))?;
        state.emit(Op::Peek)?;
        Ok(())
    }

    /// Jump to `label` if the value on the stack is 1.
    fn emit_jump_if(&self, state: &mut CompilerState, label: JumpLabel) -> Result<(), CompileError> {
        self.load_var(state, &VarId::Program)?;
        state.emit_offset(label);
        state.emit(Op::Add)?;
        state.emit(Op::Jump)?;
        Ok(())
    }

    fn emit_goto(&self, state: &mut CompilerState, label: JumpLabel) -> Result<(), CompileError> {
        state.emit(Op::Push(1))?;
        self.emit_jump_if(state, label)
    }

    fn compile_branch(
        &self,
        state: &mut CompilerState,
        condition: NodeId,
        on_true: NodeId,
        on_false: NodeId,
    ) -> Result<(), CompileError> {
        let true_label = state.new_label();
        let end_label = state.new_label();

        self.compile_value(state, condition, "branch condition")?;
        self.emit_jump_if(state, true_label)?;
        let base = state.depth;

        self.compile_node(state, on_false)?;
        let net = state.depth as i64 - base as i64;
        self.emit_goto(state, end_label)?;

        state.mark(true_label);
        state.depth = base;
        self.compile_node(state, on_true)?;
        state.expect_net(on_true, base, net, "branch arm")?;
        state.mark(end_label);
        Ok(())
    }

    fn compile_jump_table(
        &self,
        state: &mut CompilerState,
        node: NodeId,
        index: NodeId,
        cases: &[NodeId],
    ) -> Result<(), CompileError> {
        if cases.is_empty() {
            return Err(CompileError::unsupported(
                "JumpTable",
                format!("node {} has no cases", node),
            ));
        }
        let table = state.new_label();
        let end = state.new_label();
        let case_labels: Vec<JumpLabel> = cases.iter().map(|_| state.new_label()).collect();

        // target = Program + table + index * DISPATCH_WIDTH
        self.compile_value(state, index, "jump table index")?;
        state.emit(Op::Push(DISPATCH_WIDTH))?;
        state.emit(Op::Mult)?;
        self.load_var(state, &VarId::Program)?;
        state.emit(Op::Add)?;
        state.emit_offset(table);
        state.emit(Op::Add)?;
        state.emit(Op::Push(1))?;
        state.emit(Op::Swap)?;
        state.emit(Op::Jump)?;
        let base = state.depth;

        state.mark(table);
        for label in &case_labels {
            state.depth = base;
            self.emit_goto(state, *label)?;
        }

        let mut net = None;
        for (case, label) in cases.iter().zip(&case_labels) {
            state.depth = base;
            state.mark(*label);
            self.compile_node(state, *case)?;
            match net {
                None => net = Some(state.depth as i64 - base as i64),
                Some(expected) => state.expect_net(*case, base, expected, "jump table case")?,
            }
            self.emit_goto(state, end)?;
        }

        state.depth = (base as i64 + net.unwrap_or(0)) as usize;
        state.mark(end);
        Ok(())
    }

    /// Push a frame, jump to the routine, and drop the frame under its
    /// result once it returns here.
    fn compile_call(
        &self,
        state: &mut CompilerState,
        routine: RoutineId,
        site: u32,
    ) -> Result<(), CompileError> {
        let base = state.depth;
        for var in &FRAME[..FRAME.len() - 1] {
            self.load_var(state, var)?;
        }
        state.emit(Op::Push(site as i32))?;
        self.emit_goto(state, JumpLabel::Entry(routine))?;

        state.mark(JumpLabel::Return(routine, site));
        state.depth = base + FRAME.len() + 1;
        for _ in 0..FRAME.len() {
            state.emit_drop_under()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::encode_program;
    use crate::vm::{Machine, Memory};

    fn run_fragment(graph: &Graph, root: NodeId) -> (Vec<i32>, usize) {
        let (mut ops, depth) = Codegen::new(graph).compile_fragment(root).unwrap();
        ops.push(Op::Exit);
        let mut machine = Machine::new(Memory::new(encode_program(&ops)), 0);
        machine
            .run(&mut |_: &mut Machine| -> Result<(), String> { Ok(()) })
            .unwrap();
        assert!(machine.fault().is_none(), "{:?}", machine.fault());
        assert_eq!(machine.stack().len(), depth, "tracked depth drifted from the machine");
        (machine.stack().to_vec(), depth)
    }

    #[test]
    fn test_get_var_emits_distance_and_peek() {
        let mut graph = Graph::new();
        let value = graph.push(42);
        let filler = graph.push(1);
        let read = graph.get_var(VarId::named("x"));
        let sum = graph.add(filler, read);
        let root = graph.set_var(VarId::named("x"), value, sum);

        let (ops, depth) = Codegen::new(&graph).compile_fragment(root).unwrap();
        assert_eq!(
            ops,
            vec![
                Op::Push(42),
                Op::Push(1),
                Op::Push(1),
                Op::Peek,
                Op::Add,
                Op::Swap,
                Op::Push(0),
                Op::Swap,
                Op::Write,
            ]
        );
        assert_eq!(depth, 1);
        assert_eq!(run_fragment(&graph, root), (vec![43], 1));
    }

    #[test]
    fn test_shadowing_restores_outer_binding() {
        let mut graph = Graph::new();
        let outer_value = graph.push(1);
        let inner_value = graph.push(2);
        let inner_read = graph.get_var(VarId::named("x"));
        let inner = graph.set_var(VarId::named("x"), inner_value, inner_read);
        let after = graph.get_var(VarId::named("x"));
        let body = graph.mult(inner, after);
        let ten = graph.push(10);
        let body = graph.add(body, ten);
        let root = graph.set_var(VarId::named("x"), outer_value, body);

        // inner x = 2, outer x = 1: 2 * 1 + 10
        assert_eq!(run_fragment(&graph, root).0, vec![12]);
    }

    #[test]
    fn test_scope_ends_with_set_var() {
        let mut graph = Graph::new();
        let value = graph.push(1);
        let body = graph.get_var(VarId::named("x"));
        let scoped = graph.set_var(VarId::named("x"), value, body);
        let escaped = graph.get_var(VarId::named("x"));
        let root = graph.add(scoped, escaped);

        let err = Codegen::new(&graph).compile_fragment(root).unwrap_err();
        assert_eq!(
            err,
            CompileError::UndefinedVariable {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn test_set_var_value_must_leave_one_value() {
        let mut graph = Graph::new();
        let a = graph.push(1);
        let b = graph.push(2);
        let two_values = graph.list(vec![a, b]);
        let body = graph.push(3);
        let root = graph.set_var(VarId::named("x"), two_values, body);

        let err = Codegen::new(&graph).compile_fragment(root).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InvalidStackState {
                expected: 1,
                actual: 2,
                context: "variable value",
                ..
            }
        ));
    }

    #[test]
    fn test_operand_without_value() {
        let mut graph = Graph::new();
        let empty = graph.list(Vec::new());
        let one = graph.push(1);
        let root = graph.add(empty, one);
        assert!(matches!(
            Codegen::new(&graph).compile_fragment(root),
            Err(CompileError::InvalidStackState { actual: 0, .. })
        ));
    }

    #[test]
    fn test_emit_rejects_underflow() {
        let mut state = CompilerState::new(Vec::new(), 0);
        state.emit(Op::Push(1)).unwrap();
        assert!(matches!(
            state.emit(Op::Add),
            Err(CompileError::InvalidStackState {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert_eq!(state.depth(), 1);
    }

    #[test]
    fn test_nested_set_var() {
        let mut graph = Graph::new();
        let one = graph.push(1);
        let two = graph.push(2);
        let x = graph.get_var(VarId::named("x"));
        let y = graph.get_var(VarId::named("y"));
        let sum = graph.add(x, y);
        let inner = graph.set_var(VarId::named("y"), two, sum);
        let root = graph.set_var(VarId::named("x"), one, inner);

        assert_eq!(run_fragment(&graph, root), (vec![3], 1));
    }

    #[test]
    fn test_branch_arms_meet_at_same_depth() {
        for (condition, expected) in [(1, 15), (0, 25)] {
            let mut graph = Graph::new();
            let program = graph.push(0);
            let test = graph.push(condition);
            let ten = graph.push(10);
            let twenty = graph.push(20);
            let chosen = graph.branch(test, ten, twenty);
            let five = graph.push(5);
            let sum = graph.add(chosen, five);
            let root = graph.set_var(VarId::Program, program, sum);

            assert_eq!(run_fragment(&graph, root), (vec![expected], 1));
        }
    }

    #[test]
    fn test_unresolved_label() {
        let mut graph = Graph::new();
        let program = graph.push(0);
        let goto = graph.insert(GraphNode::Goto(JumpLabel::Local(99)));
        let value = graph.push(0);
        let body = graph.list(vec![goto, value]);
        let root = graph.set_var(VarId::Program, program, body);
        assert_eq!(
            Codegen::new(&graph).compile_fragment(root).unwrap_err(),
            CompileError::UnresolvedLabel {
                label: "L99".to_string()
            }
        );
    }

    #[test]
    fn test_labels_record_spans() {
        let mut graph = Graph::new();
        let one = graph.push(1);
        let two = graph.push(2);
        let sum = graph.add(one, two);
        let root = graph.labelled(0, SourceOrigin::new("BinaryExpression"), sum);

        let mut state = CompilerState::new(Vec::new(), 0);
        let codegen = Codegen::new(&graph);
        codegen.compile_node(&mut state, root).unwrap();
        let assembly = state.finish().unwrap();

        assert_eq!(assembly.source_map.labels.len(), 1);
        let span = &assembly.source_map.labels[0];
        assert_eq!((span.start, span.end), (0, 3));
        assert_eq!(span.origin.construct, "BinaryExpression");
        assert_eq!(assembly.source_map.node_span(sum).map(|s| (s.start, s.end)), Some((0, 3)));
        assert_eq!(assembly.source_map.word_offsets, vec![0, 2, 4, 5]);
    }
}
