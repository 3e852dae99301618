//! Lowers the syntax tree into the Graph IR.
//!
//! Numbers are boxed Values, so arithmetic unboxes both payloads, operates on
//! the raw words and boxes the result into a freshly allocated Value.

use std::collections::HashMap;

use super::allocator;
use super::ast::{
    BinaryExpression, Block, CallExpression, Expression, FunctionDeclaration, Literal,
    LiteralValue, Span, Statement,
};
use super::data::DataSection;
use super::error::CompileError;
use super::graph::{Graph, GraphNode, JumpLabel, NodeId, RoutineId, SourceOrigin, VarId};
use crate::vm::Op;
use crate::vm::layout::{
    BEEP_SYSCALL, FILE_SYSCALL, RESIZE_SYSCALL, RuntimeStruct, SYSTEM_STATE, SYSTEM_STATE_ADDRESS,
};
use crate::vm::syscall::kind;

/// Calls handled by the builder instead of user routines.
pub const BUILTINS: [&str; 5] = ["malloc", "write", "read", "beep", "resize"];

/// Graph, data and program body produced by [`GraphBuilder::lower_program`].
#[derive(Debug, Clone)]
pub struct Lowered {
    pub graph: Graph,
    pub data: DataSection,
    pub body: NodeId,
}

/// A statement lowered on its own, before the block is folded.
enum Lowering {
    /// Evaluated for effect; the value is dropped.
    Effect(NodeId),
    /// Bindings visible to every following statement of the block.
    Bind(Vec<(VarId, NodeId)>),
    Nothing,
}

pub struct GraphBuilder {
    graph: Graph,
    data: DataSection,
    functions: HashMap<String, RoutineId>,
    /// Function bodies waiting to be lowered.
    pending: Vec<(RoutineId, Block)>,
    bodies: Vec<(RoutineId, NodeId)>,
    next_label: u32,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            data: DataSection::new(),
            functions: HashMap::new(),
            pending: Vec::new(),
            bodies: Vec::new(),
            next_label: 0,
        }
    }

    pub fn lower_program(mut self, program: &super::ast::Program) -> Result<Lowered, CompileError> {
        let body = self.lower_block(&program.body)?;

        // Function bodies may declare further functions.
        while let Some((routine, block)) = self.pending.pop() {
            let body = self.lower_block(&block.body)?;
            self.bodies.push((routine, body));
        }
        for (routine, body) in std::mem::take(&mut self.bodies) {
            self.finish_routine(routine, body);
        }

        Ok(Lowered {
            graph: self.graph,
            data: self.data,
            body,
        })
    }

    /// `[entry mark, body, dispatch back to the calling site]`
    ///
    /// A routine nobody calls is never entered and gets no dispatch.
    fn finish_routine(&mut self, routine: RoutineId, body: NodeId) {
        let sites = self.graph.routine(routine).sites;
        let entry = self.graph.insert(GraphNode::Mark(JumpLabel::Entry(routine)));
        if sites == 0 {
            let root = self.graph.list(vec![entry, body]);
            self.graph.set_routine_root(routine, root);
            return;
        }
        let cases = (0..sites)
            .map(|site| {
                self.graph
                    .insert(GraphNode::Goto(JumpLabel::Return(routine, site)))
            })
            .collect();
        let site = self.graph.get_var(VarId::Return);
        let dispatch = self.graph.jump_table(site, cases);
        let root = self.graph.list(vec![entry, body, dispatch]);
        self.graph.set_routine_root(routine, root);
    }

    fn origin(&self, construct: &str, span: Span) -> SourceOrigin {
        SourceOrigin::new(construct).with_range(span.start, span.end)
    }

    fn label(&mut self, origin: SourceOrigin, node: NodeId) -> NodeId {
        let label = self.next_label;
        self.next_label += 1;
        self.graph.labelled(label, origin, node)
    }

    // ========================================
    // Statements
    // ========================================

    /// Register every function declared directly in `statements`.
    fn declare_functions(&mut self, statements: &[Statement]) -> Result<(), CompileError> {
        for statement in statements {
            let Statement::FunctionDeclaration(decl) = statement else {
                continue;
            };
            let name = function_name(decl)?;
            if BUILTINS.contains(&name) || self.functions.contains_key(name) {
                return Err(CompileError::unsupported(
                    "FunctionDeclaration",
                    format!("'{}' is already defined", name),
                ));
            }
            if !decl.params.is_empty() {
                return Err(CompileError::unsupported(
                    "FunctionDeclaration",
                    format!("'{}' declares parameters", name),
                ));
            }
            let routine = self.graph.add_routine(name);
            self.functions.insert(name.to_string(), routine);
            self.pending.push((routine, decl.body.clone()));
        }
        Ok(())
    }

    /// Lower a block to a node that leaves the unit value 0.
    fn lower_block(&mut self, statements: &[Statement]) -> Result<NodeId, CompileError> {
        self.declare_functions(statements)?;

        let mut lowered = Vec::with_capacity(statements.len());
        for statement in statements {
            lowered.push(self.lower_statement(statement)?);
        }

        let mut rest = self.graph.push(0);
        for lowering in lowered.into_iter().rev() {
            rest = match lowering {
                Lowering::Effect(node) => self.graph.list(vec![node, rest]),
                Lowering::Bind(bindings) => bindings
                    .into_iter()
                    .rev()
                    .fold(rest, |body, (id, value)| self.graph.set_var(id, value, body)),
                Lowering::Nothing => rest,
            };
        }
        Ok(rest)
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<Lowering, CompileError> {
        let origin = self.origin(statement.kind(), statement.span());
        match statement {
            Statement::ExpressionStatement(stmt) => {
                let value = self.lower_expression(&stmt.expression)?;
                let dropped = self.graph.discard(value);
                Ok(Lowering::Effect(self.label(origin, dropped)))
            }
            Statement::BlockStatement(block) => {
                let value = self.lower_block(&block.body)?;
                let dropped = self.graph.discard(value);
                Ok(Lowering::Effect(self.label(origin, dropped)))
            }
            Statement::VariableDeclaration(decl) => {
                let mut bindings = Vec::with_capacity(decl.declarations.len());
                for declarator in &decl.declarations {
                    let name = declarator.id.as_identifier().ok_or_else(|| {
                        CompileError::unsupported(
                            "VariableDeclaration",
                            format!("{} binding pattern", declarator.id.kind()),
                        )
                    })?;
                    let init = declarator.init.as_ref().ok_or_else(|| {
                        CompileError::unsupported(
                            "VariableDeclaration",
                            format!("'{}' has no initializer", name),
                        )
                    })?;
                    let value = self.lower_expression(init)?;
                    let value = self.label(origin.clone(), value);
                    bindings.push((VarId::named(name), value));
                }
                Ok(Lowering::Bind(bindings))
            }
            Statement::FunctionDeclaration(_) => Ok(Lowering::Nothing),
            Statement::Other => Err(CompileError::unsupported(
                "statement",
                "only expressions, declarations, functions and blocks are supported",
            )),
        }
    }

    // ========================================
    // Expressions
    // ========================================

    fn lower_expression(&mut self, expr: &Expression) -> Result<NodeId, CompileError> {
        match expr {
            Expression::Identifier(ident) => Ok(self.graph.get_var(VarId::named(&ident.name))),
            Expression::Literal(literal) => self.lower_literal(literal),
            Expression::BinaryExpression(binary) => self.lower_binary(binary),
            Expression::UnaryExpression(unary) => {
                let argument = self.lower_expression(&unary.argument)?;
                match unary.operator.as_str() {
                    "+" => Ok(argument),
                    "-" => {
                        let value = allocator::payload(&mut self.graph, argument)?;
                        let minus_one = self.graph.push(-1);
                        let negated = self.graph.mult(minus_one, value);
                        allocator::box_number(&mut self.graph, negated)
                    }
                    other => Err(CompileError::unsupported(
                        "UnaryExpression",
                        format!("operator '{}'", other),
                    )),
                }
            }
            Expression::ConditionalExpression(conditional) => {
                let test = self.lower_expression(&conditional.test)?;
                let condition = allocator::payload(&mut self.graph, test)?;
                let on_true = self.lower_expression(&conditional.consequent)?;
                let on_false = self.lower_expression(&conditional.alternate)?;
                Ok(self.graph.branch(condition, on_true, on_false))
            }
            Expression::CallExpression(call) => self.lower_call(call),
            Expression::Other => Err(CompileError::unsupported(
                "expression",
                "not part of the supported subset",
            )),
        }
    }

    fn lower_literal(&mut self, literal: &Literal) -> Result<NodeId, CompileError> {
        let block = match &literal.value {
            LiteralValue::Number(value) => {
                let integer = *value as i32;
                if integer as f64 != *value {
                    return Err(CompileError::unsupported(
                        "Literal",
                        format!("{} is not a 32-bit integer", value),
                    ));
                }
                self.data.number(integer)
            }
            LiteralValue::String(text) => self.data.string(text.as_bytes()),
            LiteralValue::Bool(value) => {
                return Err(CompileError::unsupported(
                    "Literal",
                    format!("boolean {}", value),
                ));
            }
            LiteralValue::Null => return Err(CompileError::unsupported("Literal", "null")),
        };
        Ok(self.graph.data_literal(block))
    }

    fn lower_binary(&mut self, binary: &BinaryExpression) -> Result<NodeId, CompileError> {
        let left = self.lower_expression(&binary.left)?;
        let right = self.lower_expression(&binary.right)?;
        let left = allocator::payload(&mut self.graph, left)?;
        let right = allocator::payload(&mut self.graph, right)?;
        let raw = match binary.operator.as_str() {
            "+" => self.graph.add(left, right),
            "-" => {
                let minus_one = self.graph.push(-1);
                let negated = self.graph.mult(minus_one, right);
                self.graph.add(left, negated)
            }
            "*" => self.graph.mult(left, right),
            other => {
                return Err(CompileError::unsupported(
                    "BinaryExpression",
                    format!("operator '{}'", other),
                ));
            }
        };
        allocator::box_number(&mut self.graph, raw)
    }

    fn lower_call(&mut self, call: &CallExpression) -> Result<NodeId, CompileError> {
        let name = call.callee.as_identifier().ok_or_else(|| {
            CompileError::unsupported(
                "CallExpression",
                format!("{} callee", call.callee.kind()),
            )
        })?;

        match name {
            "malloc" => {
                let [count] = self.arguments::<1>(name, &call.arguments)?;
                allocator::malloc(&mut self.graph, count)
            }
            "write" => {
                let [file, bytes] = self.arguments::<2>(name, &call.arguments)?;
                self.lower_write(file, bytes)
            }
            "read" => {
                let [file, count] = self.arguments::<2>(name, &call.arguments)?;
                self.lower_read(file, count)
            }
            "beep" => {
                let [] = self.arguments::<0>(name, &call.arguments)?;
                self.lower_beep()
            }
            "resize" => {
                let [words] = self.arguments::<1>(name, &call.arguments)?;
                self.lower_resize(words)
            }
            _ => {
                let routine = *self.functions.get(name).ok_or_else(|| {
                    CompileError::UndefinedFunction {
                        name: name.to_string(),
                    }
                })?;
                if !call.arguments.is_empty() {
                    return Err(CompileError::unsupported(
                        "CallExpression",
                        format!("'{}' takes no arguments", name),
                    ));
                }
                Ok(self.graph.call(routine))
            }
        }
    }

    fn arguments<const N: usize>(
        &mut self,
        name: &str,
        arguments: &[Expression],
    ) -> Result<[NodeId; N], CompileError> {
        if arguments.len() != N {
            return Err(CompileError::unsupported(
                "CallExpression",
                format!("{}() takes {} argument(s), got {}", name, N, arguments.len()),
            ));
        }
        let mut nodes = [NodeId(0); N];
        for (slot, argument) in nodes.iter_mut().zip(arguments) {
            *slot = self.lower_expression(argument)?;
        }
        Ok(nodes)
    }

    // ========================================
    // System calls
    // ========================================

    fn write_field(
        &mut self,
        record: &VarId,
        layout: &RuntimeStruct,
        field: &str,
        value: NodeId,
    ) -> Result<NodeId, CompileError> {
        let address = self.graph.var_field(record.clone(), layout, field)?;
        Ok(self.graph.write(address, value))
    }

    /// Absolute address of the byte block behind the string Value in `var`.
    fn string_block(&mut self, var: &VarId) -> Result<NodeId, CompileError> {
        let value = self.graph.get_var(var.clone());
        let offset = allocator::payload(&mut self.graph, value)?;
        let runtime = self.graph.get_var(VarId::Runtime);
        Ok(self.graph.add(runtime, offset))
    }

    /// Publish the record in `record` and trap.
    fn trap(&mut self, record: &VarId) -> Result<Vec<NodeId>, CompileError> {
        let system_state = self.graph.push(SYSTEM_STATE_ADDRESS as i32);
        let argument = self
            .graph
            .field(system_state, &SYSTEM_STATE, "systemCallArgumentAddress")?;
        let address = self.graph.get_var(record.clone());
        let publish = self.graph.write(argument, address);
        let supervisor = self.graph.op(Op::Supervisor, Vec::new());
        Ok(vec![publish, supervisor])
    }

    /// `write(file, bytes)`: writefile record, trap, evaluate to 0.
    fn lower_write(&mut self, file: NodeId, bytes: NodeId) -> Result<NodeId, CompileError> {
        let file_var = VarId::Scratch("file");
        let bytes_var = VarId::Scratch("bytes");
        let record = VarId::Scratch("call");

        let mut steps = Vec::new();
        let tag = self.graph.push(kind::WRITE_FILE);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "type", tag)?);
        let name = self.string_block(&file_var)?;
        steps.push(self.write_field(&record, &FILE_SYSCALL, "nameAddress", name)?);
        let block = self.string_block(&bytes_var)?;
        let one = self.graph.push(1);
        let first_byte = self.graph.add(block, one);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "bytesAddress", first_byte)?);
        let block = self.string_block(&bytes_var)?;
        let length = self.graph.read(block);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "bytesLength", length)?);
        let no_callback = self.graph.push(0);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "callbackAddress", no_callback)?);
        steps.extend(self.trap(&record)?);
        steps.push(self.graph.push(0));

        let body = self.graph.list(steps);
        let allocation = allocator::allocate_words(&mut self.graph, FILE_SYSCALL.len() as i32)?;
        let body = self.graph.set_var(record, allocation, body);
        let body = self.graph.set_var(bytes_var, bytes, body);
        Ok(self.graph.set_var(file_var, file, body))
    }

    /// `read(file, count)`: read at most `count` bytes into a fresh string.
    fn lower_read(&mut self, file: NodeId, count: NodeId) -> Result<NodeId, CompileError> {
        let file_var = VarId::Scratch("file");
        let count_var = VarId::Scratch("count");
        let buffer = VarId::Scratch("buffer");
        let record = VarId::Scratch("call");

        let mut steps = Vec::new();
        let tag = self.graph.push(kind::READ_FILE);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "type", tag)?);
        let name = self.string_block(&file_var)?;
        steps.push(self.write_field(&record, &FILE_SYSCALL, "nameAddress", name)?);
        let start = self.graph.get_var(buffer.clone());
        let one = self.graph.push(1);
        let first_byte = self.graph.add(start, one);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "bytesAddress", first_byte)?);
        let requested = self.graph.get_var(count_var.clone());
        let capacity = allocator::payload(&mut self.graph, requested)?;
        steps.push(self.write_field(&record, &FILE_SYSCALL, "bytesLength", capacity)?);
        let no_callback = self.graph.push(0);
        steps.push(self.write_field(&record, &FILE_SYSCALL, "callbackAddress", no_callback)?);
        steps.extend(self.trap(&record)?);

        // The handler stores the byte count back into the record.
        let received = self.graph.var_field(record.clone(), &FILE_SYSCALL, "bytesLength")?;
        let received = self.graph.read(received);
        let prefix = self.graph.get_var(buffer.clone());
        steps.push(self.graph.write(prefix, received));
        let block = self.graph.get_var(buffer.clone());
        steps.push(allocator::box_string(&mut self.graph, block)?);

        let body = self.graph.list(steps);
        let allocation = allocator::allocate_words(&mut self.graph, FILE_SYSCALL.len() as i32)?;
        let body = self.graph.set_var(record, allocation, body);

        let requested = self.graph.get_var(count_var.clone());
        let words = allocator::payload(&mut self.graph, requested)?;
        let one = self.graph.push(1);
        let words = self.graph.add(words, one);
        let allocation = allocator::allocate(&mut self.graph, words)?;
        let body = self.graph.set_var(buffer, allocation, body);

        let body = self.graph.set_var(count_var, count, body);
        Ok(self.graph.set_var(file_var, file, body))
    }

    fn lower_beep(&mut self) -> Result<NodeId, CompileError> {
        let record = VarId::Scratch("call");
        let tag = self.graph.push(kind::BEEP);
        let mut steps = vec![self.write_field(&record, &BEEP_SYSCALL, "type", tag)?];
        steps.extend(self.trap(&record)?);
        steps.push(self.graph.push(0));

        let body = self.graph.list(steps);
        let allocation = allocator::allocate_words(&mut self.graph, BEEP_SYSCALL.len() as i32)?;
        Ok(self.graph.set_var(record, allocation, body))
    }

    fn lower_resize(&mut self, words: NodeId) -> Result<NodeId, CompileError> {
        let words_var = VarId::Scratch("words");
        let record = VarId::Scratch("call");

        let tag = self.graph.push(kind::RESIZE);
        let mut steps = vec![self.write_field(&record, &RESIZE_SYSCALL, "type", tag)?];
        let value = self.graph.get_var(words_var.clone());
        let amount = allocator::payload(&mut self.graph, value)?;
        steps.push(self.write_field(&record, &RESIZE_SYSCALL, "bytes", amount)?);
        steps.extend(self.trap(&record)?);
        steps.push(self.graph.push(0));

        let body = self.graph.list(steps);
        let allocation = allocator::allocate_words(&mut self.graph, RESIZE_SYSCALL.len() as i32)?;
        let body = self.graph.set_var(record, allocation, body);
        Ok(self.graph.set_var(words_var, words, body))
    }
}

fn function_name(decl: &FunctionDeclaration) -> Result<&str, CompileError> {
    decl.id
        .as_ref()
        .and_then(Expression::as_identifier)
        .ok_or_else(|| CompileError::unsupported("FunctionDeclaration", "anonymous function"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::from_json;

    fn lower(json: &str) -> Result<Lowered, CompileError> {
        GraphBuilder::new().lower_program(&from_json(json).unwrap())
    }

    fn call(name: &str, arguments: &str) -> String {
        format!(
            r#"{{ "type": "ExpressionStatement", "expression": {{
                "type": "CallExpression",
                "callee": {{ "type": "Identifier", "name": "{}" }},
                "arguments": [{}] }} }}"#,
            name, arguments
        )
    }

    #[test]
    fn test_literals_are_interned() {
        let lowered = lower(&format!(
            r#"{{ "body": [{}, {}] }}"#,
            call("malloc", r#"{ "type": "Literal", "value": 8 }"#),
            call("malloc", r#"{ "type": "Literal", "value": 8 }"#),
        ))
        .unwrap();
        assert_eq!(lowered.data.blocks().len(), 1);
    }

    #[test]
    fn test_fractional_number_is_rejected() {
        let err = lower(&format!(
            r#"{{ "body": [{}] }}"#,
            call("malloc", r#"{ "type": "Literal", "value": 1.5 }"#)
        ))
        .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedSyntax { .. }));
    }

    #[test]
    fn test_unknown_function() {
        let err = lower(&format!(r#"{{ "body": [{}] }}"#, call("nope", ""))).unwrap_err();
        assert_eq!(
            err,
            CompileError::UndefinedFunction {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_builtin_arity() {
        let err = lower(&format!(r#"{{ "body": [{}] }}"#, call("write", ""))).unwrap_err();
        assert!(err.to_string().contains("write() takes 2 argument(s), got 0"));
    }

    #[test]
    fn test_function_routine_gets_dispatch() {
        let lowered = lower(&format!(
            r#"{{ "body": [
                {{ "type": "FunctionDeclaration",
                   "id": {{ "type": "Identifier", "name": "test" }},
                   "params": [],
                   "body": {{ "type": "BlockStatement", "body": [] }} }},
                {}, {}
            ] }}"#,
            call("test", ""),
            call("test", "")
        ))
        .unwrap();

        let routines = lowered.graph.routines();
        assert_eq!(routines.len(), 1);
        assert_eq!(routines[0].sites, 2);
        let root = routines[0].root.unwrap();
        let GraphNode::List(parts) = lowered.graph.node(root) else {
            panic!("routine root should be a list");
        };
        assert_eq!(
            lowered.graph.node(parts[0]),
            &GraphNode::Mark(JumpLabel::Entry(RoutineId(0)))
        );
        let GraphNode::JumpTable { cases, .. } = lowered.graph.node(parts[2]) else {
            panic!("routine should end in a jump table");
        };
        assert_eq!(cases.len(), 2);
    }

    #[test]
    fn test_function_parameters_are_rejected() {
        let err = lower(
            r#"{ "body": [
                { "type": "FunctionDeclaration",
                  "id": { "type": "Identifier", "name": "f" },
                  "params": [{ "type": "Identifier", "name": "x" }],
                  "body": { "type": "BlockStatement", "body": [] } }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedSyntax { .. }));
    }

    #[test]
    fn test_declaration_without_initializer() {
        let err = lower(
            r#"{ "body": [
                { "type": "VariableDeclaration", "kind": "let",
                  "declarations": [{ "type": "VariableDeclarator",
                                     "id": { "type": "Identifier", "name": "x" },
                                     "init": null }] }
            ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("'x' has no initializer"));
    }
}
