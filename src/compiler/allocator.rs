//! Allocation and boxing as graph fragments.
//!
//! Generated code bumps the Runtime Header's `allocationOffset` directly;
//! the machine faults if the new offset runs past the end of memory.

use super::error::CompileError;
use super::graph::{Graph, NodeId, VarId};
use crate::vm::layout::{RUNTIME_HEADER, VALUE, ValueTag};

/// Reserve `words` words; leaves the absolute address of the block.
///
/// `words` is evaluated before `allocationOffset` is read, so a size
/// expression that allocates itself is bumped past first.
pub fn allocate(graph: &mut Graph, words: NodeId) -> Result<NodeId, CompileError> {
    let size = VarId::Scratch("size");
    let block = VarId::Scratch("alloc");

    let current = graph.var_field(VarId::Runtime, &RUNTIME_HEADER, "allocationOffset")?;
    let current = graph.read(current);

    let field = graph.var_field(VarId::Runtime, &RUNTIME_HEADER, "allocationOffset")?;
    let requested = graph.get_var(size.clone());
    let offset = graph.get_var(block.clone());
    let next = graph.add(requested, offset);
    let bump = graph.write(field, next);

    let runtime = graph.get_var(VarId::Runtime);
    let offset = graph.get_var(block.clone());
    let address = graph.add(runtime, offset);

    let body = graph.list(vec![bump, address]);
    let body = graph.set_var(block, current, body);
    Ok(graph.set_var(size, words, body))
}

/// Reserve a fixed number of words.
pub fn allocate_words(graph: &mut Graph, words: i32) -> Result<NodeId, CompileError> {
    let words = graph.push(words);
    allocate(graph, words)
}

/// Payload word of the Value at `value`.
pub fn payload(graph: &mut Graph, value: NodeId) -> Result<NodeId, CompileError> {
    let address = graph.field(value, &VALUE, "payload")?;
    Ok(graph.read(address))
}

/// Allocate a Value with `tag` and the raw word `payload`; leaves its address.
pub fn box_value(graph: &mut Graph, tag: ValueTag, payload: NodeId) -> Result<NodeId, CompileError> {
    let boxed = VarId::Scratch("box");
    let block = allocate_words(graph, VALUE.len() as i32)?;

    let type_field = graph.var_field(boxed.clone(), &VALUE, "type")?;
    let tag = graph.push(tag as i32);
    let write_type = graph.write(type_field, tag);

    let payload_field = graph.var_field(boxed.clone(), &VALUE, "payload")?;
    let write_payload = graph.write(payload_field, payload);

    let result = graph.get_var(boxed.clone());
    let body = graph.list(vec![write_type, write_payload, result]);
    Ok(graph.set_var(boxed, block, body))
}

/// Box a raw integer as a number Value.
pub fn box_number(graph: &mut Graph, value: NodeId) -> Result<NodeId, CompileError> {
    box_value(graph, ValueTag::Number, value)
}

/// Box an absolute address of a length-prefixed block as a string Value.
pub fn box_string(graph: &mut Graph, block: NodeId) -> Result<NodeId, CompileError> {
    let runtime = graph.get_var(VarId::Runtime);
    let minus_one = graph.push(-1);
    let negated = graph.mult(minus_one, runtime);
    let relative = graph.add(block, negated);
    box_value(graph, ValueTag::String, relative)
}

/// `malloc(n)`: allocate `n` words and box their address as a number.
pub fn malloc(graph: &mut Graph, count: NodeId) -> Result<NodeId, CompileError> {
    let block = VarId::Scratch("block");
    let words = payload(graph, count)?;
    let address = allocate(graph, words)?;
    let result = graph.get_var(block.clone());
    let boxed = box_number(graph, result)?;
    Ok(graph.set_var(block, address, boxed))
}
