//! Runtime bootstrap.
//!
//! The loader leaves the absolute Runtime Header address as the only stack
//! value. The bootstrap reads the header offsets once into the `Lookup`,
//! `Data` and `Program` stack variables that every later address computation
//! builds on.

use super::error::CompileError;
use super::graph::{Graph, NodeId, VarId};
use crate::vm::Op;
use crate::vm::layout::RUNTIME_HEADER;

/// Stack depth at program entry: the Runtime Header address.
pub const ENTRY_DEPTH: usize = 1;

/// Variables visible at program entry.
pub fn entry_bindings() -> Vec<(VarId, usize)> {
    vec![(VarId::Runtime, 1)]
}

/// Variables of a routine frame, pushed by every call site in this order.
pub const FRAME: [VarId; 5] = [
    VarId::Runtime,
    VarId::Lookup,
    VarId::Data,
    VarId::Program,
    VarId::Return,
];

/// Absolute address stored as a header-relative offset in `field`.
fn header_section(graph: &mut Graph, field: &str) -> Result<NodeId, CompileError> {
    let address = graph.var_field(VarId::Runtime, &RUNTIME_HEADER, field)?;
    let offset = graph.read(address);
    let runtime = graph.get_var(VarId::Runtime);
    Ok(graph.add(offset, runtime))
}

/// Bind `Lookup`, `Data` and `Program` around `body`.
pub fn bootstrap(graph: &mut Graph, body: NodeId) -> Result<NodeId, CompileError> {
    let program = header_section(graph, "programOffset")?;
    let body = graph.set_var(VarId::Program, program, body);
    let data = header_section(graph, "dataOffset")?;
    let body = graph.set_var(VarId::Data, data, body);
    let lookup = header_section(graph, "lookupOffset")?;
    Ok(graph.set_var(VarId::Lookup, lookup, body))
}

/// Whole-program root: bootstrap, run `body`, drop its value and exit with
/// only the Runtime Header address left on the stack.
pub fn program(graph: &mut Graph, body: NodeId) -> Result<NodeId, CompileError> {
    let main = bootstrap(graph, body)?;
    let dropped = graph.discard(main);
    let exit = graph.op(Op::Exit, Vec::new());
    Ok(graph.list(vec![dropped, exit]))
}
