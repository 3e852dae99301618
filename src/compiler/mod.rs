pub mod allocator;
pub mod ast;
pub mod builder;
pub mod codegen;
pub mod data;
pub mod dump;
mod error;
pub mod graph;
pub mod link;
pub mod runtime;
pub mod sourcemap;

pub use builder::GraphBuilder;
pub use codegen::{Assembly, Codegen};
pub use error::CompileError;
pub use graph::{Graph, GraphNode, NodeId, VarId};
pub use link::ImageLayout;
pub use sourcemap::SourceMap;

use crate::RuntimeConfig;
use crate::vm::{Executable, HostHandler, Machine, Op, SupervisorHandler};
use data::DataSection;
use std::path::Path;

/// Everything produced by one compilation.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub graph: Graph,
    /// Whole-program root, including bootstrap and `exit`.
    pub root: NodeId,
    pub data: DataSection,
    pub ops: Vec<Op>,
    pub source_map: SourceMap,
    pub layout: ImageLayout,
    pub executable: Executable,
}

/// Compile a syntax tree.
pub fn compile(program: &ast::Program) -> Result<Compilation, CompileError> {
    compile_with_config(program, &RuntimeConfig::default())
}

pub fn compile_with_config(
    program: &ast::Program,
    config: &RuntimeConfig,
) -> Result<Compilation, CompileError> {
    let lowered = GraphBuilder::new().lower_program(program)?;
    compile_graph_with_config(lowered.graph, lowered.data, lowered.body, config)
}

/// Compile a hand-built graph. `body` runs with the runtime variables bound
/// and its value is dropped before `exit`.
pub fn compile_graph(
    graph: Graph,
    data: DataSection,
    body: NodeId,
) -> Result<Compilation, CompileError> {
    compile_graph_with_config(graph, data, body, &RuntimeConfig::default())
}

fn compile_graph_with_config(
    mut graph: Graph,
    data: DataSection,
    body: NodeId,
    config: &RuntimeConfig,
) -> Result<Compilation, CompileError> {
    let root = runtime::program(&mut graph, body)?;
    let assembly = Codegen::new(&graph)
        .with_trace(config.trace_codegen)
        .compile(root)?;
    let (executable, layout) = link::link(&data, &assembly);

    Ok(Compilation {
        graph,
        root,
        data,
        ops: assembly.ops,
        source_map: assembly.source_map,
        layout,
        executable,
    })
}

/// Load an executable and run it to completion.
pub fn execute(
    executable: &Executable,
    config: &RuntimeConfig,
    handler: &mut dyn SupervisorHandler,
) -> Result<Machine, String> {
    let mut machine = Machine::load(executable, config)?;
    machine.run(handler)?;
    Ok(machine)
}

/// The host handler described by `config`, writing to stdout.
pub fn host_handler(config: &RuntimeConfig) -> HostHandler {
    HostHandler::new()
        .with_base_dir(config.base_dir())
        .with_trace(config.trace_syscalls)
        .with_memory_limit(config.max_memory_words)
}

/// Run a compilation with the default host handler.
pub fn run_compilation(
    compilation: &Compilation,
    config: &RuntimeConfig,
) -> Result<Machine, String> {
    execute(&compilation.executable, config, &mut host_handler(config))
}

/// Compile and run a syntax tree given as ESTree JSON.
pub fn run(source: &str, config: &RuntimeConfig) -> Result<Machine, String> {
    let program = ast::from_json(source)?;
    let compilation = compile_with_config(&program, config).map_err(|e| e.to_string())?;
    run_compilation(&compilation, config)
}

/// Compile and run an ESTree JSON file.
pub fn run_file(path: &Path, config: &RuntimeConfig) -> Result<Machine, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    run(&source, config)
}

/// Report a halted machine's fault, if any, as an error.
pub fn check_outcome(machine: &Machine) -> Result<(), String> {
    match machine.fault() {
        Some(fault) => Err(format!(
            "runtime fault at {}: {}",
            machine.pointer(),
            fault
        )),
        None => Ok(()),
    }
}
