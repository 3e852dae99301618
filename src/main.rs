use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stax::compiler::{self, ImageLayout, ast, dump};
use stax::{Compilation, Executable, Machine, RuntimeConfig};

#[derive(Parser)]
#[command(name = "stax")]
#[command(about = "A stack-machine code generator and virtual machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a syntax tree (ESTree JSON)
    Run {
        /// The syntax tree to run
        file: PathBuf,

        #[command(flatten)]
        runtime: RuntimeArgs,

        #[command(flatten)]
        dump: DumpArgs,
    },
    /// Compile a syntax tree into an executable image
    Build {
        /// The syntax tree to compile
        file: PathBuf,

        /// Where to write the image (JSON)
        #[arg(short, long)]
        output: PathBuf,

        /// Load configuration from a TOML file
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        dump: DumpArgs,
    },
    /// Run a previously built executable image
    Exec {
        /// The image to run
        image: PathBuf,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Print the linked bytecode of a syntax tree or an executable image
    Disasm {
        /// A syntax tree (ESTree JSON) or an image written by `build`
        file: PathBuf,
    },
}

#[derive(clap::Args, Clone)]
struct RuntimeArgs {
    /// Load configuration from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every system call to stderr
    #[arg(long)]
    trace_syscalls: bool,

    /// Write the execution trace (JSON) to a file
    #[arg(long, value_name = "FILE")]
    dump_trace: Option<PathBuf>,

    /// Execution timeout in seconds (0 = no timeout)
    #[arg(long, default_value = "0")]
    timeout: u64,
}

#[derive(clap::Args, Clone, Default)]
struct DumpArgs {
    /// Dump the graph IR to stderr, or to a file with --dump-graph=path
    #[arg(long, value_name = "FILE", num_args = 0..=1, require_equals = true)]
    dump_graph: Option<Option<PathBuf>>,

    /// Dump the linked bytecode to stderr, or to a file with --dump-bytecode=path
    #[arg(long, value_name = "FILE", num_args = 0..=1, require_equals = true)]
    dump_bytecode: Option<Option<PathBuf>>,

    /// Write the source map (JSON) to a file
    #[arg(long, value_name = "FILE")]
    dump_source_map: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            runtime,
            dump,
        } => load_config(&runtime).and_then(|config| {
            with_timeout(runtime.timeout, move || {
                run_file(&file, &config, &dump, runtime.dump_trace.as_deref())
            })
        }),
        Commands::Build {
            file,
            output,
            config,
            dump,
        } => config
            .as_deref()
            .map(RuntimeConfig::load)
            .unwrap_or_else(|| Ok(RuntimeConfig::default()))
            .and_then(|config| build_file(&file, &output, &config, &dump)),
        Commands::Exec { image, runtime } => load_config(&runtime).and_then(|config| {
            with_timeout(runtime.timeout, move || {
                exec_image(&image, &config, runtime.dump_trace.as_deref())
            })
        }),
        Commands::Disasm { file } => disasm_file(&file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Config file first, then command-line flags on top.
fn load_config(args: &RuntimeArgs) -> Result<RuntimeConfig, String> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    config.trace_syscalls |= args.trace_syscalls;
    if args.dump_trace.is_some() {
        config.trace = true;
    }
    Ok(config)
}

/// Run `task` on a worker thread and give up on it after `timeout` seconds.
fn with_timeout<F>(timeout: u64, task: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), String> + Send + 'static,
{
    if timeout == 0 {
        return task();
    }

    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let result = task();
        let _ = tx.send(());
        result
    });

    match rx.recv_timeout(Duration::from_secs(timeout)) {
        Ok(()) => handle
            .join()
            .unwrap_or_else(|_| Err("thread panicked".to_string())),
        Err(_) => Err(format!(
            "error: execution timed out after {} seconds",
            timeout
        )),
    }
}

fn compile_file(
    path: &Path,
    config: &RuntimeConfig,
    dump: &DumpArgs,
) -> Result<Compilation, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let program = ast::from_json(&source)?;
    let compilation =
        compiler::compile_with_config(&program, config).map_err(|e| format!("error: {}", e))?;

    if let Some(target) = &dump.dump_graph {
        emit_dump(
            target.as_deref(),
            &dump::format_graph(&compilation.graph, compilation.root),
        )?;
    }
    if let Some(target) = &dump.dump_bytecode {
        let listing = dump::format_bytecode(&compilation).map_err(|e| e.to_string())?;
        emit_dump(target.as_deref(), &listing)?;
    }
    if let Some(path) = &dump.dump_source_map {
        write_output(path, &compilation.source_map.to_json()?)?;
    }
    Ok(compilation)
}

fn run_file(
    path: &Path,
    config: &RuntimeConfig,
    dump: &DumpArgs,
    trace_path: Option<&Path>,
) -> Result<(), String> {
    let compilation = compile_file(path, config, dump)?;
    let machine = compiler::run_compilation(&compilation, config)?;
    finish(&machine, trace_path)
}

fn build_file(
    path: &Path,
    output: &Path,
    config: &RuntimeConfig,
    dump: &DumpArgs,
) -> Result<(), String> {
    let compilation = compile_file(path, config, dump)?;
    write_output(output, &compilation.executable.to_json()?)
}

fn read_image(path: &Path) -> Result<Executable, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    Executable::from_json(&text)
}

fn exec_image(path: &Path, config: &RuntimeConfig, trace_path: Option<&Path>) -> Result<(), String> {
    let executable = read_image(path)?;
    let machine = compiler::execute(&executable, config, &mut compiler::host_handler(config))?;
    finish(&machine, trace_path)
}

fn finish(machine: &Machine, trace_path: Option<&Path>) -> Result<(), String> {
    if let (Some(path), Some(trace)) = (trace_path, machine.trace()) {
        write_output(path, &trace.to_json()?)?;
    }
    compiler::check_outcome(machine)
}

fn disasm_file(path: &Path) -> Result<(), String> {
    // An image carries a "memory" array; anything else is a syntax tree.
    let listing = match read_image(path) {
        Ok(executable) => {
            let layout = ImageLayout::of(&executable)?;
            let mut disassembler = dump::Disassembler::new(&executable.memory, layout);
            disassembler
                .disassemble()
                .map(str::to_string)
                .map_err(|e| e.to_string())?
        }
        Err(_) => {
            let compilation = compile_file(path, &RuntimeConfig::default(), &DumpArgs::default())?;
            let mut listing = dump::format_bytecode(&compilation).map_err(|e| e.to_string())?;
            if !compilation.data.blocks().is_empty() {
                listing.push_str("== Data Blocks ==\n");
                listing.push_str(&dump::format_data(compilation.data.blocks()));
            }
            listing
        }
    };
    print!("{}", listing);
    Ok(())
}

/// Print to stderr when no path is given.
fn emit_dump(target: Option<&Path>, text: &str) -> Result<(), String> {
    match target {
        Some(path) => write_output(path, text),
        None => {
            eprint!("{}", text);
            Ok(())
        }
    }
}

fn write_output(path: &Path, text: &str) -> Result<(), String> {
    std::fs::write(path, text).map_err(|e| format!("failed to write {}: {}", path.display(), e))
}
