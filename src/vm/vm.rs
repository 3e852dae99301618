use super::allocator::BumpAllocator;
use super::bytecode::{self, EncodingError};
use super::debug::Trace;
use super::layout::{SYSTEM_STATE, SYSTEM_STATE_ADDRESS};
use super::memory::Memory;
use super::ops::Op;
use super::syscall::SupervisorHandler;
use super::Executable;
use crate::config::RuntimeConfig;

/// Privilege mode of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Mode {
    User,
    /// Set while a supervisor handler owns the machine.
    Kernel,
    /// Set once a fault has halted the machine.
    Error,
}

/// A fatal machine fault. Faults halt the machine and are kept as state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeFault {
    StackUnderflow,
    StackOverflow { limit: usize },
    OutOfBoundsAccess { address: i64 },
    /// A write moved `allocationOffset` past the end of memory.
    AllocatorExhausted { requested_end: i64, capacity: usize },
    UnknownOpcode(EncodingError),
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeFault::StackUnderflow => write!(f, "stack underflow"),
            RuntimeFault::StackOverflow { limit } => {
                write!(f, "stack overflow (limit {} values)", limit)
            }
            RuntimeFault::OutOfBoundsAccess { address } => {
                write!(f, "out of bounds memory access at {}", address)
            }
            RuntimeFault::AllocatorExhausted {
                requested_end,
                capacity,
            } => write!(
                f,
                "allocator exhausted: block would end at {} but memory holds {} words",
                requested_end, capacity
            ),
            RuntimeFault::UnknownOpcode(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RuntimeFault {}

/// How a call to [`Machine::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The program executed `exit`.
    Exited,
    /// The program faulted at `pointer`.
    Faulted { fault: RuntimeFault, pointer: usize },
}

/// Result of a single [`Machine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Continue,
    /// `supervisor` executed; the machine is in kernel mode.
    Trap,
    Halted,
}

enum ControlFlow {
    Next,
    Jumped,
    Exit,
    Trap,
}

/// The stax stack machine.
#[derive(Debug, Clone)]
pub struct Machine {
    stack: Vec<i32>,
    stack_limit: usize,
    memory: Memory,
    pointer: usize,
    mode: Mode,
    halted: bool,
    fault: Option<RuntimeFault>,
    /// Allocator whose header offset field is watched on every `write`.
    allocator: Option<BumpAllocator>,
    trace: Option<Trace>,
    trace_vm: bool,
    steps: u64,
    traps: usize,
}

impl Machine {
    /// Create a machine over raw memory, starting at `pointer` with an empty
    /// stack.
    pub fn new(memory: Memory, pointer: usize) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            stack_limit: RuntimeConfig::default().stack_limit,
            memory,
            pointer,
            mode: Mode::User,
            halted: false,
            fault: None,
            allocator: None,
            trace: None,
            trace_vm: false,
            steps: 0,
            traps: 0,
        }
    }

    /// Load an executable image.
    ///
    /// Memory becomes `[System-State][image][heap_words free words]` and the
    /// absolute Runtime Header address is the only initial stack value.
    pub fn load(executable: &Executable, config: &RuntimeConfig) -> Result<Self, String> {
        let entry = executable
            .entry
            .ok_or_else(|| "executable has no entry point".to_string())?;
        if entry >= executable.memory.len() || executable.header >= executable.memory.len() {
            return Err(format!(
                "executable image of {} words has entry {} and header {}",
                executable.memory.len(),
                entry,
                executable.header
            ));
        }

        let base = SYSTEM_STATE.len();
        let free_start = base + executable.memory.len();
        let mut words = Vec::with_capacity(free_start + config.heap_words);
        words.resize(base, 0);
        words.extend_from_slice(&executable.memory);
        words.resize(free_start + config.heap_words, 0);

        let size = words.len() as i32;
        let mut memory = Memory::new(words);
        memory
            .write_struct(
                SYSTEM_STATE_ADDRESS,
                &SYSTEM_STATE,
                &[("memorySize", size), ("randomAddress", free_start as i32)],
            )
            .map_err(|e| e.to_string())?;

        let header = base + executable.header;
        let mut machine = Machine::new(memory, base + entry)
            .with_stack_limit(config.stack_limit)
            .watch_allocator(header);
        if config.trace {
            machine = machine.with_trace(config.trace_limit);
        }
        machine.trace_vm = config.trace_vm;
        machine.stack.push(header as i32);

        if machine.trace_vm {
            eprintln!(
                "[VM] loaded {} words, entry {}, runtime header {}",
                machine.memory.len(),
                machine.pointer,
                header
            );
        }
        Ok(machine)
    }

    /// Replace the initial stack.
    pub fn with_stack(mut self, stack: Vec<i32>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    /// Fault when a `write` moves this header's `allocationOffset` past the
    /// end of memory.
    pub fn watch_allocator(mut self, header: usize) -> Self {
        self.allocator = Some(BumpAllocator::new(header));
        self
    }

    /// Record an execution trace of at most `limit` steps.
    pub fn with_trace(mut self, limit: usize) -> Self {
        self.trace = Some(Trace::new(limit));
        self
    }

    pub fn stack(&self) -> &[i32] {
        &self.stack
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn fault(&self) -> Option<&RuntimeFault> {
        self.fault.as_ref()
    }

    pub fn allocator(&self) -> Option<BumpAllocator> {
        self.allocator
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// Number of instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Number of `supervisor` traps taken so far.
    pub fn traps(&self) -> usize {
        self.traps
    }

    /// Run until `exit` or a fault, handing every trap to `handler`.
    ///
    /// Execution resumes after the trap once the handler returns. `Err` is
    /// only produced when the handler itself fails.
    pub fn run(&mut self, handler: &mut dyn SupervisorHandler) -> Result<Outcome, String> {
        while !self.halted {
            if self.step() == Event::Trap {
                handler.handle(self)?;
                self.mode = Mode::User;
            }
        }
        Ok(self.outcome())
    }

    /// The final state of a halted machine.
    pub fn outcome(&self) -> Outcome {
        match &self.fault {
            Some(fault) => Outcome::Faulted {
                fault: fault.clone(),
                pointer: self.pointer,
            },
            None => Outcome::Exited,
        }
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> Event {
        if self.halted {
            return Event::Halted;
        }

        if self.pointer >= self.memory.len() {
            self.fail(RuntimeFault::OutOfBoundsAccess {
                address: self.pointer as i64,
            });
            return Event::Halted;
        }
        let op = match bytecode::decode(self.pointer, self.memory.words()) {
            Ok(op) => op,
            Err(err) => {
                self.fail(RuntimeFault::UnknownOpcode(err));
                return Event::Halted;
            }
        };

        if let Some(trace) = &mut self.trace {
            trace.record(self.steps, self.pointer, op, &self.stack, self.mode);
        }
        self.steps += 1;

        match self.execute_op(op) {
            Ok(ControlFlow::Next) => {
                self.pointer += op.width();
                Event::Continue
            }
            Ok(ControlFlow::Jumped) => Event::Continue,
            Ok(ControlFlow::Exit) => {
                self.halted = true;
                if self.trace_vm {
                    let free = self
                        .allocator
                        .and_then(|allocator| allocator.next_address(&self.memory));
                    eprintln!(
                        "[VM] exit at {} after {} steps, stack {:?}, next free {:?}",
                        self.pointer, self.steps, self.stack, free
                    );
                }
                Event::Halted
            }
            Ok(ControlFlow::Trap) => {
                self.pointer += op.width();
                self.mode = Mode::Kernel;
                self.traps += 1;
                Event::Trap
            }
            Err(fault) => {
                self.fail(fault);
                Event::Halted
            }
        }
    }

    fn fail(&mut self, fault: RuntimeFault) {
        if self.trace_vm {
            eprintln!("[VM] fault at {}: {}", self.pointer, fault);
        }
        self.mode = Mode::Error;
        self.halted = true;
        self.fault = Some(fault);
    }

    fn pop(&mut self) -> Result<i32, RuntimeFault> {
        self.stack.pop().ok_or(RuntimeFault::StackUnderflow)
    }

    fn push(&mut self, value: i32) -> Result<(), RuntimeFault> {
        if self.stack.len() >= self.stack_limit {
            return Err(RuntimeFault::StackOverflow {
                limit: self.stack_limit,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    fn execute_op(&mut self, op: Op) -> Result<ControlFlow, RuntimeFault> {
        match op {
            Op::Push(value) => self.push(value)?,
            Op::Dup => {
                let value = *self.stack.last().ok_or(RuntimeFault::StackUnderflow)?;
                self.push(value)?;
            }
            Op::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(RuntimeFault::StackUnderflow);
                }
                self.stack.swap(len - 1, len - 2);
            }
            Op::Peek => {
                let index = self.pop()?;
                let top = self.stack.len() as i64 - 1;
                let slot = top - index as i64;
                if index < 0 || slot < 0 {
                    return Err(RuntimeFault::StackUnderflow);
                }
                let value = self.stack[slot as usize];
                self.push(value)?;
            }
            Op::Read => {
                let address = self.pop()?;
                let value = self.memory.read(address)?;
                self.push(value)?;
            }
            Op::Write => {
                let value = self.pop()?;
                let address = self.pop()?;
                if let Some(allocator) = self.allocator
                    && address as i64 == allocator.offset_address() as i64
                {
                    allocator.check(self.memory.len(), value)?;
                }
                self.memory.write(address, value)?;
            }
            Op::Jump => {
                let target = self.pop()?;
                let condition = self.pop()?;
                if condition == 1 {
                    self.pointer = usize::try_from(target).map_err(|_| {
                        RuntimeFault::OutOfBoundsAccess {
                            address: target as i64,
                        }
                    })?;
                    return Ok(ControlFlow::Jumped);
                }
            }
            Op::Add => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.wrapping_add(b))?;
            }
            Op::Mult => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.wrapping_mul(b))?;
            }
            Op::Exit => return Ok(ControlFlow::Exit),
            Op::Supervisor => return Ok(ControlFlow::Trap),
        }
        Ok(ControlFlow::Next)
    }
}
