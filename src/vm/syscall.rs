//! Supervisor trap protocol.
//!
//! A program writes a record into memory, stores the record's address in
//! System-State `systemCallArgumentAddress` and executes `supervisor`. The
//! handler runs to completion before the machine resumes at the next
//! instruction; `callbackAddress` is carried in the record but never used.

use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use super::layout::{
    BEEP_SYSCALL, FILE_SYSCALL, RESIZE_SYSCALL, RuntimeStruct, SYSTEM_STATE, SYSTEM_STATE_ADDRESS,
};
use super::memory::Memory;
use super::vm::Machine;

/// Record type tags.
pub mod kind {
    pub const WRITE_FILE: i32 = 1;
    pub const READ_FILE: i32 = 2;
    pub const RESIZE: i32 = 3;
    pub const BEEP: i32 = 4;
}

/// Reserved file names routed to the console.
pub const STD_OUT: &str = "std://out";
pub const STD_ERR: &str = "std://err";
pub const STD_IN: &str = "std://in";

/// A decoded system call request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallRecord {
    WriteFile {
        name_address: i32,
        bytes_address: i32,
        bytes_length: i32,
        callback_address: i32,
    },
    ReadFile {
        name_address: i32,
        bytes_address: i32,
        bytes_length: i32,
        callback_address: i32,
    },
    Resize {
        bytes: i32,
    },
    Beep,
}

impl SyscallRecord {
    pub fn layout(&self) -> &'static RuntimeStruct {
        match self {
            SyscallRecord::WriteFile { .. } | SyscallRecord::ReadFile { .. } => &FILE_SYSCALL,
            SyscallRecord::Resize { .. } => &RESIZE_SYSCALL,
            SyscallRecord::Beep => &BEEP_SYSCALL,
        }
    }

    pub fn kind(&self) -> i32 {
        match self {
            SyscallRecord::WriteFile { .. } => kind::WRITE_FILE,
            SyscallRecord::ReadFile { .. } => kind::READ_FILE,
            SyscallRecord::Resize { .. } => kind::RESIZE,
            SyscallRecord::Beep => kind::BEEP,
        }
    }

    /// Decode the record stored at `address`.
    pub fn decode(memory: &Memory, address: usize) -> Result<Self, String> {
        let kind = memory
            .get(address)
            .ok_or_else(|| format!("system call record at {} is out of bounds", address))?;
        let layout = match kind {
            kind::WRITE_FILE | kind::READ_FILE => &FILE_SYSCALL,
            kind::RESIZE => &RESIZE_SYSCALL,
            kind::BEEP => &BEEP_SYSCALL,
            other => {
                return Err(format!(
                    "unknown system call type {} in record at {}",
                    other, address
                ));
            }
        };
        let words = memory.read_struct(address, layout).ok_or_else(|| {
            format!(
                "system call record {} at {} is truncated",
                layout.name, address
            )
        })?;

        let record = match kind {
            kind::WRITE_FILE => SyscallRecord::WriteFile {
                name_address: words[1],
                bytes_address: words[2],
                bytes_length: words[3],
                callback_address: words[4],
            },
            kind::READ_FILE => SyscallRecord::ReadFile {
                name_address: words[1],
                bytes_address: words[2],
                bytes_length: words[3],
                callback_address: words[4],
            },
            kind::RESIZE => SyscallRecord::Resize { bytes: words[1] },
            _ => SyscallRecord::Beep,
        };
        Ok(record)
    }

    /// Words of the record in layout order.
    pub fn encode(&self) -> Vec<i32> {
        match self {
            SyscallRecord::WriteFile {
                name_address,
                bytes_address,
                bytes_length,
                callback_address,
            }
            | SyscallRecord::ReadFile {
                name_address,
                bytes_address,
                bytes_length,
                callback_address,
            } => vec![
                self.kind(),
                *name_address,
                *bytes_address,
                *bytes_length,
                *callback_address,
            ],
            SyscallRecord::Resize { bytes } => vec![self.kind(), *bytes],
            SyscallRecord::Beep => vec![self.kind()],
        }
    }
}

impl fmt::Display for SyscallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallRecord::WriteFile {
                name_address,
                bytes_address,
                bytes_length,
                ..
            } => write!(
                f,
                "writefile name@{} bytes@{} len {}",
                name_address, bytes_address, bytes_length
            ),
            SyscallRecord::ReadFile {
                name_address,
                bytes_address,
                bytes_length,
                ..
            } => write!(
                f,
                "readfile name@{} bytes@{} len {}",
                name_address, bytes_address, bytes_length
            ),
            SyscallRecord::Resize { bytes } => write!(f, "resize {}", bytes),
            SyscallRecord::Beep => write!(f, "beep"),
        }
    }
}

/// Receives control when the machine executes `supervisor`.
pub trait SupervisorHandler {
    fn handle(&mut self, machine: &mut Machine) -> Result<(), String>;
}

impl<F> SupervisorHandler for F
where
    F: FnMut(&mut Machine) -> Result<(), String>,
{
    fn handle(&mut self, machine: &mut Machine) -> Result<(), String> {
        self(machine)
    }
}

/// Take the pending record address out of System-State, clearing the field.
pub fn take_argument(machine: &mut Machine) -> Result<usize, String> {
    let memory = machine.memory_mut();
    let address = memory
        .field(
            SYSTEM_STATE_ADDRESS,
            &SYSTEM_STATE,
            "systemCallArgumentAddress",
        )
        .ok_or("memory has no System-State header")?;
    memory
        .set_field(
            SYSTEM_STATE_ADDRESS,
            &SYSTEM_STATE,
            "systemCallArgumentAddress",
            0,
        )
        .map_err(|e| e.to_string())?;
    usize::try_from(address)
        .ok()
        .filter(|address| *address != 0)
        .ok_or_else(|| format!("supervisor called with no system call record ({})", address))
}

/// Performs system calls against the console and the file system.
pub struct HostHandler {
    output: Box<dyn Write>,
    input: Box<dyn BufRead>,
    base_dir: PathBuf,
    memory_limit: usize,
    trace: bool,
    handled: Vec<SyscallRecord>,
}

impl HostHandler {
    pub fn new() -> Self {
        Self {
            output: Box::new(io::stdout()),
            input: Box::new(io::BufReader::new(io::stdin())),
            base_dir: PathBuf::from("."),
            memory_limit: 1 << 24,
            trace: false,
            handled: Vec::new(),
        }
    }

    /// Send `std://out` to `output` instead of stdout.
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    /// Read `std://in` from `input` instead of stdin.
    pub fn with_input(mut self, input: Box<dyn BufRead>) -> Self {
        self.input = input;
        self
    }

    /// Directory relative file names are resolved against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Refuse a `resize` that would leave more than `words` words of memory.
    pub fn with_memory_limit(mut self, words: usize) -> Self {
        self.memory_limit = words;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Every record handled so far, in order.
    pub fn handled(&self) -> &[SyscallRecord] {
        &self.handled
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), String> {
        match name {
            STD_OUT => {
                self.output
                    .write_all(bytes)
                    .and_then(|_| self.output.flush())
                    .map_err(|e| format!("failed to write {}: {}", STD_OUT, e))
            }
            STD_ERR => io::stderr()
                .write_all(bytes)
                .map_err(|e| format!("failed to write {}: {}", STD_ERR, e)),
            _ => {
                let path = self.resolve(name);
                fs::write(&path, bytes)
                    .map_err(|e| format!("failed to write '{}': {}", path.display(), e))
            }
        }
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>, String> {
        match name {
            STD_IN => {
                let mut line = String::new();
                self.input
                    .read_line(&mut line)
                    .map_err(|e| format!("failed to read {}: {}", STD_IN, e))?;
                let line = line.trim_end_matches(['\n', '\r']);
                Ok(line.as_bytes().to_vec())
            }
            _ => {
                let path = self.resolve(name);
                fs::read(&path).map_err(|e| format!("failed to read '{}': {}", path.display(), e))
            }
        }
    }
}

impl Default for HostHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn read_name(memory: &Memory, address: i32) -> Result<String, String> {
    let bytes = usize::try_from(address)
        .ok()
        .and_then(|address| memory.read_length_prefixed(address))
        .ok_or_else(|| format!("invalid file name block at {}", address))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn checked_range(address: i32, length: i32) -> Result<(usize, usize), String> {
    match (usize::try_from(address), usize::try_from(length)) {
        (Ok(address), Ok(length)) => Ok((address, length)),
        _ => Err(format!(
            "invalid byte range {} (+{}) in system call record",
            address, length
        )),
    }
}

impl SupervisorHandler for HostHandler {
    fn handle(&mut self, machine: &mut Machine) -> Result<(), String> {
        let argument = take_argument(machine)?;
        let record = SyscallRecord::decode(machine.memory(), argument)?;
        if self.trace {
            eprintln!("[SYSCALL] {} (record at {})", record, argument);
        }

        match &record {
            SyscallRecord::WriteFile {
                name_address,
                bytes_address,
                bytes_length,
                ..
            } => {
                let name = read_name(machine.memory(), *name_address)?;
                let (address, length) = checked_range(*bytes_address, *bytes_length)?;
                let bytes = machine
                    .memory()
                    .read_bytes(address, length)
                    .ok_or_else(|| format!("bytes for '{}' are out of bounds", name))?;
                if self.trace {
                    eprintln!("[SYSCALL] write {} bytes to {}", bytes.len(), name);
                }
                self.write_file(&name, &bytes)?;
            }
            SyscallRecord::ReadFile {
                name_address,
                bytes_address,
                bytes_length,
                ..
            } => {
                let name = read_name(machine.memory(), *name_address)?;
                let (address, capacity) = checked_range(*bytes_address, *bytes_length)?;
                let data = self.read_file(&name)?;
                let count = data.len().min(capacity);
                let memory = machine.memory_mut();
                memory
                    .write_bytes(address, &data[..count])
                    .map_err(|e| format!("readfile buffer for '{}': {}", name, e))?;
                memory
                    .set_field(argument, &FILE_SYSCALL, "bytesLength", count as i32)
                    .map_err(|e| e.to_string())?;
                if self.trace {
                    eprintln!("[SYSCALL] read {} bytes from {}", count, name);
                }
            }
            SyscallRecord::Resize { bytes } => {
                let extra = usize::try_from(*bytes)
                    .map_err(|_| format!("cannot resize memory by {} words", bytes))?;
                let size = machine.memory().len();
                if size
                    .checked_add(extra)
                    .is_none_or(|total| total > self.memory_limit)
                {
                    return Err(format!(
                        "resize by {} words exceeds the memory limit of {} words",
                        bytes, self.memory_limit
                    ));
                }
                machine.memory_mut().grow(extra);
                if self.trace {
                    eprintln!("[SYSCALL] memory is now {} words", machine.memory().len());
                }
            }
            SyscallRecord::Beep => {
                if self.trace {
                    eprintln!("[SYSCALL] beep");
                }
            }
        }

        self.handled.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::encode_program;
    use crate::vm::ops::Op;
    use crate::vm::vm::Outcome;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Shared buffer so the test can inspect what the handler wrote.
    #[derive(Clone, Default)]
    struct SharedOutput(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn length_prefixed(text: &str) -> Vec<i32> {
        let mut words = vec![text.len() as i32];
        words.extend(text.bytes().map(i32::from));
        words
    }

    /// Memory holding System-State, `supervisor; exit` at 4, and free space.
    fn trap_memory() -> Memory {
        let mut words = vec![0; 4];
        words.extend(encode_program(&[Op::Supervisor, Op::Exit]));
        words.resize(64, 0);
        Memory::new(words)
    }

    #[test]
    fn test_record_roundtrip() {
        let record = SyscallRecord::WriteFile {
            name_address: 10,
            bytes_address: 20,
            bytes_length: 2,
            callback_address: 0,
        };
        let mut memory = Memory::zeroed(8);
        for (i, word) in record.encode().into_iter().enumerate() {
            memory.set(2 + i, word).unwrap();
        }
        assert_eq!(SyscallRecord::decode(&memory, 2), Ok(record));
        assert_eq!(SyscallRecord::Resize { bytes: 5 }.encode(), vec![3, 5]);
    }

    #[test]
    fn test_unknown_record() {
        let memory = Memory::new(vec![0, 9]);
        assert!(SyscallRecord::decode(&memory, 1).is_err());
    }

    #[test]
    fn test_write_to_stdout() {
        let mut memory = trap_memory();
        let name = length_prefixed(STD_OUT);
        let text = length_prefixed("hi");
        for (i, word) in name.iter().enumerate() {
            memory.set(20 + i, *word).unwrap();
        }
        for (i, word) in text.iter().enumerate() {
            memory.set(40 + i, *word).unwrap();
        }
        let record = SyscallRecord::WriteFile {
            name_address: 20,
            bytes_address: 41,
            bytes_length: 2,
            callback_address: 0,
        };
        for (i, word) in record.encode().into_iter().enumerate() {
            memory.set(50 + i, word).unwrap();
        }
        memory.set(1, 50).unwrap();

        let output = SharedOutput::default();
        let mut handler = HostHandler::new().with_output(Box::new(output.clone()));
        let mut machine = Machine::new(memory, 4);
        let outcome = machine.run(&mut handler).unwrap();

        assert_eq!(outcome, Outcome::Exited);
        assert_eq!(output.0.borrow().as_slice(), b"hi");
        assert_eq!(handler.handled(), &[record]);
        assert_eq!(machine.memory().get(1), Some(0));
    }

    #[test]
    fn test_read_from_stdin_truncates() {
        let mut memory = trap_memory();
        for (i, word) in length_prefixed(STD_IN).iter().enumerate() {
            memory.set(20 + i, *word).unwrap();
        }
        let record = SyscallRecord::ReadFile {
            name_address: 20,
            bytes_address: 40,
            bytes_length: 3,
            callback_address: 0,
        };
        for (i, word) in record.encode().into_iter().enumerate() {
            memory.set(50 + i, word).unwrap();
        }
        memory.set(1, 50).unwrap();

        let mut handler = HostHandler::new().with_input(Box::new(io::Cursor::new(b"hello\n".to_vec())));
        let mut machine = Machine::new(memory, 4);
        machine.run(&mut handler).unwrap();

        assert_eq!(machine.memory().read_bytes(40, 4), Some(b"hel\0".to_vec()));
        assert_eq!(machine.memory().field(50, &FILE_SYSCALL, "bytesLength"), Some(3));
    }

    #[test]
    fn test_resize() {
        let mut memory = trap_memory();
        memory.set(60, kind::RESIZE).unwrap();
        memory.set(61, 16).unwrap();
        memory.set(1, 60).unwrap();

        let mut handler = HostHandler::new();
        let mut machine = Machine::new(memory, 4);
        machine.run(&mut handler).unwrap();

        assert_eq!(machine.memory().len(), 80);
        assert_eq!(machine.memory().get(2), Some(80));
    }

    #[test]
    fn test_resize_past_memory_limit() {
        let mut memory = trap_memory();
        memory.set(60, kind::RESIZE).unwrap();
        memory.set(61, i32::MAX).unwrap();
        memory.set(1, 60).unwrap();

        let mut handler = HostHandler::new().with_memory_limit(128);
        let mut machine = Machine::new(memory, 4);
        let err = machine.run(&mut handler).unwrap_err();

        assert!(err.contains("memory limit of 128 words"));
        assert_eq!(machine.memory().len(), 64);
        assert_eq!(machine.memory().get(2), Some(0));
    }

    #[test]
    fn test_missing_record_is_an_error() {
        let mut handler = HostHandler::new();
        let mut machine = Machine::new(trap_memory(), 4);
        assert!(machine.run(&mut handler).is_err());
    }

    #[test]
    fn test_write_file_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = HostHandler::new().with_base_dir(dir.path());
        handler.write_file("out.txt", b"data").unwrap();
        assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"data");
        assert_eq!(handler.read_file("out.txt").unwrap(), b"data");
    }
}
