pub mod allocator;
pub mod bytecode;
pub mod debug;
pub mod layout;
pub mod memory;
mod ops;
pub mod syscall;
#[allow(clippy::module_inception)]
mod vm;

use serde::{Deserialize, Serialize};

pub use allocator::BumpAllocator;
pub use bytecode::EncodingError;
pub use debug::{Trace, TraceEntry};
pub use memory::Memory;
pub use ops::{Op, tag};
pub use syscall::{HostHandler, SupervisorHandler, SyscallRecord};
pub use vm::{Event, Machine, Mode, Outcome, RuntimeFault};

/// A linked program image.
///
/// `memory` is laid out as `[data blocks][lookup table][program][Runtime
/// Header]`; `entry` and `header` are offsets into it. The image carries no
/// absolute addresses, so it runs wherever it is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    pub memory: Vec<i32>,
    pub entry: Option<usize>,
    pub header: usize,
}

impl Executable {
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("failed to encode executable: {}", e))
    }

    pub fn from_json(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("invalid executable image: {}", e))
    }
}
