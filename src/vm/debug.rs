//! Execution trace consumed by external debugging tools.

use serde::{Deserialize, Serialize};

use super::ops::Op;
use super::vm::Mode;

/// Machine state just before one instruction executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step: u64,
    pub pointer: usize,
    pub instruction: String,
    pub stack: Vec<i32>,
    pub mode: Mode,
}

/// A bounded record of executed instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub limit: usize,
    pub entries: Vec<TraceEntry>,
    /// Set once steps were dropped because the limit was reached.
    pub truncated: bool,
}

impl Trace {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Vec::new(),
            truncated: false,
        }
    }

    pub fn record(&mut self, step: u64, pointer: usize, op: Op, stack: &[i32], mode: Mode) {
        if self.entries.len() >= self.limit {
            self.truncated = true;
            return;
        }
        self.entries.push(TraceEntry {
            step,
            pointer,
            instruction: op.to_string(),
            stack: stack.to_vec(),
            mode,
        });
    }

    /// Entries that executed the instruction at `pointer`.
    pub fn visits(&self, pointer: usize) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(move |entry| entry.pointer == pointer)
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("failed to encode trace: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit() {
        let mut trace = Trace::new(2);
        for step in 0..5 {
            trace.record(step, step as usize, Op::Dup, &[1], Mode::User);
        }
        assert_eq!(trace.entries.len(), 2);
        assert!(trace.truncated);
        assert_eq!(trace.entries[1].step, 1);
    }

    #[test]
    fn test_visits() {
        let mut trace = Trace::new(10);
        trace.record(0, 4, Op::Push(1), &[], Mode::User);
        trace.record(1, 6, Op::Jump, &[1, 4], Mode::User);
        trace.record(2, 4, Op::Push(1), &[], Mode::User);
        assert_eq!(trace.visits(4).count(), 2);
        assert_eq!(trace.visits(6).next().unwrap().instruction, "jump");
    }

    #[test]
    fn test_json() {
        let mut trace = Trace::new(1);
        trace.record(0, 0, Op::Push(3), &[7], Mode::Kernel);
        let json = trace.to_json().unwrap();
        let back: Trace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace);
        assert!(json.contains("\"push 3\""));
    }
}
