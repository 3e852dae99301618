/// Instructions of the stax stack machine.
///
/// Every instruction is one opcode word; `Push` carries one extra literal
/// word. Values are 32-bit signed integers and arithmetic wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // ========================================
    // Stack Manipulation
    // ========================================
    Push(i32),
    Dup,
    Swap,
    /// Pop an index `i`, push `stack[top - i]`.
    Peek,

    // ========================================
    // Memory
    // ========================================
    /// Pop an address, push `memory[address]`.
    Read,
    /// Pop a value, pop an address, store unless the address is 0.
    Write,

    // ========================================
    // Control
    // ========================================
    /// Pop a target, pop a condition; jump when the condition is 1.
    Jump,
    Exit,
    Supervisor,

    // ========================================
    // Arithmetic
    // ========================================
    Add,
    Mult,
}

/// Opcode tags as they appear in memory.
pub mod tag {
    pub const PUSH: i32 = 0;
    pub const READ: i32 = 1;
    pub const WRITE: i32 = 2;
    pub const EXIT: i32 = 3;
    pub const JUMP: i32 = 4;
    pub const ADD: i32 = 5;
    pub const DUP: i32 = 6;
    pub const SWAP: i32 = 7;
    pub const PEEK: i32 = 9;
    pub const MULT: i32 = 10;
    pub const SUPERVISOR: i32 = 11;
}

impl Op {
    /// Every opcode, with a placeholder literal for `Push`.
    pub const ALL: [Op; 11] = [
        Op::Push(0),
        Op::Dup,
        Op::Swap,
        Op::Peek,
        Op::Read,
        Op::Write,
        Op::Jump,
        Op::Exit,
        Op::Supervisor,
        Op::Add,
        Op::Mult,
    ];

    pub fn tag(&self) -> i32 {
        match self {
            Op::Push(_) => tag::PUSH,
            Op::Read => tag::READ,
            Op::Write => tag::WRITE,
            Op::Exit => tag::EXIT,
            Op::Jump => tag::JUMP,
            Op::Add => tag::ADD,
            Op::Dup => tag::DUP,
            Op::Swap => tag::SWAP,
            Op::Peek => tag::PEEK,
            Op::Mult => tag::MULT,
            Op::Supervisor => tag::SUPERVISOR,
        }
    }

    /// Number of memory words the encoded instruction occupies.
    pub fn width(&self) -> usize {
        match self {
            Op::Push(_) => 2,
            _ => 1,
        }
    }

    /// Net change of the operand stack depth after executing this op.
    ///
    /// `peek` and `read` pop one value and push one, `write` and `jump`
    /// consume two, the binary arithmetic ops fold two values into one.
    pub fn stack_effect(&self) -> i32 {
        match self {
            Op::Push(_) | Op::Dup => 1,
            Op::Swap | Op::Peek | Op::Read => 0,
            Op::Write | Op::Jump => -2,
            Op::Add | Op::Mult => -1,
            Op::Exit | Op::Supervisor => 0,
        }
    }

    /// Minimum stack depth required before the op executes.
    pub fn stack_inputs(&self) -> usize {
        match self {
            Op::Push(_) | Op::Exit | Op::Supervisor => 0,
            Op::Dup | Op::Peek | Op::Read => 1,
            Op::Swap | Op::Write | Op::Jump | Op::Add | Op::Mult => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Push(_) => "push",
            Op::Dup => "dup",
            Op::Swap => "swap",
            Op::Peek => "peek",
            Op::Read => "read",
            Op::Write => "write",
            Op::Jump => "jump",
            Op::Exit => "exit",
            Op::Supervisor => "supervisor",
            Op::Add => "add",
            Op::Mult => "mult",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Push(value) => write!(f, "push {}", value),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        for op in Op::ALL {
            let expected = if matches!(op, Op::Push(_)) { 2 } else { 1 };
            assert_eq!(op.width(), expected, "{}", op);
        }
    }

    #[test]
    fn test_tags_are_unique() {
        let mut tags: Vec<i32> = Op::ALL.iter().map(|op| op.tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), Op::ALL.len());
        assert!(!tags.contains(&8));
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Op::Push(7).stack_effect(), 1);
        assert_eq!(Op::Write.stack_effect(), -2);
        assert_eq!(Op::Jump.stack_effect(), -2);
        assert_eq!(Op::Add.stack_effect(), -1);
        assert_eq!(Op::Peek.stack_effect(), 0);
        assert_eq!(Op::Supervisor.stack_effect(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Op::Push(-3).to_string(), "push -3");
        assert_eq!(Op::Supervisor.to_string(), "supervisor");
    }
}
