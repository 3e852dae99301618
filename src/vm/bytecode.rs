//! Bytecode encoding/decoding for stax.
//!
//! Word format:
//! - Opcode tag: one i32 word (see [`super::ops::tag`])
//! - `push` literal: one extra i32 word following its tag
//!
//! Instructions live in the same flat memory as data, so decoding reads
//! straight out of a word slice at an address.

use super::ops::{tag, Op};

/// Error type for bytecode operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The word at `address` is not an opcode tag
    UnknownOpcode { address: usize, tag: i32 },
    /// A `push` at `address` has no literal word after it
    Truncated { address: usize },
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::UnknownOpcode { address, tag } => {
                write!(f, "unknown opcode {} at address {}", tag, address)
            }
            EncodingError::Truncated { address } => {
                write!(f, "truncated instruction at address {}", address)
            }
        }
    }
}

impl std::error::Error for EncodingError {}

/// Encode one instruction into its words.
pub fn encode(op: &Op) -> Vec<i32> {
    let mut words = Vec::with_capacity(op.width());
    encode_into(&mut words, op);
    words
}

/// Append the words of one instruction to `out`.
pub fn encode_into(out: &mut Vec<i32>, op: &Op) {
    out.push(op.tag());
    if let Op::Push(value) = op {
        out.push(*value);
    }
}

/// Encode an instruction sequence into a contiguous block of words.
pub fn encode_program(ops: &[Op]) -> Vec<i32> {
    let mut words = Vec::with_capacity(ops.iter().map(Op::width).sum());
    for op in ops {
        encode_into(&mut words, op);
    }
    words
}

/// Decode the instruction stored at `address`.
pub fn decode(address: usize, memory: &[i32]) -> Result<Op, EncodingError> {
    let word = *memory
        .get(address)
        .ok_or(EncodingError::Truncated { address })?;

    let op = match word {
        tag::PUSH => {
            let value = *memory
                .get(address + 1)
                .ok_or(EncodingError::Truncated { address })?;
            Op::Push(value)
        }
        tag::READ => Op::Read,
        tag::WRITE => Op::Write,
        tag::EXIT => Op::Exit,
        tag::JUMP => Op::Jump,
        tag::ADD => Op::Add,
        tag::DUP => Op::Dup,
        tag::SWAP => Op::Swap,
        tag::PEEK => Op::Peek,
        tag::MULT => Op::Mult,
        tag::SUPERVISOR => Op::Supervisor,
        other => {
            return Err(EncodingError::UnknownOpcode {
                address,
                tag: other,
            });
        }
    };
    Ok(op)
}

/// Decode a whole block of words, returning each instruction with its word
/// offset inside the block.
pub fn decode_program(words: &[i32]) -> Result<Vec<(usize, Op)>, EncodingError> {
    let mut ops = Vec::new();
    let mut address = 0;
    while address < words.len() {
        let op = decode(address, words)?;
        ops.push((address, op));
        address += op.width();
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_opcodes() {
        let mut ops = Op::ALL.to_vec();
        ops.push(Op::Push(i32::MAX));
        ops.push(Op::Push(i32::MIN));
        ops.push(Op::Push(-1));

        for op in ops {
            let words = encode(&op);
            assert_eq!(words.len(), op.width(), "{}", op);
            assert_eq!(decode(0, &words), Ok(op));
        }
    }

    #[test]
    fn test_decode_at_offset() {
        let memory = vec![99, 99, tag::PUSH, 42, tag::ADD];
        assert_eq!(decode(2, &memory), Ok(Op::Push(42)));
        assert_eq!(decode(4, &memory), Ok(Op::Add));
    }

    #[test]
    fn test_unknown_opcode() {
        let memory = vec![8];
        assert_eq!(
            decode(0, &memory),
            Err(EncodingError::UnknownOpcode { address: 0, tag: 8 })
        );
        assert!(decode(0, &[-5]).is_err());
    }

    #[test]
    fn test_truncated_push() {
        let memory = vec![tag::PUSH];
        assert_eq!(
            decode(0, &memory),
            Err(EncodingError::Truncated { address: 0 })
        );
    }

    #[test]
    fn test_program_roundtrip() {
        let ops = vec![Op::Push(3), Op::Push(4), Op::Mult, Op::Exit];
        let words = encode_program(&ops);
        assert_eq!(words, vec![0, 3, 0, 4, 10, 3]);

        let decoded = decode_program(&words).unwrap();
        assert_eq!(
            decoded,
            vec![(0, Op::Push(3)), (2, Op::Push(4)), (4, Op::Mult), (5, Op::Exit)]
        );
    }
}
