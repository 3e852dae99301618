//! Flat word-addressed memory.
//!
//! One `Vec<i32>` holds the System-State header, static data, the program
//! itself and the allocatable region. The capacity is fixed when an image is
//! loaded; only the `resize` system call grows it.

use super::layout::{RuntimeStruct, SYSTEM_STATE, SYSTEM_STATE_ADDRESS};
use super::vm::RuntimeFault;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    words: Vec<i32>,
}

impl Memory {
    pub fn new(words: Vec<i32>) -> Self {
        Self { words }
    }

    /// Memory of `len` zeroed words.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[i32] {
        &self.words
    }

    /// Raw read used by the host; `None` when out of range.
    pub fn get(&self, address: usize) -> Option<i32> {
        self.words.get(address).copied()
    }

    /// Raw write used by the host. Unlike [`Memory::write`] this does not
    /// honour the null guard, so the host can maintain the System-State
    /// header.
    pub fn set(&mut self, address: usize, value: i32) -> Result<(), RuntimeFault> {
        match self.words.get_mut(address) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeFault::OutOfBoundsAccess {
                address: address as i64,
            }),
        }
    }

    /// `read` as executed by the machine.
    pub fn read(&self, address: i32) -> Result<i32, RuntimeFault> {
        usize::try_from(address)
            .ok()
            .and_then(|index| self.words.get(index).copied())
            .ok_or(RuntimeFault::OutOfBoundsAccess {
                address: address as i64,
            })
    }

    /// `write` as executed by the machine. Writes to address 0 are dropped.
    pub fn write(&mut self, address: i32, value: i32) -> Result<(), RuntimeFault> {
        if address == 0 {
            return Ok(());
        }
        let slot = usize::try_from(address)
            .ok()
            .and_then(|index| self.words.get_mut(index))
            .ok_or(RuntimeFault::OutOfBoundsAccess {
                address: address as i64,
            })?;
        *slot = value;
        Ok(())
    }

    pub fn read_words(&self, address: usize, len: usize) -> Option<&[i32]> {
        let end = address.checked_add(len)?;
        self.words.get(address..end)
    }

    /// Read a block laid out as `[length, byte, byte, ...]`.
    pub fn read_length_prefixed(&self, address: usize) -> Option<Vec<u8>> {
        let len = usize::try_from(self.get(address)?).ok()?;
        let words = self.read_words(address + 1, len)?;
        Some(words.iter().map(|word| *word as u8).collect())
    }

    /// Read `len` bytes stored one per word.
    pub fn read_bytes(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        let words = self.read_words(address, len)?;
        Some(words.iter().map(|word| *word as u8).collect())
    }

    /// Store `bytes` one per word starting at `address`.
    pub fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> Result<(), RuntimeFault> {
        let end = address + bytes.len();
        let out_of_bounds = RuntimeFault::OutOfBoundsAccess {
            address: end as i64,
        };
        let slots = self.words.get_mut(address..end).ok_or(out_of_bounds)?;
        for (slot, byte) in slots.iter_mut().zip(bytes) {
            *slot = *byte as i32;
        }
        Ok(())
    }

    pub fn read_struct(&self, base: usize, layout: &RuntimeStruct) -> Option<Vec<i32>> {
        self.read_words(base, layout.len()).map(|words| words.to_vec())
    }

    pub fn write_struct(
        &mut self,
        base: usize,
        layout: &RuntimeStruct,
        values: &[(&str, i32)],
    ) -> Result<(), RuntimeFault> {
        for (index, word) in layout.words(values).into_iter().enumerate() {
            self.set(base + index, word)?;
        }
        Ok(())
    }

    /// Read one field of a struct instance.
    pub fn field(&self, base: usize, layout: &RuntimeStruct, field: &str) -> Option<i32> {
        self.get(layout.field_address(base, field)?)
    }

    pub fn set_field(
        &mut self,
        base: usize,
        layout: &RuntimeStruct,
        field: &str,
        value: i32,
    ) -> Result<(), RuntimeFault> {
        let address = layout
            .field_address(base, field)
            .ok_or(RuntimeFault::OutOfBoundsAccess { address: -1 })?;
        self.set(address, value)
    }

    /// Append `extra` zeroed words and record the new size in System-State.
    pub fn grow(&mut self, extra: usize) {
        self.words.resize(self.words.len() + extra, 0);
        let size = self.words.len() as i32;
        // A memory too small to hold System-State has nowhere to record it.
        let _ = self.set_field(SYSTEM_STATE_ADDRESS, &SYSTEM_STATE, "memorySize", size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_guard() {
        let mut memory = Memory::new(vec![0, 5, 6]);
        memory.write(0, 77).unwrap();
        assert_eq!(memory.words(), &[0, 5, 6]);
        memory.write(2, 9).unwrap();
        assert_eq!(memory.words(), &[0, 5, 9]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut memory = Memory::zeroed(4);
        assert_eq!(
            memory.read(4),
            Err(RuntimeFault::OutOfBoundsAccess { address: 4 })
        );
        assert_eq!(
            memory.read(-1),
            Err(RuntimeFault::OutOfBoundsAccess { address: -1 })
        );
        assert!(memory.write(10, 1).is_err());
        assert_eq!(memory.len(), 4);
    }

    #[test]
    fn test_length_prefixed() {
        let memory = Memory::new(vec![0, 2, 'h' as i32, 'i' as i32, 0]);
        assert_eq!(memory.read_length_prefixed(1), Some(b"hi".to_vec()));
        assert_eq!(memory.read_length_prefixed(4), Some(Vec::new()));
        assert_eq!(Memory::new(vec![0, 9, 1]).read_length_prefixed(1), None);
    }

    #[test]
    fn test_write_bytes() {
        let mut memory = Memory::zeroed(6);
        memory.write_bytes(2, b"ok").unwrap();
        assert_eq!(memory.read_bytes(2, 2), Some(b"ok".to_vec()));
        assert!(memory.write_bytes(5, b"too long").is_err());
    }

    #[test]
    fn test_grow_updates_memory_size() {
        let mut memory = Memory::zeroed(SYSTEM_STATE.len());
        memory.grow(12);
        assert_eq!(memory.len(), 16);
        assert_eq!(memory.field(0, &SYSTEM_STATE, "memorySize"), Some(16));
    }
}
