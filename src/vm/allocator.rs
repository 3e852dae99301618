//! Host-side view of the bump allocator.
//!
//! Compiled programs allocate by bumping `allocationOffset` in their Runtime
//! Header (see `compiler::allocator`). This type locates that field for the
//! machine and enforces the capacity limit checked on every header update.

use super::layout::RUNTIME_HEADER;
use super::memory::Memory;
use super::vm::RuntimeFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BumpAllocator {
    header: usize,
}

impl BumpAllocator {
    /// Allocator for the image whose Runtime Header sits at `header`.
    pub fn new(header: usize) -> Self {
        Self { header }
    }

    pub fn header(&self) -> usize {
        self.header
    }

    /// Absolute address of the header's `allocationOffset` field.
    pub fn offset_address(&self) -> usize {
        self.header + RUNTIME_HEADER.field_index("allocationOffset").unwrap_or(0)
    }

    /// Current high-water mark, relative to the header.
    pub fn offset(&self, memory: &Memory) -> Option<i32> {
        memory.get(self.offset_address())
    }

    /// Absolute address the next allocation will return.
    pub fn next_address(&self, memory: &Memory) -> Option<usize> {
        let offset = self.offset(memory)?;
        usize::try_from(self.header as i64 + offset as i64).ok()
    }

    /// Fails when a header-relative `offset` points past the end of memory.
    pub fn check(&self, capacity: usize, offset: i32) -> Result<(), RuntimeFault> {
        let end = self.header as i64 + offset as i64;
        if end < 0 || end > capacity as i64 {
            return Err(RuntimeFault::AllocatorExhausted {
                requested_end: end,
                capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_header(header: usize, len: usize) -> Memory {
        let mut memory = Memory::zeroed(len);
        memory
            .write_struct(header, &RUNTIME_HEADER, &[("allocationOffset", 4)])
            .unwrap();
        memory
    }

    #[test]
    fn test_next_address_follows_offset() {
        let mut memory = memory_with_header(10, 64);
        let allocator = BumpAllocator::new(10);
        assert_eq!(allocator.offset_address(), 10);
        assert_eq!(allocator.next_address(&memory), Some(14));

        memory.set(allocator.offset_address(), 12).unwrap();
        assert_eq!(allocator.offset(&memory), Some(12));
        assert_eq!(allocator.next_address(&memory), Some(22));
    }

    #[test]
    fn test_check_bounds() {
        let allocator = BumpAllocator::new(4);
        assert!(allocator.check(8, 4).is_ok());
        assert_eq!(
            allocator.check(8, 5),
            Err(RuntimeFault::AllocatorExhausted {
                requested_end: 9,
                capacity: 8,
            })
        );
        assert!(matches!(
            allocator.check(8, -5),
            Err(RuntimeFault::AllocatorExhausted { requested_end: -1, .. })
        ));
    }
}
