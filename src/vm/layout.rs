//! Named-field struct layouts shared by the code generator and the host.
//!
//! A struct is an ordered list of one-word fields; a field lives at
//! `base + index_of(field)`.

/// Describes one in-memory struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStruct {
    pub name: &'static str,
    pub fields: &'static [&'static str],
}

impl RuntimeStruct {
    pub const fn new(name: &'static str, fields: &'static [&'static str]) -> Self {
        Self { name, fields }
    }

    /// Number of words an instance occupies.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|name| *name == field)
    }

    pub fn field_address(&self, base: usize, field: &str) -> Option<usize> {
        self.field_index(field).map(|index| base + index)
    }

    /// Lay out `values` in field order; missing fields are zero.
    pub fn words(&self, values: &[(&str, i32)]) -> Vec<i32> {
        self.fields
            .iter()
            .map(|field| {
                values
                    .iter()
                    .find(|(name, _)| name == field)
                    .map(|(_, value)| *value)
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Machine-wide state at absolute address 0. The first field doubles as the
/// null guard.
pub const SYSTEM_STATE: RuntimeStruct = RuntimeStruct::new(
    "SystemState",
    &[
        "nullPointerValue",
        "systemCallArgumentAddress",
        "memorySize",
        "randomAddress",
    ],
);

/// Address of the System-State struct.
pub const SYSTEM_STATE_ADDRESS: usize = 0;

/// Per-image header. Every field is an offset relative to the header itself,
/// which is what lets an image run at any load address.
pub const RUNTIME_HEADER: RuntimeStruct = RuntimeStruct::new(
    "RuntimeHeader",
    &["allocationOffset", "lookupOffset", "dataOffset", "programOffset"],
);

/// A boxed value: a type tag and a one-word payload.
pub const VALUE: RuntimeStruct = RuntimeStruct::new("Value", &["type", "payload"]);

/// Record layout for `writefile` and `readfile` system calls.
pub const FILE_SYSCALL: RuntimeStruct = RuntimeStruct::new(
    "FileSyscall",
    &[
        "type",
        "nameAddress",
        "bytesAddress",
        "bytesLength",
        "callbackAddress",
    ],
);

pub const RESIZE_SYSCALL: RuntimeStruct = RuntimeStruct::new("ResizeSyscall", &["type", "bytes"]);

pub const BEEP_SYSCALL: RuntimeStruct = RuntimeStruct::new("BeepSyscall", &["type"]);

/// Type tag stored in the first word of a [`VALUE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ValueTag {
    Number = 1,
    String = 2,
}

impl ValueTag {
    pub fn from_word(word: i32) -> Option<Self> {
        match word {
            1 => Some(ValueTag::Number),
            2 => Some(ValueTag::String),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_address() {
        assert_eq!(RUNTIME_HEADER.field_address(100, "allocationOffset"), Some(100));
        assert_eq!(RUNTIME_HEADER.field_address(100, "programOffset"), Some(103));
        assert_eq!(RUNTIME_HEADER.field_address(100, "heapOffset"), None);
    }

    #[test]
    fn test_words_in_field_order() {
        let words = FILE_SYSCALL.words(&[("bytesLength", 2), ("type", 1)]);
        assert_eq!(words, vec![1, 0, 0, 2, 0]);
    }

    #[test]
    fn test_system_call_argument_is_second_word() {
        assert_eq!(SYSTEM_STATE.field_index("systemCallArgumentAddress"), Some(1));
        assert_eq!(SYSTEM_STATE.len(), 4);
    }

    #[test]
    fn test_value_tag() {
        assert_eq!(ValueTag::from_word(1), Some(ValueTag::Number));
        assert_eq!(ValueTag::from_word(2), Some(ValueTag::String));
        assert_eq!(ValueTag::from_word(0), None);
    }
}
