//! Packs data, lookup table, program and Runtime Header into one image.

use super::codegen::Assembly;
use super::data::DataSection;
use crate::vm::Executable;
use crate::vm::bytecode::encode_program;
use crate::vm::layout::RUNTIME_HEADER;

/// Image offsets of each section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub data: usize,
    pub lookup: usize,
    pub program: usize,
    pub header: usize,
    /// Total image length; the free region starts here once loaded.
    pub end: usize,
}

impl ImageLayout {
    /// Recover the section offsets of a linked image from its Runtime Header.
    pub fn of(executable: &Executable) -> Result<Self, String> {
        let header = executable.header;
        let end = executable.memory.len();
        if header + RUNTIME_HEADER.len() > end {
            return Err(format!(
                "runtime header at {} does not fit in a {} word image",
                header, end
            ));
        }
        let section = |field: &str| -> Result<usize, String> {
            let offset = RUNTIME_HEADER
                .field_index(field)
                .map(|index| executable.memory[header + index])
                .unwrap_or_default();
            usize::try_from(header as i64 + offset as i64)
                .ok()
                .filter(|address| *address <= header)
                .ok_or_else(|| format!("{} {} points outside the image", field, offset))
        };

        let layout = Self {
            data: section("dataOffset")?,
            lookup: section("lookupOffset")?,
            program: section("programOffset")?,
            header,
            end,
        };
        if !(layout.data <= layout.lookup && layout.lookup <= layout.program) {
            return Err(format!(
                "sections out of order: data {}, lookup {}, program {}",
                layout.data, layout.lookup, layout.program
            ));
        }
        Ok(layout)
    }
}

pub fn link(data: &DataSection, assembly: &Assembly) -> (Executable, ImageLayout) {
    let program_words = encode_program(&assembly.ops);
    let program = data.word_len();
    let header = program + program_words.len();

    let data_layout = data.layout(header);
    let relative = |offset: usize| (offset as i64 - header as i64) as i32;

    let mut memory = Vec::with_capacity(header + RUNTIME_HEADER.len());
    memory.extend_from_slice(&data_layout.words);
    memory.extend_from_slice(&program_words);
    memory.extend(RUNTIME_HEADER.words(&[
        // Allocation starts right after the header.
        ("allocationOffset", RUNTIME_HEADER.len() as i32),
        ("lookupOffset", relative(data_layout.lookup)),
        ("dataOffset", relative(0)),
        ("programOffset", relative(program)),
    ]));

    let layout = ImageLayout {
        data: 0,
        lookup: data_layout.lookup,
        program,
        header,
        end: memory.len(),
    };
    let executable = Executable {
        memory,
        entry: Some(program),
        header,
    };
    (executable, layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::sourcemap::SourceMap;
    use crate::vm::Op;

    #[test]
    fn test_sections_are_contiguous() {
        let mut data = DataSection::new();
        data.number(9);
        let assembly = Assembly {
            ops: vec![Op::Push(1), Op::Exit],
            source_map: SourceMap::default(),
        };
        let (executable, layout) = link(&data, &assembly);

        // [1, 9] [lookup] [push 1, exit] [header x4]
        assert_eq!(
            layout,
            ImageLayout {
                data: 0,
                lookup: 2,
                program: 3,
                header: 6,
                end: 10,
            }
        );
        assert_eq!(executable.entry, Some(3));
        assert_eq!(executable.header, 6);
        assert_eq!(
            executable.memory,
            vec![1, 9, -6, 0, 1, 3, 4, -4, -6, -3]
        );
        assert_eq!(ImageLayout::of(&executable), Ok(layout));
    }

    #[test]
    fn test_layout_of_corrupt_header() {
        let executable = Executable {
            memory: vec![3, 0, 4, 99, 0, 0],
            entry: Some(0),
            header: 2,
        };
        assert!(ImageLayout::of(&executable).is_err());
    }

    #[test]
    fn test_layout_of_unordered_sections() {
        // lookup at 2 but program at 0
        let executable = Executable {
            memory: vec![3, 3, 3, 4, -1, -3, -3],
            entry: Some(0),
            header: 3,
        };
        let err = ImageLayout::of(&executable).unwrap_err();
        assert!(err.contains("out of order"));
    }
}
