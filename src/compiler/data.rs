//! Static data section.
//!
//! Literals are interned into blocks that are packed at the start of the
//! image. A lookup table after the blocks holds each block's offset relative
//! to the Runtime Header, so code finds block `i` at
//! `runtime + lookup[i]`.

use std::collections::HashMap;

use crate::vm::layout::ValueTag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataBlock {
    /// A number Value: `[1, n]`.
    Number(i32),
    /// A length-prefixed byte string: `[len, b0, b1, ...]`.
    Bytes(Vec<u8>),
    /// A string Value pointing at the `Bytes` block with the given index.
    StringValue(usize),
}

impl DataBlock {
    pub fn len(&self) -> usize {
        match self {
            DataBlock::Number(_) | DataBlock::StringValue(_) => 2,
            DataBlock::Bytes(bytes) => bytes.len() + 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSection {
    blocks: Vec<DataBlock>,
    numbers: HashMap<i32, usize>,
    strings: HashMap<Vec<u8>, usize>,
}

/// Word offsets of the sections produced by [`DataSection::layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    /// Block and lookup words, in image order.
    pub words: Vec<i32>,
    /// Image offset of each block.
    pub block_offsets: Vec<usize>,
    /// Image offset of the lookup table.
    pub lookup: usize,
}

impl DataSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    fn push(&mut self, block: DataBlock) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Index of the number Value block for `value`.
    pub fn number(&mut self, value: i32) -> usize {
        if let Some(index) = self.numbers.get(&value) {
            return *index;
        }
        let index = self.push(DataBlock::Number(value));
        self.numbers.insert(value, index);
        index
    }

    /// Index of the string Value block for `text`.
    pub fn string(&mut self, text: &[u8]) -> usize {
        if let Some(index) = self.strings.get(text) {
            return *index;
        }
        let bytes = self.push(DataBlock::Bytes(text.to_vec()));
        let index = self.push(DataBlock::StringValue(bytes));
        self.strings.insert(text.to_vec(), index);
        index
    }

    /// Words of all blocks and the lookup table. The blocks start at image
    /// offset 0; `header` is the image offset of the Runtime Header.
    pub fn layout(&self, header: usize) -> DataLayout {
        let mut block_offsets = Vec::with_capacity(self.blocks.len());
        let mut offset = 0;
        for block in &self.blocks {
            block_offsets.push(offset);
            offset += block.len();
        }
        let lookup = offset;
        let relative = |offset: usize| (offset as i64 - header as i64) as i32;

        let mut words = Vec::with_capacity(lookup + self.blocks.len());
        for block in &self.blocks {
            match block {
                DataBlock::Number(value) => {
                    words.push(ValueTag::Number as i32);
                    words.push(*value);
                }
                DataBlock::Bytes(bytes) => {
                    words.push(bytes.len() as i32);
                    words.extend(bytes.iter().map(|byte| *byte as i32));
                }
                DataBlock::StringValue(bytes) => {
                    words.push(ValueTag::String as i32);
                    words.push(relative(block_offsets[*bytes]));
                }
            }
        }
        words.extend(block_offsets.iter().map(|offset| relative(*offset)));

        DataLayout {
            words,
            block_offsets,
            lookup,
        }
    }

    /// Number of words [`DataSection::layout`] produces.
    pub fn word_len(&self) -> usize {
        self.blocks.iter().map(DataBlock::len).sum::<usize>() + self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let mut data = DataSection::new();
        let five = data.number(5);
        let hi = data.string(b"hi");
        assert_eq!(data.number(5), five);
        assert_eq!(data.string(b"hi"), hi);
        assert_eq!(data.blocks().len(), 3);
        assert_eq!(data.blocks()[hi], DataBlock::StringValue(1));
    }

    #[test]
    fn test_layout_is_header_relative() {
        let mut data = DataSection::new();
        data.number(7);
        data.string(b"ok");
        // blocks: [1,7] [2,'o','k'] [2, payload]; lookup at 7
        let header = 20;
        let layout = data.layout(header);
        assert_eq!(layout.block_offsets, vec![0, 2, 5]);
        assert_eq!(layout.lookup, 7);
        assert_eq!(
            layout.words,
            vec![1, 7, 2, 'o' as i32, 'k' as i32, 2, 2 - 20, -20, -18, -15]
        );
        assert_eq!(layout.words.len(), data.word_len());
    }
}
