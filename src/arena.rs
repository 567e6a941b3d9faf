//! Linear byte arena backing every CPU-side staging buffer.
//!
//! The arena is sized once when the graphics core starts. Application-lifetime
//! blocks (vertex and index data) and frame-lifetime blocks (instance,
//! material and atlas-texture records) are all carved out of it up front;
//! per-frame work only moves the write cursor of a [`StagingBuffer`] and never
//! allocates.

use bytemuck::Pod;

use crate::error::{RenderError, RenderResult};

/// Byte range inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBlock {
    pub offset: usize,
    pub size: usize,
}

impl ArenaBlock {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Debug)]
pub struct Arena {
    storage: Vec<u8>,
    cursor: usize,
    alignment: usize,
}

impl Arena {
    /// Creates an arena of `capacity` bytes whose allocations start on
    /// `alignment`-byte boundaries.
    pub fn new(capacity: usize, alignment: usize) -> RenderResult<Self> {
        if !alignment.is_power_of_two() {
            log::error!("Arena alignment {} is not a power of two", alignment);
            return Err(RenderError::InvalidAlignment(alignment));
        }
        log::debug!("Arena created: {} bytes, alignment {}", capacity, alignment);
        Ok(Self {
            storage: vec![0; capacity],
            cursor: 0,
            alignment,
        })
    }

    /// Reserves `size` bytes at the next aligned offset.
    pub fn allocate(&mut self, size: usize) -> RenderResult<ArenaBlock> {
        let offset = align_up(self.cursor, self.alignment);
        let remaining = self.storage.len().saturating_sub(offset);
        if size > remaining {
            log::error!(
                "Arena exhausted: requested {} bytes, {} remaining",
                size,
                remaining
            );
            return Err(RenderError::ArenaExhausted {
                requested: size,
                remaining,
            });
        }
        self.cursor = offset + size;
        Ok(ArenaBlock { offset, size })
    }

    /// Forgets every allocation. Blocks handed out earlier must not be used
    /// afterwards.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn bytes(&self, block: ArenaBlock) -> &[u8] {
        &self.storage[block.offset..block.end()]
    }

    pub fn bytes_mut(&mut self, block: ArenaBlock) -> &mut [u8] {
        &mut self.storage[block.offset..block.end()]
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn remaining(&self) -> usize {
        self.storage.len() - self.cursor
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Capacity needed to hold blocks of the given sizes including alignment
    /// padding between them.
    pub fn required_capacity(sizes: &[usize], alignment: usize) -> usize {
        sizes
            .iter()
            .fold(0, |total, size| align_up(total, alignment) + size)
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Append-only view over an [`ArenaBlock`] with its own write cursor.
#[derive(Debug, Clone)]
pub struct StagingBuffer {
    block: ArenaBlock,
    cursor: usize,
}

impl StagingBuffer {
    pub fn new(block: ArenaBlock) -> Self {
        Self { block, cursor: 0 }
    }

    /// Copies `bytes` at the cursor and returns the offset they were written
    /// at, relative to the start of this buffer.
    pub fn push_bytes(&mut self, arena: &mut Arena, bytes: &[u8]) -> RenderResult<usize> {
        let remaining = self.block.size - self.cursor;
        if bytes.len() > remaining {
            log::error!(
                "Staging buffer full: requested {} bytes, {} remaining",
                bytes.len(),
                remaining
            );
            return Err(RenderError::ArenaExhausted {
                requested: bytes.len(),
                remaining,
            });
        }

        let offset = self.cursor;
        let start = self.block.offset + offset;
        arena.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        Ok(offset)
    }

    pub fn push<T: Pod>(&mut self, arena: &mut Arena, value: &T) -> RenderResult<usize> {
        self.push_bytes(arena, bytemuck::bytes_of(value))
    }

    /// Bytes written since the last [`clear`](Self::clear).
    pub fn contents<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        let start = self.block.offset;
        &arena.storage[start..start + self.cursor]
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn capacity(&self) -> usize {
        self.block.size
    }

    pub fn block(&self) -> ArenaBlock {
        self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut arena = Arena::new(256, 64).unwrap();
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(70).unwrap();
        let c = arena.allocate(1).unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 64);
        assert_eq!(c.offset, 192);
        assert!(a.end() <= b.offset && b.end() <= c.offset);
    }

    #[test]
    fn exhausted_arena_reports_remaining() {
        let mut arena = Arena::new(100, 16).unwrap();
        arena.allocate(90).unwrap();
        let err = arena.allocate(8).unwrap_err();
        assert!(matches!(
            err,
            RenderError::ArenaExhausted {
                requested: 8,
                remaining: 4
            }
        ));
        arena.reset();
        assert_eq!(arena.allocate(100).unwrap().offset, 0);
    }

    #[test]
    fn rejects_bad_alignment() {
        assert!(matches!(
            Arena::new(64, 3),
            Err(RenderError::InvalidAlignment(3))
        ));
    }

    #[test]
    fn required_capacity_accounts_for_padding() {
        assert_eq!(Arena::required_capacity(&[10, 70, 1], 64), 193);
        assert_eq!(Arena::required_capacity(&[], 64), 0);
    }

    #[test]
    fn staging_buffer_appends_and_clears() {
        let mut arena = Arena::new(128, 8).unwrap();
        arena.allocate(3).unwrap();
        let mut staging = StagingBuffer::new(arena.allocate(16).unwrap());

        assert_eq!(staging.push(&mut arena, &7u32).unwrap(), 0);
        assert_eq!(staging.push_bytes(&mut arena, &[1, 2]).unwrap(), 4);
        assert_eq!(staging.contents(&arena), &[7, 0, 0, 0, 1, 2]);

        assert!(staging.push_bytes(&mut arena, &[0; 11]).is_err());
        assert_eq!(staging.len(), 6);

        staging.clear();
        assert!(staging.is_empty());
        assert!(staging.contents(&arena).is_empty());
    }
}
