use super::cell::{CELL_SIZE, Cell, cell_from_le};
use super::errors::AmxError;
use bytes::Bytes;

/// Data segment of one context: globals, heap and stack.
///
/// Addresses are byte offsets from the start of the segment. Every access is
/// bounds-checked against the segment and reports MEMACCESS when it falls
/// outside; the finer stack/heap gap checks are done by the interpreter.
/// Cells are stored little-endian.
#[derive(Clone)]
pub(crate) struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    /// Allocates `size` bytes and copies the initial globals to the start.
    pub(crate) fn new(size: usize, initial: &[u8]) -> Self {
        let mut bytes = vec![0u8; size.max(initial.len())];
        bytes[..initial.len()].copy_from_slice(initial);
        Self { bytes }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, addr: Cell, len: usize) -> Result<std::ops::Range<usize>, AmxError> {
        let start = usize::try_from(addr).map_err(|_| AmxError::MemAccess)?;
        let end = start.checked_add(len).ok_or(AmxError::MemAccess)?;
        if end > self.bytes.len() {
            return Err(AmxError::MemAccess);
        }
        Ok(start..end)
    }

    pub(crate) fn read_cell(&self, addr: Cell) -> Result<Cell, AmxError> {
        let range = self.range(addr, CELL_SIZE)?;
        cell_from_le(&self.bytes[range]).ok_or(AmxError::MemAccess)
    }

    pub(crate) fn write_cell(&mut self, addr: Cell, value: Cell) -> Result<(), AmxError> {
        let range = self.range(addr, CELL_SIZE)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Reads a 1, 2 or 4 byte unsigned value.
    pub(crate) fn read_sized(&self, addr: Cell, width: usize) -> Result<u32, AmxError> {
        let range = self.range(addr, width)?;
        let bytes = &self.bytes[range];
        Ok(match width {
            1 => bytes[0] as u32,
            2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            _ => return Err(AmxError::InvInstr),
        })
    }

    /// Writes the low 1, 2 or 4 bytes of `value`.
    pub(crate) fn write_sized(&mut self, addr: Cell, width: usize, value: u32) -> Result<(), AmxError> {
        let range = self.range(addr, width)?;
        let bytes = value.to_le_bytes();
        self.bytes[range].copy_from_slice(&bytes[..width]);
        Ok(())
    }

    pub(crate) fn slice(&self, addr: Cell, len: usize) -> Result<&[u8], AmxError> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    pub(crate) fn slice_mut(&mut self, addr: Cell, len: usize) -> Result<&mut [u8], AmxError> {
        let range = self.range(addr, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Reads `count` consecutive cells.
    pub(crate) fn read_cells(&self, addr: Cell, count: usize) -> Result<Vec<Cell>, AmxError> {
        let len = count.checked_mul(CELL_SIZE).ok_or(AmxError::MemAccess)?;
        Ok(self
            .slice(addr, len)?
            .chunks_exact(CELL_SIZE)
            .filter_map(cell_from_le)
            .collect())
    }

    pub(crate) fn write_cells(&mut self, addr: Cell, cells: &[Cell]) -> Result<(), AmxError> {
        let dest = self.slice_mut(addr, cells.len() * CELL_SIZE)?;
        for (chunk, cell) in dest.chunks_exact_mut(CELL_SIZE).zip(cells) {
            chunk.copy_from_slice(&cell.to_le_bytes());
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dest`; the ranges may overlap.
    pub(crate) fn copy_within(&mut self, src: Cell, dest: Cell, len: usize) -> Result<(), AmxError> {
        let from = self.range(src, len)?;
        let to = self.range(dest, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    /// Copies `len` bytes of `other` starting at 0 into this segment.
    pub(crate) fn copy_prefix_from(&mut self, other: &Memory, len: usize) {
        let len = len.min(self.bytes.len()).min(other.bytes.len());
        self.bytes[..len].copy_from_slice(&other.bytes[..len]);
    }
}

/// Code currently resident in a context.
///
/// Starts out shared with the image. The first in-place patch takes a
/// private copy so other contexts and the image never see the change.
#[derive(Clone)]
pub(crate) enum CodeBuffer {
    Shared(Bytes),
    Private(Vec<u8>),
}

impl CodeBuffer {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            CodeBuffer::Shared(bytes) => bytes,
            CodeBuffer::Private(bytes) => bytes,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Reads the code cell at `addr`; MEMACCESS outside the buffer.
    pub(crate) fn read_cell(&self, addr: Cell) -> Result<Cell, AmxError> {
        let at = usize::try_from(addr).map_err(|_| AmxError::MemAccess)?;
        self.as_slice()
            .get(at..)
            .and_then(cell_from_le)
            .ok_or(AmxError::MemAccess)
    }

    /// Overwrites the code cell at `addr`, copying shared code first.
    pub(crate) fn patch(&mut self, addr: Cell, value: Cell) -> Result<(), AmxError> {
        let at = usize::try_from(addr).map_err(|_| AmxError::MemAccess)?;
        if at + CELL_SIZE > self.len() {
            return Err(AmxError::MemAccess);
        }
        if let CodeBuffer::Shared(bytes) = self {
            *self = CodeBuffer::Private(bytes.to_vec());
        }
        if let CodeBuffer::Private(bytes) = self {
            bytes[at..at + CELL_SIZE].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    pub(crate) fn is_private(&self) -> bool {
        matches!(self, CodeBuffer::Private(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::cell::CELL;

    #[test]
    fn cells_round_trip_little_endian() {
        let mut mem = Memory::new(4 * CELL_SIZE, &[]);
        mem.write_cell(CELL, 0x1234).unwrap();
        assert_eq!(mem.read_cell(CELL).unwrap(), 0x1234);
        assert_eq!(mem.read_sized(CELL, 1).unwrap(), 0x34);
        assert_eq!(mem.read_sized(CELL, 2).unwrap(), 0x1234);
    }

    #[test]
    fn out_of_range_is_memaccess() {
        let mut mem = Memory::new(2 * CELL_SIZE, &[]);
        assert_eq!(mem.read_cell(2 * CELL), Err(AmxError::MemAccess));
        assert_eq!(mem.read_cell(-CELL), Err(AmxError::MemAccess));
        assert_eq!(mem.write_cell(CELL + 1, 0), Err(AmxError::MemAccess));
        assert_eq!(mem.copy_within(0, CELL, 2 * CELL_SIZE), Err(AmxError::MemAccess));
    }

    #[test]
    fn initial_data_copied() {
        let mem = Memory::new(8, &[1, 2, 3]);
        assert_eq!(mem.slice(0, 4).unwrap(), &[1, 2, 3, 0]);
    }

    #[test]
    fn patch_copies_shared_code() {
        let shared = Bytes::from(vec![0u8; 2 * CELL_SIZE]);
        let mut code = CodeBuffer::Shared(shared.clone());
        code.patch(CELL, 9).unwrap();
        assert!(code.is_private());
        assert_eq!(code.read_cell(CELL).unwrap(), 9);
        assert!(shared.iter().all(|&b| b == 0));
        assert_eq!(code.patch(2 * CELL, 1), Err(AmxError::MemAccess));
    }
}
