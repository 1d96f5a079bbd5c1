//! Cell width and the format constants that depend on it.
//!
//! A cell is the machine word: registers, stack slots, data words and
//! instruction operands are all one cell wide. The width is fixed at build
//! time by the `cell16` / `cell64` features and defaults to 32 bits.

#[cfg(all(feature = "cell16", feature = "cell64"))]
compile_error!("features `cell16` and `cell64` are mutually exclusive");

#[cfg(feature = "cell16")]
mod width {
    pub type Cell = i16;
    pub type UCell = u16;
    pub const MAGIC: u16 = 0xf1e2;
}

#[cfg(feature = "cell64")]
mod width {
    pub type Cell = i64;
    pub type UCell = u64;
    pub const MAGIC: u16 = 0xf1e1;
}

#[cfg(not(any(feature = "cell16", feature = "cell64")))]
mod width {
    pub type Cell = i32;
    pub type UCell = u32;
    pub const MAGIC: u16 = 0xf1e0;
}

/// Signed machine word.
pub type Cell = width::Cell;
/// Unsigned machine word.
pub type UCell = width::UCell;

/// Image magic for the configured cell width.
pub const MAGIC: u16 = width::MAGIC;

/// Cell width in bytes.
pub const CELL_SIZE: usize = std::mem::size_of::<Cell>();
/// Cell width in bits.
pub const CELL_BITS: u32 = Cell::BITS;
/// [`CELL_SIZE`] as a cell, for address arithmetic.
pub const CELL: Cell = CELL_SIZE as Cell;

/// Highest file version this machine reads.
pub const CUR_FILE_VERSION: u8 = 11;
/// Lowest engine version an image may require.
pub const MIN_AMX_VERSION: u8 = 11;
/// Size of one table record (address + name offset).
pub const DEFSIZE: i16 = 8;

/// Longest public, native or variable name, excluding the terminator.
pub const NAME_MAX: usize = 31;
/// Number of user-data slots per context.
pub const USERNUM: usize = 4;

/// Space kept free between heap top and stack top.
pub const STKMARGIN: Cell = 16 * CELL;

/// A first cell above this value marks a packed string.
pub const UNPACKED_MAX: UCell = (1 << (CELL_BITS - 8)) - 1;

/// Bit shift for the packed parameter.
pub const PACKED_SHIFT: u32 = CELL_BITS / 2;
/// Opcode bits in an instruction cell; the upper half is a packed parameter.
pub const OPCODE_MASK: Cell = (1 << PACKED_SHIFT) - 1;

/// Shift separating return offset and overlay index in an overlay return word.
pub const OVERLAY_SHIFT: u32 = CELL_BITS / 2;
/// Mask for the overlay index half of an overlay return word.
pub const OVERLAY_MASK: UCell = UCell::MAX >> OVERLAY_SHIFT;

/// Reads a little-endian cell from `bytes`.
#[inline]
pub fn cell_from_le(bytes: &[u8]) -> Option<Cell> {
    let raw: [u8; CELL_SIZE] = bytes.get(..CELL_SIZE)?.try_into().ok()?;
    Some(Cell::from_le_bytes(raw))
}

/// Splits an instruction cell into its opcode and packed parameter.
#[inline]
pub fn split_opcode(word: Cell) -> (Cell, Cell) {
    (word & OPCODE_MASK, word >> PACKED_SHIFT)
}

/// Packs an opcode and a parameter into one instruction cell.
#[inline]
pub fn join_opcode(opcode: Cell, param: Cell) -> Cell {
    (opcode & OPCODE_MASK) | param.wrapping_shl(PACKED_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_parameter_keeps_sign() {
        let word = join_opcode(124, -3);
        assert_eq!(split_opcode(word), (124, -3));
        assert_eq!(split_opcode(67), (67, 0));
    }

    #[test]
    fn unpacked_max_leaves_one_byte() {
        assert_eq!(UNPACKED_MAX.leading_zeros(), 8);
    }

    #[test]
    fn overlay_mask_covers_lower_half() {
        assert_eq!(OVERLAY_MASK.count_ones(), CELL_BITS / 2);
    }

    #[test]
    fn cell_from_le_rejects_short_input() {
        assert_eq!(cell_from_le(&[1]), None);
        let bytes = 7 as Cell;
        assert_eq!(cell_from_le(&bytes.to_le_bytes()), Some(7));
    }
}
