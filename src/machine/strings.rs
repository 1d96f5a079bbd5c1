//! Cell string packing and UTF-8 helpers.
//!
//! Scripts keep strings in cell arrays in one of two forms:
//! - unpacked: one character per cell, terminated by a zero cell
//! - packed: bytes stored most significant byte first inside each cell,
//!   terminated by a zero byte
//!
//! A string is packed when its first cell exceeds [`UNPACKED_MAX`]. Host
//! strings travel as UTF-8 bytes in packed form and as one Unicode scalar per
//! cell in unpacked form.

use super::cell::{CELL_SIZE, Cell, UCell, UNPACKED_MAX};
use super::errors::AmxError;

/// Whether `cells` holds a packed string.
pub fn is_packed(cells: &[Cell]) -> bool {
    cells.first().is_some_and(|&c| c as UCell > UNPACKED_MAX)
}

/// Byte `index` of a packed string.
pub fn packed_byte(cells: &[Cell], index: usize) -> u8 {
    let cell = cells[index / CELL_SIZE] as UCell;
    let shift = (CELL_SIZE - 1 - index % CELL_SIZE) * 8;
    (cell >> shift) as u8
}

fn set_packed_byte(cells: &mut [Cell], index: usize, byte: u8) {
    let shift = (CELL_SIZE - 1 - index % CELL_SIZE) * 8;
    let slot = &mut cells[index / CELL_SIZE];
    let mask: UCell = !((0xff as UCell) << shift);
    *slot = ((*slot as UCell & mask) | ((byte as UCell) << shift)) as Cell;
}

/// Character `index` of a string in either form.
fn char_at(cells: &[Cell], packed: bool, index: usize) -> Cell {
    if packed {
        packed_byte(cells, index) as Cell
    } else {
        cells[index]
    }
}

/// Length of a string in characters, excluding the terminator.
///
/// A string that runs to the end of `cells` without a terminator has the
/// length of everything it covers.
pub fn str_len(cells: &[Cell]) -> usize {
    if is_packed(cells) {
        let bytes = cells.len() * CELL_SIZE;
        (0..bytes)
            .find(|&i| packed_byte(cells, i) == 0)
            .unwrap_or(bytes)
    } else {
        cells.iter().position(|&c| c == 0).unwrap_or(cells.len())
    }
}

/// Packs `len` characters of `src` into `dest`, starting `offset` bytes into
/// `dest`, and zero terminates the result.
///
/// `src` may be packed or unpacked; unpacked characters are truncated to
/// their low byte. Bytes of `dest` before `offset` are kept, and the rest of
/// the last written cell is cleared.
pub fn pack(dest: &mut [Cell], src: &[Cell], len: usize, offset: usize) -> Result<(), AmxError> {
    let packed = is_packed(src);
    let src_chars = if packed { src.len() * CELL_SIZE } else { src.len() };
    if len > src_chars {
        return Err(AmxError::Params);
    }
    let end = offset + len;
    let cells = end / CELL_SIZE + 1;
    if cells > dest.len() {
        return Err(AmxError::Params);
    }
    let chars: Vec<u8> = (0..len)
        .map(|i| char_at(src, packed, i) as u8)
        .collect();
    for (i, byte) in chars.into_iter().enumerate() {
        set_packed_byte(dest, offset + i, byte);
    }
    for i in end..cells * CELL_SIZE {
        set_packed_byte(dest, i, 0);
    }
    Ok(())
}

/// Unpacks `len` characters of `src` into `dest`, one per cell, zero
/// terminated.
pub fn unpack(dest: &mut [Cell], src: &[Cell], len: usize) -> Result<(), AmxError> {
    if dest.len() <= len {
        return Err(AmxError::Params);
    }
    let packed = is_packed(src);
    let available = if packed { src.len() * CELL_SIZE } else { src.len() };
    if len > available {
        return Err(AmxError::Params);
    }
    for (i, slot) in dest.iter_mut().take(len).enumerate() {
        *slot = char_at(src, packed, i);
    }
    dest[len] = 0;
    Ok(())
}

/// Unpacks a packed string within its own buffer.
///
/// Works from the last character down, so each byte is read before the cell
/// holding it is overwritten. An unpacked string is left as is.
pub fn unpack_in_place(cells: &mut [Cell], len: usize) -> Result<(), AmxError> {
    if cells.len() <= len {
        return Err(AmxError::Params);
    }
    if is_packed(cells) {
        for i in (0..len).rev() {
            cells[i] = packed_byte(cells, i) as Cell;
        }
    }
    cells[len] = 0;
    Ok(())
}

/// Stores a host string in `dest`, using at most `size` cells including the
/// terminator. Longer strings are truncated.
pub fn set_string(dest: &mut [Cell], src: &str, pack: bool, size: usize) -> Result<(), AmxError> {
    let size = size.min(dest.len());
    if size == 0 {
        return Err(AmxError::Params);
    }
    if pack {
        let bytes = src.as_bytes();
        let len = bytes.len().min(size * CELL_SIZE - 1);
        let last = len / CELL_SIZE;
        dest[last] = 0;
        for (i, &byte) in bytes[..len].iter().enumerate() {
            set_packed_byte(dest, i, byte);
        }
    } else {
        let mut len = 0;
        for (slot, ch) in dest.iter_mut().zip(src.chars()).take(size - 1) {
            *slot = ch as u32 as Cell;
            len += 1;
        }
        dest[len] = 0;
    }
    Ok(())
}

/// Reads a string from `src`, at most `max_chars` characters.
///
/// Packed strings are decoded as UTF-8; invalid sequences and unpacked cells
/// that are not Unicode scalars become U+FFFD.
pub fn get_string(src: &[Cell], max_chars: usize) -> String {
    let len = str_len(src).min(max_chars);
    if is_packed(src) {
        let bytes: Vec<u8> = (0..len).map(|i| packed_byte(src, i)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        src[..len]
            .iter()
            .map(|&c| {
                u32::try_from(c)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect()
    }
}

// =========================
// UTF-8
// =========================

const UTF8_COUNT: [usize; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3, 4];
const UTF8_LOWMARK: [i64; 5] = [0x80, 0x800, 0x10000, 0x200000, 0x4000000];

fn is_reserved(value: i64) -> bool {
    (0xd800..=0xdfff).contains(&value) || value == 0xfffe || value == 0xffff
}

/// Decodes one character from the start of `bytes`.
///
/// Accepts the original UTF-8 definition with sequences of up to six bytes,
/// but rejects overlong forms, surrogates and U+FFFE/U+FFFF. Returns the
/// character and the number of bytes consumed.
pub fn utf8_get(bytes: &[u8]) -> Result<(Cell, usize), AmxError> {
    let &lead = bytes.first().ok_or(AmxError::Params)?;
    if lead < 0x80 {
        return Ok((lead as Cell, 1));
    }
    if !(0xc0..0xfe).contains(&lead) {
        return Err(AmxError::Params);
    }
    let followup = UTF8_COUNT[((lead >> 2) & 0x0f) as usize];
    let mut result = (lead & (0x1f >> followup)) as i64;
    let tail = bytes.get(1..followup + 2).ok_or(AmxError::Params)?;
    for &byte in tail {
        if byte & 0xc0 != 0x80 {
            return Err(AmxError::Params);
        }
        result = (result << 6) | (byte & 0x3f) as i64;
    }
    if result < UTF8_LOWMARK[followup] || is_reserved(result) {
        return Err(AmxError::Params);
    }
    Cell::try_from(result)
        .map(|value| (value, followup + 2))
        .map_err(|_| AmxError::Params)
}

/// Encodes `value` at the start of `dest`; returns the number of bytes
/// written. Nothing is written when `dest` is too short.
pub fn utf8_put(dest: &mut [u8], value: Cell) -> Result<usize, AmxError> {
    let value = value as i64;
    if !(0..=0x7fff_ffff).contains(&value) {
        return Err(AmxError::Params);
    }
    let (len, lead): (usize, u8) = match value {
        0..0x80 => (1, 0),
        0x80..0x800 => (2, 0xc0),
        0x800..0x10000 => (3, 0xe0),
        0x10000..0x200000 => (4, 0xf0),
        0x200000..0x4000000 => (5, 0xf8),
        _ => (6, 0xfc),
    };
    if dest.len() < len || (len == 3 && is_reserved(value)) {
        return Err(AmxError::Params);
    }
    if len == 1 {
        dest[0] = value as u8;
        return Ok(1);
    }
    for i in (1..len).rev() {
        dest[i] = 0x80 | ((value >> (6 * (len - 1 - i))) & 0x3f) as u8;
    }
    dest[0] = lead | (value >> (6 * (len - 1))) as u8;
    Ok(len)
}

/// Validates a UTF-8 byte string up to its first zero byte and returns the
/// number of characters.
pub fn utf8_check(bytes: &[u8]) -> Result<usize, AmxError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let mut rest = &bytes[..end];
    let mut count = 0;
    while !rest.is_empty() {
        let (_, used) = utf8_get(rest)?;
        rest = &rest[used..];
        count += 1;
    }
    Ok(count)
}

/// Number of bytes the string in `cells` takes in UTF-8, excluding the
/// terminator. Packed strings are already bytes and report their length.
pub fn utf8_len(cells: &[Cell]) -> Result<usize, AmxError> {
    let len = str_len(cells);
    if is_packed(cells) {
        return Ok(len);
    }
    let mut buffer = [0u8; 6];
    cells[..len]
        .iter()
        .map(|&c| utf8_put(&mut buffer, c))
        .sum()
}
