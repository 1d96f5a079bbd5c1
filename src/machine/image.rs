//! Binary program image: header, tables, code and initial data.
//!
//! An [`Image`] is immutable once parsed and cheap to clone; every
//! [`Machine`](super::vm::Machine) created from it shares the same buffer.
//!
//! # Layout
//!
//! ```text
//! [header][publics][natives][libraries][pubvars][tags][overlays][name table][code][data]
//! ```
//!
//! Multi-byte fields are little-endian on disk. [`parse_header`] takes the
//! byte order explicitly so the decoding never depends on the host.

use super::cell::{
    CELL_SIZE, CUR_FILE_VERSION, Cell, DEFSIZE, MAGIC, MIN_AMX_VERSION, NAME_MAX, UCell,
};
use super::errors::AmxError;
use bytes::Bytes;
use cellvm_derive::Layout;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;

/// Byte order of multi-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// A fixed-width integer that can appear in an on-disk record.
pub trait Field: Sized {
    const SIZE: usize;

    /// Reads the field at `*at`, advancing `at` past it.
    fn read(bytes: &[u8], at: &mut usize, order: ByteOrder) -> Option<Self>;

    fn write(&self, out: &mut Vec<u8>, order: ByteOrder);
}

macro_rules! impl_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Field for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn read(bytes: &[u8], at: &mut usize, order: ByteOrder) -> Option<Self> {
                    let end = at.checked_add(Self::SIZE)?;
                    let raw: [u8; std::mem::size_of::<$ty>()] = bytes.get(*at..end)?.try_into().ok()?;
                    *at = end;
                    Some(match order {
                        ByteOrder::Little => <$ty>::from_le_bytes(raw),
                        ByteOrder::Big => <$ty>::from_be_bytes(raw),
                    })
                }

                fn write(&self, out: &mut Vec<u8>, order: ByteOrder) {
                    match order {
                        ByteOrder::Little => out.extend_from_slice(&self.to_le_bytes()),
                        ByteOrder::Big => out.extend_from_slice(&self.to_be_bytes()),
                    }
                }
            }
        )*
    };
}

impl_field!(u8, u16, i16, u32, i32);

/// A packed on-disk record made of [`Field`]s. Derive it with
/// `#[derive(Layout)]`.
pub trait Layout: Sized {
    const SIZE: usize;

    fn read(bytes: &[u8], order: ByteOrder) -> Option<Self>;

    fn write(&self, out: &mut Vec<u8>, order: ByteOrder);
}

/// Image header, as stored at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Layout)]
pub struct Header {
    /// Size of the file image.
    pub size: i32,
    pub magic: u16,
    pub file_version: u8,
    /// Minimum machine version required.
    pub amx_version: u8,
    pub flags: i16,
    /// Table record stride.
    pub defsize: i16,
    /// Code segment start.
    pub cod: i32,
    /// Data segment start.
    pub dat: i32,
    /// Initial heap top.
    pub hea: i32,
    /// Stack top; the total memory requirement.
    pub stp: i32,
    /// Entry point of `main`, or -1.
    pub cip: i32,
    pub publics: i32,
    pub natives: i32,
    pub libraries: i32,
    pub pubvars: i32,
    pub tags: i32,
    pub nametable: i32,
    pub overlays: i32,
}

/// Size of the header on disk.
pub const HEADER_SIZE: usize = <Header as Layout>::SIZE;

/// Table record: an address (or id) and the file offset of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Layout)]
pub struct FuncStub {
    pub address: u32,
    pub nameofs: u32,
}

/// Overlay table record; `offset` is relative to the code segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Layout)]
pub struct OverlayRecord {
    pub offset: i32,
    pub size: i32,
}

/// Decodes the header from the start of `bytes`.
pub fn parse_header(bytes: &[u8], order: ByteOrder) -> Result<Header, AmxError> {
    Header::read(bytes, order).ok_or(AmxError::Format)
}

/// Header and context flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u16);

impl Flags {
    /// All function calls use overlays.
    pub const OVERLAY: Flags = Flags(0x01);
    /// Symbolic information available.
    pub const DEBUG: Flags = Flags(0x02);
    /// No array bounds checking, no BREAK opcodes.
    pub const NOCHECKS: Flags = Flags(0x04);
    /// Script may suspend.
    pub const SLEEP: Flags = Flags(0x08);
    /// File is encrypted.
    pub const CRYPT: Flags = Flags(0x10);
    /// Data section is explicitly initialized.
    pub const DSEG_INIT: Flags = Flags(0x20);
    /// Script uses SYSREQ_N.
    pub const SYSREQN: Flags = Flags(0x800);
    /// All natives are registered.
    pub const NTVREG: Flags = Flags(0x1000);
    /// Executed by a compiling backend.
    pub const JITC: Flags = Flags(0x2000);
    /// Verification in progress.
    pub const VERIFY: Flags = Flags(0x4000);
    /// Context is initialized.
    pub const INIT: Flags = Flags(0x8000);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Flags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 11] = [
            (Flags::OVERLAY, "OVERLAY"),
            (Flags::DEBUG, "DEBUG"),
            (Flags::NOCHECKS, "NOCHECKS"),
            (Flags::SLEEP, "SLEEP"),
            (Flags::CRYPT, "CRYPT"),
            (Flags::DSEG_INIT, "DSEG_INIT"),
            (Flags::SYSREQN, "SYSREQN"),
            (Flags::NTVREG, "NTVREG"),
            (Flags::JITC, "JITC"),
            (Flags::VERIFY, "VERIFY"),
            (Flags::INIT, "INIT"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({:#06x}: {})", self.0, set.join(" | "))
    }
}

/// The name tables of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Publics,
    Natives,
    Libraries,
    Pubvars,
    Tags,
}

/// A resolved table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub name: &'a str,
    /// Code address for publics, data address for variables, id for tags.
    pub address: UCell,
}

/// A parsed, validated program image.
#[derive(Clone)]
pub struct Image {
    bytes: Bytes,
    header: Header,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("len", &self.bytes.len())
            .field("header", &self.header)
            .finish()
    }
}

impl Image {
    /// Parses and validates an image held in memory.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, AmxError> {
        let bytes = bytes.into();
        let header = parse_header(&bytes, ByteOrder::Little)?;

        if header.magic != MAGIC {
            return Err(AmxError::Format);
        }
        if header.file_version > CUR_FILE_VERSION || header.amx_version < MIN_AMX_VERSION {
            return Err(AmxError::Version);
        }
        if header.defsize != DEFSIZE {
            return Err(AmxError::Format);
        }
        let mut at = usize::try_from(header.nametable).map_err(|_| AmxError::Format)?;
        let name_length = u16::read(&bytes, &mut at, ByteOrder::Little).ok_or(AmxError::Format)?;
        if name_length as usize > NAME_MAX {
            return Err(AmxError::Format);
        }
        if header.stp <= 0 {
            return Err(AmxError::Format);
        }
        check_segments(&header, bytes.len())?;

        Ok(Self { bytes, header })
    }

    /// Reads and parses an image file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AmxError> {
        let data = std::fs::read(path.as_ref()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AmxError::NotFound,
            _ => AmxError::Format,
        })?;
        Self::from_bytes(data)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The raw image buffer.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Header flags.
    pub fn flags(&self) -> Flags {
        Flags::from_bits(self.header.flags as u16)
    }

    pub fn has_overlays(&self) -> bool {
        self.flags().contains(Flags::OVERLAY)
    }

    /// The whole code segment, sharing the image buffer.
    pub fn code(&self) -> Bytes {
        self.bytes
            .slice(self.header.cod as usize..self.header.dat as usize)
    }

    pub fn code_size(&self) -> usize {
        (self.header.dat - self.header.cod) as usize
    }

    /// Initial contents of the global data area.
    pub fn initial_data(&self) -> &[u8] {
        &self.bytes[self.header.dat as usize..self.header.hea as usize]
    }

    /// Size of the global data area in bytes.
    pub fn data_size(&self) -> usize {
        (self.header.hea - self.header.dat) as usize
    }

    /// Combined size of stack and heap in bytes.
    pub fn stack_heap_size(&self) -> usize {
        (self.header.stp - self.header.hea) as usize
    }

    /// Total memory a context needs: data, heap and stack.
    pub fn memory_size(&self) -> usize {
        (self.header.stp - self.header.dat) as usize
    }

    /// Longest name stored in the name table.
    pub fn name_length(&self) -> usize {
        let mut at = self.header.nametable as usize;
        u16::read(&self.bytes, &mut at, ByteOrder::Little).unwrap_or(0) as usize
    }

    fn table_bounds(&self, table: Table) -> (usize, usize) {
        let h = &self.header;
        let (start, end) = match table {
            Table::Publics => (h.publics, h.natives),
            Table::Natives => (h.natives, h.libraries),
            Table::Libraries => (h.libraries, h.pubvars),
            Table::Pubvars => (h.pubvars, h.tags),
            Table::Tags => (h.tags, h.overlays),
        };
        (start as usize, end as usize)
    }

    /// Number of records in a table.
    pub fn count(&self, table: Table) -> usize {
        let (start, end) = self.table_bounds(table);
        (end - start) / DEFSIZE as usize
    }

    /// Raw record `index` of a table; INDEX when out of range.
    pub fn stub(&self, table: Table, index: usize) -> Result<FuncStub, AmxError> {
        if index >= self.count(table) {
            return Err(AmxError::Index);
        }
        let (start, _) = self.table_bounds(table);
        let at = start + index * DEFSIZE as usize;
        FuncStub::read(&self.bytes[at..], ByteOrder::Little).ok_or(AmxError::Format)
    }

    /// Record `index` of a table with its name resolved.
    pub fn entry(&self, table: Table, index: usize) -> Result<Entry<'_>, AmxError> {
        let stub = self.stub(table, index)?;
        Ok(Entry {
            name: self.name_at(stub.nameofs as usize)?,
            address: stub.address as UCell,
        })
    }

    /// NUL-terminated name at a file offset.
    fn name_at(&self, offset: usize) -> Result<&str, AmxError> {
        let tail = self.bytes.get(offset..).ok_or(AmxError::Format)?;
        let len = tail
            .iter()
            .take(NAME_MAX + 1)
            .position(|&b| b == 0)
            .ok_or(AmxError::Format)?;
        std::str::from_utf8(&tail[..len]).map_err(|_| AmxError::Format)
    }

    /// Binary search over a name-sorted table.
    fn search_by_name(&self, table: Table, name: &str) -> Result<usize, AmxError> {
        let (mut low, mut high) = (0usize, self.count(table));
        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.entry(table, mid)?;
            match entry.name.as_bytes().cmp(name.as_bytes()) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(AmxError::NotFound)
    }

    pub fn num_publics(&self) -> usize {
        self.count(Table::Publics)
    }

    pub fn public(&self, index: usize) -> Result<Entry<'_>, AmxError> {
        self.entry(Table::Publics, index)
    }

    /// Index of a public function; NOTFOUND if absent.
    pub fn find_public(&self, name: &str) -> Result<usize, AmxError> {
        self.search_by_name(Table::Publics, name)
    }

    pub fn num_natives(&self) -> usize {
        self.count(Table::Natives)
    }

    pub fn native_name(&self, index: usize) -> Result<&str, AmxError> {
        Ok(self.entry(Table::Natives, index)?.name)
    }

    /// Index of a native by name. The native table is in call order, not
    /// sorted, so this is a linear scan.
    pub fn find_native(&self, name: &str) -> Result<usize, AmxError> {
        for index in 0..self.num_natives() {
            if self.native_name(index)? == name {
                return Ok(index);
            }
        }
        Err(AmxError::NotFound)
    }

    pub fn num_libraries(&self) -> usize {
        self.count(Table::Libraries)
    }

    pub fn num_pubvars(&self) -> usize {
        self.count(Table::Pubvars)
    }

    pub fn pubvar(&self, index: usize) -> Result<Entry<'_>, AmxError> {
        self.entry(Table::Pubvars, index)
    }

    /// Index of a public variable; NOTFOUND if absent.
    pub fn find_pubvar(&self, name: &str) -> Result<usize, AmxError> {
        self.search_by_name(Table::Pubvars, name)
    }

    pub fn num_tags(&self) -> usize {
        self.count(Table::Tags)
    }

    pub fn tag(&self, index: usize) -> Result<Entry<'_>, AmxError> {
        self.entry(Table::Tags, index)
    }

    /// Name of the tag with the given id. Tags are sorted by id.
    pub fn find_tag_id(&self, id: Cell) -> Result<&str, AmxError> {
        let (mut low, mut high) = (0usize, self.num_tags());
        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.tag(mid)?;
            match (entry.address as Cell).cmp(&id) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(entry.name),
            }
        }
        Err(AmxError::NotFound)
    }

    pub fn num_overlays(&self) -> usize {
        (self.header.nametable - self.header.overlays) as usize / OverlayRecord::SIZE
    }

    /// Overlay record `index`; OVERLAY when out of range.
    pub fn overlay(&self, index: usize) -> Result<OverlayRecord, AmxError> {
        if index >= self.num_overlays() {
            return Err(AmxError::Overlay);
        }
        let at = self.header.overlays as usize + index * OverlayRecord::SIZE;
        OverlayRecord::read(&self.bytes[at..], ByteOrder::Little).ok_or(AmxError::Format)
    }

    /// Code of overlay `index`, sharing the image buffer.
    pub fn overlay_code(&self, index: Cell) -> Result<Bytes, AmxError> {
        let index = usize::try_from(index).map_err(|_| AmxError::Overlay)?;
        let record = self.overlay(index)?;
        let start = usize::try_from(record.offset).map_err(|_| AmxError::Overlay)?;
        let size = usize::try_from(record.size).map_err(|_| AmxError::Overlay)?;
        let end = start.checked_add(size).ok_or(AmxError::Overlay)?;
        if end > self.code_size() || size % CELL_SIZE != 0 {
            return Err(AmxError::Overlay);
        }
        let cod = self.header.cod as usize;
        Ok(self.bytes.slice(cod + start..cod + end))
    }
}

/// Checks that tables and segments are ordered, aligned and inside the buffer.
fn check_segments(h: &Header, len: usize) -> Result<(), AmxError> {
    let order = [
        HEADER_SIZE as i64,
        h.publics as i64,
        h.natives as i64,
        h.libraries as i64,
        h.pubvars as i64,
        h.tags as i64,
        h.overlays as i64,
        h.nametable as i64,
    ];
    if order.windows(2).any(|w| w[0] > w[1]) {
        return Err(AmxError::Format);
    }
    let segments = [
        h.nametable as i64 + 2,
        h.cod as i64,
        h.dat as i64,
        h.hea as i64,
    ];
    if segments.windows(2).any(|w| w[0] > w[1]) || h.hea as i64 > len as i64 {
        return Err(AmxError::Format);
    }
    let cell = CELL_SIZE as i32;
    if (h.dat - h.cod) % cell != 0 || (h.hea - h.dat) % cell != 0 {
        return Err(AmxError::Format);
    }
    if h.stp < h.hea || (h.stp - h.dat) % cell != 0 || h.stp - h.dat < cell {
        return Err(AmxError::Format);
    }
    Ok(())
}
