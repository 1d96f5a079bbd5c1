//! Writes program images.
//!
//! Used by the assembler and by tests that need hand-built images.

use super::cell::{CELL_SIZE, CUR_FILE_VERSION, Cell, DEFSIZE, MAGIC, MIN_AMX_VERSION};
use super::image::{ByteOrder, Field, Flags, FuncStub, HEADER_SIZE, Header, Layout, OverlayRecord};

/// Default stack plus heap size, in cells.
pub const DEFAULT_STACK_CELLS: usize = 4096;

/// Builder for a complete image.
///
/// Publics and public variables are sorted by name and tags by id when the
/// image is written; natives keep their insertion order, which is the index
/// `SYSREQ` operands refer to.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    code: Vec<u8>,
    data: Vec<u8>,
    publics: Vec<(String, u32)>,
    natives: Vec<String>,
    libraries: Vec<String>,
    pubvars: Vec<(String, u32)>,
    tags: Vec<(String, u32)>,
    overlays: Vec<OverlayRecord>,
    stack_heap: usize,
    main: Option<Cell>,
    flags: Flags,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            data: Vec::new(),
            publics: Vec::new(),
            natives: Vec::new(),
            libraries: Vec::new(),
            pubvars: Vec::new(),
            tags: Vec::new(),
            overlays: Vec::new(),
            stack_heap: DEFAULT_STACK_CELLS * CELL_SIZE,
            main: None,
            flags: Flags::empty(),
        }
    }

    /// Appends code cells.
    pub fn code_cells(mut self, cells: &[Cell]) -> Self {
        for cell in cells {
            self.code.extend_from_slice(&cell.to_le_bytes());
        }
        self
    }

    /// Appends raw code bytes; the length must be a multiple of the cell size.
    pub fn code_bytes(mut self, bytes: &[u8]) -> Self {
        self.code.extend_from_slice(bytes);
        self
    }

    /// Current code size in bytes.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Appends initialized data cells.
    pub fn data_cells(mut self, cells: &[Cell]) -> Self {
        for cell in cells {
            self.data.extend_from_slice(&cell.to_le_bytes());
        }
        self
    }

    /// Current data size in bytes.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn public(mut self, name: impl Into<String>, address: u32) -> Self {
        self.publics.push((name.into(), address));
        self
    }

    /// Declares a native; its index is the number of natives declared before it.
    pub fn native(mut self, name: impl Into<String>) -> Self {
        self.natives.push(name.into());
        self
    }

    pub fn library(mut self, name: impl Into<String>) -> Self {
        self.libraries.push(name.into());
        self
    }

    pub fn pubvar(mut self, name: impl Into<String>, address: u32) -> Self {
        self.pubvars.push((name.into(), address));
        self
    }

    pub fn tag(mut self, name: impl Into<String>, id: u32) -> Self {
        self.tags.push((name.into(), id));
        self
    }

    /// Declares an overlay covering `size` bytes at `offset` in the code
    /// segment, and marks the image as an overlay image.
    pub fn overlay(mut self, offset: usize, size: usize) -> Self {
        self.overlays.push(OverlayRecord {
            offset: offset as i32,
            size: size as i32,
        });
        self.flags.insert(Flags::OVERLAY);
        self
    }

    /// Stack plus heap size in cells.
    pub fn stack_cells(mut self, cells: usize) -> Self {
        self.stack_heap = cells * CELL_SIZE;
        self
    }

    /// Entry point of `main` (code address, or overlay index in overlay images).
    pub fn main(mut self, cip: Cell) -> Self {
        self.main = Some(cip);
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags |= flags;
        self
    }

    /// Serializes the image.
    pub fn build(&self) -> Vec<u8> {
        let mut publics = self.publics.clone();
        publics.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let mut pubvars = self.pubvars.clone();
        pubvars.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let mut tags = self.tags.clone();
        tags.sort_by_key(|t| t.1);
        let natives: Vec<(String, u32)> = self.natives.iter().map(|n| (n.clone(), 0)).collect();
        let libraries: Vec<(String, u32)> =
            self.libraries.iter().map(|n| (n.clone(), 0)).collect();

        let record = DEFSIZE as usize;
        let off_publics = HEADER_SIZE;
        let off_natives = off_publics + publics.len() * record;
        let off_libraries = off_natives + natives.len() * record;
        let off_pubvars = off_libraries + libraries.len() * record;
        let off_tags = off_pubvars + pubvars.len() * record;
        let off_overlays = off_tags + tags.len() * record;
        let off_nametable = off_overlays + self.overlays.len() * OverlayRecord::SIZE;

        let tables = [&publics, &natives, &libraries, &pubvars, &tags];
        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        let mut longest = 0usize;
        let names_start = off_nametable + u16::SIZE;
        for table in tables {
            let mut offsets = Vec::with_capacity(table.len());
            for (name, _) in table.iter() {
                offsets.push((names_start + names.len()) as u32);
                names.extend_from_slice(name.as_bytes());
                names.push(0);
                longest = longest.max(name.len());
            }
            name_offsets.push(offsets);
        }

        let unaligned_cod = names_start + names.len();
        let cod = unaligned_cod.next_multiple_of(CELL_SIZE);
        let dat = cod + self.code.len();
        let hea = dat + self.data.len();
        let stp = hea + self.stack_heap;

        let header = Header {
            size: hea as i32,
            magic: MAGIC,
            file_version: CUR_FILE_VERSION,
            amx_version: MIN_AMX_VERSION,
            flags: self.flags.bits() as i16,
            defsize: DEFSIZE,
            cod: cod as i32,
            dat: dat as i32,
            hea: hea as i32,
            stp: stp as i32,
            cip: self.main.map_or(-1, |cip| cip as i32),
            publics: off_publics as i32,
            natives: off_natives as i32,
            libraries: off_libraries as i32,
            pubvars: off_pubvars as i32,
            tags: off_tags as i32,
            nametable: off_nametable as i32,
            overlays: off_overlays as i32,
        };

        let mut out = Vec::with_capacity(hea);
        header.write(&mut out, ByteOrder::Little);
        for (table, offsets) in tables.iter().zip(&name_offsets) {
            for ((_, address), nameofs) in table.iter().zip(offsets) {
                FuncStub {
                    address: *address,
                    nameofs: *nameofs,
                }
                .write(&mut out, ByteOrder::Little);
            }
        }
        for overlay in &self.overlays {
            overlay.write(&mut out, ByteOrder::Little);
        }
        (longest as u16).write(&mut out, ByteOrder::Little);
        out.extend_from_slice(&names);
        out.resize(cod, 0);
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::image::{Image, Table};

    #[test]
    fn empty_image_loads() {
        let bytes = ImageBuilder::new().code_cells(&[67, 0]).build();
        let image = Image::from_bytes(bytes).unwrap();
        assert_eq!(image.header().cip, -1);
        assert_eq!(image.code_size(), 2 * CELL_SIZE);
        assert_eq!(image.header().cod as usize % CELL_SIZE, 0);
        assert_eq!(image.stack_heap_size(), DEFAULT_STACK_CELLS * CELL_SIZE);
    }

    #[test]
    fn natives_keep_declaration_order() {
        let bytes = ImageBuilder::new()
            .code_cells(&[67, 0])
            .native("zeta")
            .native("alpha")
            .build();
        let image = Image::from_bytes(bytes).unwrap();
        assert_eq!(image.native_name(0).unwrap(), "zeta");
        assert_eq!(image.stub(Table::Natives, 1).unwrap().address, 0);
    }

    #[test]
    fn overlay_table_written() {
        let bytes = ImageBuilder::new()
            .code_cells(&[67, 0, 31, 0])
            .overlay(0, 2 * CELL_SIZE)
            .overlay(2 * CELL_SIZE, 2 * CELL_SIZE)
            .build();
        let image = Image::from_bytes(bytes).unwrap();
        assert!(image.has_overlays());
        assert_eq!(image.num_overlays(), 2);
        assert_eq!(image.overlay(1).unwrap().offset as usize, 2 * CELL_SIZE);
        assert_eq!(image.overlay_code(1).unwrap().len(), 2 * CELL_SIZE);
        assert!(image.overlay_code(2).is_err());
    }
}
