//! Script image header.
//!
//! Two on-disk layouts exist: the 64-bit PC layout with 8-byte pointer
//! slots, and the packed 32-bit console layout with big-endian fields.
//! Either may be wrapped in an RSC7 resource container, which shifts every
//! file offset by 0x10.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{DecompileError, Result};

const RSC7_MAGIC: &[u8; 4] = b"RSC7";
pub const PAGE_SIZE: usize = 0x4000;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], big_endian: bool) -> Self {
        Reader { data, pos: 0, big_endian }
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(DecompileError::TruncatedImage { context });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_i32(&mut self, context: &'static str) -> Result<i32> {
        let raw = self.take(4, context)?;
        Ok(if self.big_endian {
            BigEndian::read_i32(raw)
        } else {
            LittleEndian::read_i32(raw)
        })
    }

    /// File-relative pointer; the top byte carries segment flags.
    fn read_pointer(&mut self, context: &'static str) -> Result<usize> {
        Ok((self.read_i32(context)? & 0xFFFFFF) as usize)
    }

    /// Skip the high half of an 8-byte pointer slot.
    fn advance(&mut self) {
        self.pos += 4;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptHeader {
    pub rsc7_offset: usize,
    pub magic: i32,
    pub sub_header: usize,
    pub code_blocks_offset: usize,
    pub globals_version: i32,
    pub code_length: usize,
    pub parameter_count: usize,
    pub statics_count: usize,
    pub globals_count: usize,
    pub natives_count: usize,
    pub statics_offset: usize,
    pub globals_offset: usize,
    pub natives_offset: usize,
    pub name_hash: i32,
    pub script_name_offset: usize,
    pub strings_offset: usize,
    pub strings_size: usize,
    pub string_table_offsets: Vec<usize>,
    pub code_table_offsets: Vec<usize>,
    pub script_name: String,
}

impl ScriptHeader {
    pub fn parse(data: &[u8], is_bit32: bool) -> Result<ScriptHeader> {
        if is_bit32 {
            Self::parse_console(data)
        } else {
            Self::parse_pc(data)
        }
    }

    fn parse_pc(data: &[u8]) -> Result<ScriptHeader> {
        let mut r = Reader::new(data, false);
        let mut h = ScriptHeader::default();
        if data.len() >= 4 && &data[..4] == RSC7_MAGIC {
            h.rsc7_offset = 0x10;
        }
        r.seek(h.rsc7_offset);
        h.magic = r.read_i32("header magic")?;
        r.advance();
        h.sub_header = r.read_pointer("sub header")?;
        r.advance();
        h.code_blocks_offset = r.read_pointer("code block table")?;
        r.advance();
        h.globals_version = r.read_i32("globals version")?;
        h.code_length = r.read_i32("code length")? as usize;
        h.parameter_count = r.read_i32("parameter count")? as usize;
        h.statics_count = r.read_i32("statics count")? as usize;
        h.globals_count = r.read_i32("globals count")? as usize;
        h.natives_count = r.read_i32("natives count")? as usize;
        h.statics_offset = r.read_pointer("statics offset")?;
        r.advance();
        h.globals_offset = r.read_pointer("globals offset")?;
        r.advance();
        h.natives_offset = r.read_pointer("natives offset")?;
        r.advance();
        r.read_i32("pad")?;
        r.advance();
        r.read_i32("pad")?;
        r.advance();
        h.name_hash = r.read_i32("name hash")?;
        r.read_i32("pad")?;
        h.script_name_offset = r.read_pointer("script name offset")?;
        r.advance();
        h.strings_offset = r.read_pointer("strings offset")?;
        r.advance();
        h.strings_size = r.read_i32("strings size")? as usize;

        h.read_page_tables(&mut r)?;
        h.read_script_name(data);
        Ok(h)
    }

    fn parse_console(data: &[u8]) -> Result<ScriptHeader> {
        let mut r = Reader::new(data, true);
        let mut h = ScriptHeader::default();
        if data.len() >= 4 && &data[..4] == RSC7_MAGIC {
            h.rsc7_offset = 0x10;
        }
        r.seek(h.rsc7_offset);
        h.magic = r.read_i32("header magic")?;
        h.sub_header = r.read_pointer("sub header")?;
        h.code_blocks_offset = r.read_pointer("code block table")?;
        h.globals_version = r.read_i32("globals version")?;
        h.code_length = r.read_i32("code length")? as usize;
        h.parameter_count = r.read_i32("parameter count")? as usize;
        h.statics_count = r.read_i32("statics count")? as usize;
        h.globals_count = r.read_i32("globals count")? as usize;
        h.natives_count = r.read_i32("natives count")? as usize;
        h.statics_offset = r.read_pointer("statics offset")?;
        h.globals_offset = r.read_pointer("globals offset")?;
        h.natives_offset = r.read_pointer("natives offset")?;
        r.read_i32("pad")?;
        r.read_i32("pad")?;
        h.name_hash = r.read_i32("name hash")?;
        r.read_i32("pad")?;
        h.script_name_offset = r.read_pointer("script name offset")?;
        h.strings_offset = r.read_pointer("strings offset")?;
        h.strings_size = r.read_i32("strings size")? as usize;

        h.read_page_tables(&mut r)?;
        h.read_script_name(data);
        Ok(h)
    }

    fn read_page_tables(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let string_blocks = (self.strings_size + (PAGE_SIZE - 1)) >> 14;
        let code_blocks = (self.code_length + (PAGE_SIZE - 1)) >> 14;
        let wide = !r.big_endian;

        r.seek(self.strings_offset + self.rsc7_offset);
        for _ in 0..string_blocks {
            self.string_table_offsets
                .push(r.read_pointer("string page table")? + self.rsc7_offset);
            if wide {
                r.advance();
            }
        }

        r.seek(self.code_blocks_offset + self.rsc7_offset);
        for _ in 0..code_blocks {
            self.code_table_offsets
                .push(r.read_pointer("code page table")? + self.rsc7_offset);
            if wide {
                r.advance();
            }
        }
        Ok(())
    }

    fn read_script_name(&mut self, data: &[u8]) {
        let start = self.script_name_offset + self.rsc7_offset;
        let mut name = String::new();
        let mut i = start;
        while i < data.len() && data[i] != 0 {
            name.push(data[i] as char);
            i += 1;
        }
        self.script_name = name;
    }

    pub fn string_block_count(&self) -> usize {
        self.string_table_offsets.len()
    }

    pub fn code_block_count(&self) -> usize {
        self.code_table_offsets.len()
    }

    /// Byte count of one page of a segment of `total` bytes.
    pub fn page_len(page: usize, total: usize) -> usize {
        if (page + 1) * PAGE_SIZE >= total {
            total % PAGE_SIZE
        } else {
            PAGE_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_i32(data: &mut [u8], off: usize, v: i32) {
        LittleEndian::write_i32(&mut data[off..off + 4], v);
    }

    fn pc_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x200];
        put_i32(&mut data, 0x00, 0x405A9ED0); // magic
        put_i32(&mut data, 0x10, 0x100); // code block table
        put_i32(&mut data, 0x1C, 0x20); // code length
        put_i32(&mut data, 0x20, 2); // parameter count
        put_i32(&mut data, 0x24, 4); // statics count
        put_i32(&mut data, 0x2C, 3); // natives count
        put_i32(&mut data, 0x30, 0x140); // statics offset
        put_i32(&mut data, 0x40, 0x150); // natives offset
        put_i32(&mut data, 0x60, 0x120); // script name offset
        put_i32(&mut data, 0x68, 0x110); // strings offset
        put_i32(&mut data, 0x70, 0x10); // strings size
        put_i32(&mut data, 0x100, 0x160); // code page 0
        put_i32(&mut data, 0x110, 0x180); // string page 0
        data[0x120..0x127].copy_from_slice(b"example");
        data
    }

    #[test]
    fn pc_header_round_trip() {
        let h = ScriptHeader::parse(&pc_image(), false).unwrap();
        assert_eq!(h.code_length, 0x20);
        assert_eq!(h.parameter_count, 2);
        assert_eq!(h.statics_count, 4);
        assert_eq!(h.natives_count, 3);
        assert_eq!(h.script_name, "example");
        assert_eq!(h.code_table_offsets, vec![0x160]);
        assert_eq!(h.string_table_offsets, vec![0x180]);
    }

    #[test]
    fn rsc7_wrapper_shifts_offsets() {
        let mut data = vec![0u8; 0x10];
        data[..4].copy_from_slice(b"RSC7");
        data.extend_from_slice(&pc_image());
        let h = ScriptHeader::parse(&data, false).unwrap();
        assert_eq!(h.rsc7_offset, 0x10);
        assert_eq!(h.code_table_offsets, vec![0x170]);
        assert_eq!(h.script_name, "example");
    }

    #[test]
    fn page_lengths_cap_at_segment_end() {
        assert_eq!(ScriptHeader::page_len(0, 0x4000 + 5), PAGE_SIZE);
        assert_eq!(ScriptHeader::page_len(1, 0x4000 + 5), 5);
        assert_eq!(ScriptHeader::page_len(0, 0x123), 0x123);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let data = vec![0u8; 8];
        assert!(matches!(
            ScriptHeader::parse(&data, false),
            Err(DecompileError::TruncatedImage { .. })
        ));
    }
}
