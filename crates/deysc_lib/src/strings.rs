//! String table reassembled from the image's 0x4000-byte pages.

use std::collections::HashMap;

use crate::error::{DecompileError, Result};

pub struct StringTable {
    table: Vec<u8>,
    // Strings starting right after a NUL terminator, keyed by table offset.
    dictionary: HashMap<usize, String>,
}

impl StringTable {
    pub fn from_pages(pages: Vec<Vec<u8>>, whole_size: usize) -> Self {
        let mut table = Vec::with_capacity(whole_size);
        for page in pages {
            let remaining = whole_size - table.len();
            table.extend_from_slice(&page[..page.len().min(remaining)]);
        }

        let mut dictionary = HashMap::new();
        let mut start = 0usize;
        for i in 0..table.len() {
            if table[i] == 0 {
                dictionary.insert(start, escape(&table[start..i]));
                start = i + 1;
            }
        }
        if start < table.len() {
            dictionary.insert(start, escape(&table[start..]));
        }
        StringTable { table, dictionary }
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.table.len()
    }

    /// The string starting at `index`. Most pushes point at a terminator
    /// boundary and hit the precomputed map; mid-string indexes re-scan.
    pub fn get(&self, index: usize) -> Result<String> {
        if let Some(s) = self.dictionary.get(&index) {
            return Ok(s.clone());
        }
        if index >= self.table.len() {
            return Err(DecompileError::StringIndexOutOfRange {
                index,
                len: self.table.len(),
            });
        }
        let end = self.table[index..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| index + p)
            .unwrap_or(self.table.len());
        Ok(escape(&self.table[index..end]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.dictionary.iter().map(|(&k, v)| (k, v.as_str()))
    }
}

fn escape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        match b {
            10 => out.push_str("\\n"),
            13 => out.push_str("\\r"),
            34 => out.push_str("\\\""),
            _ => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_split_on_terminators() {
        let table = StringTable::from_pages(vec![b"abc\0de\0".to_vec()], 7);
        assert_eq!(table.get(0).unwrap(), "abc");
        assert_eq!(table.get(4).unwrap(), "de");
    }

    #[test]
    fn mid_string_index_rescans() {
        let table = StringTable::from_pages(vec![b"hello\0".to_vec()], 6);
        assert_eq!(table.get(2).unwrap(), "llo");
    }

    #[test]
    fn control_characters_are_escaped() {
        let table = StringTable::from_pages(vec![b"a\nb\r\"\0".to_vec()], 6);
        assert_eq!(table.get(0).unwrap(), "a\\nb\\r\\\"");
    }

    #[test]
    fn out_of_range_is_an_error() {
        let table = StringTable::from_pages(vec![b"x\0".to_vec()], 2);
        assert!(table.get(10).is_err());
    }

    #[test]
    fn pages_truncate_to_whole_size() {
        let table = StringTable::from_pages(vec![vec![b'a'; 0x4000], b"tail\0zzzz".to_vec()], 0x4005);
        assert_eq!(table.get(0x4000).unwrap(), "tail");
    }
}
