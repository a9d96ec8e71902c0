//! Jenkins one-at-a-time hashing and the reverse-lookup tables that turn
//! raw integer literals back into `joaat("NAME")` calls and GXT label
//! comments.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{IntStyle, Options};

pub fn joaat(s: &str) -> u32 {
    let mut hash = 0u32;
    for b in s.to_lowercase().bytes() {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

pub fn int_to_hex(value: i32, style: IntStyle) -> String {
    if style == IntStyle::Hex {
        format!("0x{:08X}", value)
    } else {
        value.to_string()
    }
}

/// Recover the integer behind a rendered literal, undoing the decorations
/// emission may have applied (trailing comments, `joaat("...")` rewrites,
/// hex formatting).
pub fn literal_int(text: &str, style: IntStyle) -> Option<i32> {
    let mut text = text.to_string();
    if let (Some(start), Some(end)) = (text.find("/*"), text.find("*/")) {
        if end < start {
            return None;
        }
        text = format!("{}{}", &text[..start], &text[end + 2..]);
    }

    if let Some(rest) = text.strip_prefix("joaat(\"") {
        let name = rest.strip_suffix("\")")?;
        return Some(joaat(name) as i32);
    }

    if style == IntStyle::Hex {
        let hex = text.strip_prefix("0x")?;
        return u32::from_str_radix(hex, 16).ok().map(|v| v as i32);
    }
    text.trim().parse().ok()
}

/// Known entity/model names keyed by their joaat hash. Hits are counted so
/// a batch run can report which names its scripts actually referenced.
pub struct HashLookup {
    hashes: HashMap<i32, String>,
    used: Mutex<HashMap<String, u64>>,
}

impl HashLookup {
    pub fn empty() -> Self {
        HashLookup {
            hashes: HashMap::new(),
            used: Mutex::new(HashMap::new()),
        }
    }

    /// One candidate name per line.
    pub fn from_lines(text: &str) -> Self {
        let mut hashes = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let hash = joaat(line) as i32;
            if hash != 0 {
                hashes.entry(hash).or_insert_with(|| line.to_uppercase());
            }
        }
        HashLookup {
            hashes,
            used: Mutex::new(HashMap::new()),
        }
    }

    pub fn reverse(&self, value: i32, suffix: &str, opts: &Options) -> String {
        if !opts.reverse_hashes {
            return int_to_hex(value, opts.int_style);
        }
        match self.hashes.get(&value) {
            Some(name) => {
                *self.used.lock().entry(name.clone()).or_insert(0) += 1;
                format!("joaat(\"{name}\")")
            }
            None => format!("{}{suffix}", int_to_hex(value, opts.int_style)),
        }
    }

    pub fn reverse_unsigned(&self, value: u32, suffix: &str, opts: &Options) -> String {
        if !opts.reverse_hashes {
            return value.to_string();
        }
        match self.hashes.get(&(value as i32)) {
            Some(name) => {
                *self.used.lock().entry(name.clone()).or_insert(0) += 1;
                format!("joaat(\"{name}\")")
            }
            None => format!("{value}{suffix}"),
        }
    }

    /// `Hash, Count` CSV rows sorted by name.
    pub fn used_report(&self) -> Vec<(String, u64)> {
        let used = self.used.lock();
        let mut rows: Vec<(String, u64)> = used.iter().map(|(k, &v)| (k.clone(), v)).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// GXT label texts keyed by the label's joaat hash, surfaced as inline
/// comments next to integer literals.
pub struct GxtLookup {
    entries: HashMap<i32, String>,
}

impl GxtLookup {
    pub fn empty() -> Self {
        GxtLookup { entries: HashMap::new() }
    }

    /// Lines of the form `LABEL // text` or `0xHASH // text`.
    pub fn from_lines(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(" // ") else { continue };
            let key = key.trim();
            let hash = if let Some(hex) = key.strip_prefix("0x") {
                match i64::from_str_radix(hex, 16) {
                    Ok(v) => v as i32,
                    Err(_) => continue,
                }
            } else {
                joaat(key) as i32
            };
            if hash != 0 {
                entries.entry(hash).or_insert_with(|| format!("{:?}", value.trim()));
            }
        }
        GxtLookup { entries }
    }

    /// Comment for a literal, or empty. With `float_translate`, a literal
    /// whose bits form a plausible small float is annotated too.
    pub fn entry_comment(&self, value: i32, float_translate: bool, opts: &Options) -> String {
        if !opts.show_entry_comments {
            return String::new();
        }
        if let Some(text) = self.entries.get(&value) {
            return format!(" /* GXTEntry: {text} */");
        }
        if float_translate && value != 0 && value != 1 {
            let f = f32::from_bits(value as u32);
            if f.is_nan() || f.is_infinite() || f == 0.0 {
                return String::new();
            }
            let fs = format!("{f}");
            if !fs.contains('e')
                && ((f as i64 as f32 == f && f.abs() < 10000.0) || fs.len() < 6)
            {
                return format!(" /* Float: {fs}f */");
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joaat_matches_known_values() {
        assert_eq!(joaat("a"), 0xCA2E9442);
        assert_eq!(joaat("ADDER"), joaat("adder"));
        assert_eq!(joaat(""), 0);
    }

    #[test]
    fn reverse_lookup_emits_joaat_calls() {
        let lookup = HashLookup::from_lines("adder\nbanshee\n");
        let opts = Options { reverse_hashes: true, ..Options::default() };
        let hash = joaat("adder") as i32;
        assert_eq!(lookup.reverse(hash, "", &opts), "joaat(\"ADDER\")");
        assert_eq!(lookup.reverse(12345, "", &opts), "12345");
        let report = lookup.used_report();
        assert_eq!(report, vec![("ADDER".to_string(), 1)]);
    }

    #[test]
    fn hex_style_pads_to_eight_digits() {
        assert_eq!(int_to_hex(255, IntStyle::Hex), "0x000000FF");
        assert_eq!(int_to_hex(255, IntStyle::Int), "255");
    }

    #[test]
    fn literal_int_undoes_emission_decorations() {
        assert_eq!(literal_int("42", IntStyle::Int), Some(42));
        assert_eq!(literal_int("0x0000002A", IntStyle::Hex), Some(42));
        assert_eq!(literal_int("5 /* Float: 1f */", IntStyle::Int), Some(5));
        assert_eq!(
            literal_int("joaat(\"adder\")", IntStyle::Int),
            Some(joaat("adder") as i32)
        );
        assert_eq!(literal_int("iVar0", IntStyle::Int), None);
    }

    #[test]
    fn gxt_comments_resolve_labels_and_floats() {
        let lookup = GxtLookup::from_lines("CELL_EMAIL_BOD // some text\n");
        let opts = Options { show_entry_comments: true, ..Options::default() };
        let hash = joaat("CELL_EMAIL_BOD") as i32;
        assert_eq!(
            lookup.entry_comment(hash, false, &opts),
            " /* GXTEntry: \"some text\" */"
        );
        assert_eq!(
            lookup.entry_comment(1065353216, true, &opts),
            " /* Float: 1f */"
        );
        assert_eq!(lookup.entry_comment(2, false, &opts), "");
    }
}
