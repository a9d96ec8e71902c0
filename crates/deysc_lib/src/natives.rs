//! Native-function table and the cross-script descriptor registry.
//!
//! The in-image table maps a compact index to a 64-bit hash, scrambled per
//! edition. The registry resolves hashes to display names and best-known
//! parameter/return types; type raises are monotonic and lock-protected,
//! since every script being decompiled in parallel shares one registry.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{DecompileError, Result};
use crate::types::DataType;

pub const UNK_PREFIX: &str = "unk_";

/// Per-edition descrambling of the native hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCipher {
    /// 64-bit entries, each rotated left by `(code_size + index) & 0x3F`.
    Rotated,
    /// RDR: XOR chain over the raw bytes, carry seeded with the code size.
    XorChain,
    /// 32-bit console entries, stored big-endian.
    Console32,
}

pub struct NativeTable {
    hashes: Vec<u64>,
}

impl NativeTable {
    pub fn parse(raw: &[u8], count: usize, code_size: usize, cipher: TableCipher) -> Result<Self> {
        let entry_size = if cipher == TableCipher::Console32 { 4 } else { 8 };
        if raw.len() < count * entry_size {
            return Err(DecompileError::TruncatedImage { context: "native table" });
        }

        let mut bytes = raw[..count * entry_size].to_vec();
        if cipher == TableCipher::XorChain {
            let mut carry = code_size as u8;
            for b in &mut bytes {
                let plain = carry ^ *b;
                carry = *b;
                *b = plain;
            }
        }

        let mut hashes = Vec::with_capacity(count);
        for i in 0..count {
            let hash = match cipher {
                TableCipher::Console32 => BigEndian::read_u32(&bytes[i * 4..]) as u64,
                TableCipher::XorChain => LittleEndian::read_u64(&bytes[i * 8..]),
                TableCipher::Rotated => {
                    let raw = LittleEndian::read_u64(&bytes[i * 8..]);
                    raw.rotate_left(((code_size + i) & 0x3F) as u32)
                }
            };
            hashes.push(hash);
        }
        Ok(NativeTable { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn hash_at(&self, index: usize) -> Result<u64> {
        self.hashes
            .get(index)
            .copied()
            .ok_or(DecompileError::NativeIndexOutOfRange {
                index,
                len: self.hashes.len(),
            })
    }

    /// Flat `index: name` dump for the script header comment block.
    pub fn dump(&self, registry: &NativeRegistry, uppercase: bool) -> Vec<String> {
        self.hashes
            .iter()
            .enumerate()
            .map(|(i, &h)| format!("{i:02X}: {}", registry.display_name(h, uppercase)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct NativeInfo {
    pub name: Option<String>,
    pub params: Vec<DataType>,
    pub returns: DataType,
    pub uses: u64,
}

/// Point-in-time view handed to the stack machine for one call site.
#[derive(Debug, Clone)]
pub struct NativeSnapshot {
    pub hash: u64,
    pub params: Vec<DataType>,
    pub returns: DataType,
}

#[derive(Deserialize)]
struct DbParam {
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Deserialize)]
struct DbEntry {
    name: String,
    #[serde(default)]
    params: Vec<DbParam>,
    #[serde(default)]
    return_type: Option<String>,
}

#[derive(Default)]
pub struct NativeRegistry {
    natives: RwLock<HashMap<u64, NativeInfo>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry::default()
    }

    /// Load names and declared signatures from a natives JSON database
    /// (namespace -> hash -> entry). Returns the number of entries loaded.
    pub fn load_json(&self, json: &str) -> Result<usize> {
        let db: HashMap<String, HashMap<String, DbEntry>> = serde_json::from_str(json)?;
        let mut natives = self.natives.write();
        let mut loaded = 0usize;
        for (namespace, entries) in db {
            for (hash_str, entry) in entries {
                let Some(hash) = parse_hash(&hash_str) else { continue };
                let name = if namespace.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{namespace}::{}", entry.name)
                };
                natives.insert(
                    hash,
                    NativeInfo {
                        name: Some(name),
                        params: entry.params.iter().map(|p| declared_type(&p.ty)).collect(),
                        returns: entry
                            .return_type
                            .as_deref()
                            .map(declared_type)
                            .unwrap_or(DataType::Unk),
                        uses: 0,
                    },
                );
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn display_name(&self, hash: u64, uppercase: bool) -> String {
        let natives = self.natives.read();
        match natives.get(&hash).and_then(|n| n.name.as_ref()) {
            Some(name) => {
                if uppercase {
                    name.to_uppercase()
                } else {
                    name.to_lowercase()
                }
            }
            None => {
                let prefix = if uppercase {
                    UNK_PREFIX.to_uppercase()
                } else {
                    UNK_PREFIX.to_string()
                };
                format!("{prefix}0x{hash:016X}")
            }
        }
    }

    /// Record a call site, creating the descriptor on first sight and
    /// widening its parameter list if this site passes more arguments.
    /// `count_use` feeds the frequency report; only the emission pass of a
    /// non-aggregate function counts, so repeat inference runs do not skew
    /// the numbers.
    pub fn snapshot(
        &self,
        hash: u64,
        param_count: usize,
        return_count: usize,
        count_use: bool,
    ) -> NativeSnapshot {
        let mut natives = self.natives.write();
        let info = natives.entry(hash).or_insert_with(|| NativeInfo {
            name: None,
            params: Vec::new(),
            returns: if return_count == 0 { DataType::None } else { DataType::Unk },
            uses: 0,
        });
        if info.params.len() < param_count {
            info.params.resize(param_count, DataType::Unk);
        }
        if count_use {
            info.uses += 1;
        }
        NativeSnapshot {
            hash,
            params: info.params.clone(),
            returns: info.returns,
        }
    }

    /// Monotonic raise of one parameter type; true when the slot changed.
    pub fn update_param(&self, hash: u64, index: usize, ty: DataType) -> bool {
        let mut natives = self.natives.write();
        let Some(info) = natives.get_mut(&hash) else { return false };
        if index >= info.params.len() {
            info.params.resize(index + 1, DataType::Unk);
        }
        let prev = info.params[index];
        if !ty.is_unknown() && (prev.is_unknown() || prev.precedence() < ty.precedence()) {
            info.params[index] = ty;
            true
        } else {
            false
        }
    }

    /// Monotonic raise of the return type; true when it changed.
    pub fn update_return(&self, hash: u64, ty: DataType) -> bool {
        let mut natives = self.natives.write();
        let Some(info) = natives.get_mut(&hash) else { return false };
        let prev = info.returns;
        if !ty.is_unknown() && (prev.is_unknown() || prev.precedence() < ty.precedence()) {
            info.returns = ty;
            true
        } else {
            false
        }
    }

    pub fn info(&self, hash: u64) -> Option<NativeInfo> {
        self.natives.read().get(&hash).cloned()
    }

    /// Rendered prototype for the script header comment block.
    pub fn prototype(&self, hash: u64, uppercase: bool) -> String {
        let name = self.display_name(hash, uppercase);
        let natives = self.natives.read();
        match natives.get(&hash) {
            Some(info) => {
                let params: Vec<String> = info
                    .params
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("{}P{i}", p.var_declaration()))
                    .collect();
                format!("{}{name}({});", info.returns.return_type(), params.join(", "))
            }
            None => format!("var {name}();"),
        }
    }

    /// Call counts for the batch frequency report, most-used first.
    pub fn frequency(&self, uppercase: bool) -> Vec<(String, u64)> {
        let natives = self.natives.read();
        let mut rows: Vec<(String, u64)> = natives
            .iter()
            .filter(|(_, info)| info.uses > 0)
            .map(|(&hash, info)| (self_display(&natives, hash, uppercase), info.uses))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }
}

fn self_display(natives: &HashMap<u64, NativeInfo>, hash: u64, uppercase: bool) -> String {
    match natives.get(&hash).and_then(|n| n.name.as_ref()) {
        Some(name) => {
            if uppercase {
                name.to_uppercase()
            } else {
                name.to_lowercase()
            }
        }
        None => format!("{UNK_PREFIX}0x{hash:016X}"),
    }
}

fn parse_hash(s: &str) -> Option<u64> {
    let trimmed = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(trimmed, 16).ok()
}

/// Map a C-style declared type from the database onto the inference lattice.
fn declared_type(s: &str) -> DataType {
    match s.trim() {
        "int" | "Hash" | "Any" | "ScrHandle" | "Entity" | "Ped" | "Vehicle" | "Object"
        | "Player" | "Cam" | "Blip" | "Pickup" | "FireId" | "Interior" => DataType::Int,
        "int*" | "Hash*" | "ScrHandle*" | "Entity*" | "Ped*" | "Vehicle*" | "Object*" => {
            DataType::IntPtr
        }
        "float" => DataType::Float,
        "float*" => DataType::FloatPtr,
        "BOOL" | "bool" => DataType::Bool,
        "BOOL*" | "bool*" => DataType::BoolPtr,
        "const char*" | "char*" => DataType::StringPtr,
        "Vector3" => DataType::Vector3,
        "Vector3*" => DataType::Vector3Ptr,
        "void" => DataType::None,
        s if s.ends_with('*') => DataType::UnkPtr,
        _ => DataType::Unk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotated_table_undoes_per_entry_rotation() {
        let hash: u64 = 0x4EDE34FBADD967A6;
        let code_size = 0x1234;
        let scrambled = hash.rotate_right(((code_size + 0) & 0x3F) as u32);
        let mut raw = vec![0u8; 8];
        LittleEndian::write_u64(&mut raw, scrambled);
        let table = NativeTable::parse(&raw, 1, code_size, TableCipher::Rotated).unwrap();
        assert_eq!(table.hash_at(0).unwrap(), hash);
    }

    #[test]
    fn xor_chain_decodes_with_code_size_seed() {
        let plain: u64 = 0x0123456789ABCDEF;
        let code_size = 77usize;
        let mut plain_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut plain_bytes, plain);
        // Re-encipher: each stored byte is plain ^ previous stored byte.
        let mut stored = [0u8; 8];
        let mut carry = code_size as u8;
        for i in 0..8 {
            stored[i] = plain_bytes[i] ^ carry;
            carry = stored[i];
        }
        let table = NativeTable::parse(&stored, 1, code_size, TableCipher::XorChain).unwrap();
        assert_eq!(table.hash_at(0).unwrap(), plain);
    }

    #[test]
    fn registry_raises_are_monotonic() {
        let reg = NativeRegistry::new();
        reg.snapshot(0xABC, 2, 1, false);
        assert!(reg.update_param(0xABC, 0, DataType::Float));
        assert!(!reg.update_param(0xABC, 0, DataType::Int));
        assert!(reg.update_param(0xABC, 0, DataType::Bool));
        assert!(reg.update_return(0xABC, DataType::Int));
        let info = reg.info(0xABC).unwrap();
        assert_eq!(info.params[0], DataType::Bool);
        assert_eq!(info.returns, DataType::Int);
    }

    #[test]
    fn unknown_hashes_get_placeholder_names() {
        let reg = NativeRegistry::new();
        assert_eq!(
            reg.display_name(0x1122334455667788, false),
            "unk_0x1122334455667788"
        );
        assert_eq!(
            reg.display_name(0x1122334455667788, true),
            "UNK_0x1122334455667788"
        );
    }

    #[test]
    fn json_database_loads_signatures() {
        let json = r#"{
            "SYSTEM": {
                "0x4EDE34FBADD967A6": {
                    "name": "WAIT",
                    "params": [{"type": "int", "name": "ms"}],
                    "return_type": "void"
                }
            }
        }"#;
        let reg = NativeRegistry::new();
        assert_eq!(reg.load_json(json).unwrap(), 1);
        assert_eq!(
            reg.display_name(0x4EDE34FBADD967A6, true),
            "SYSTEM::WAIT"
        );
        let info = reg.info(0x4EDE34FBADD967A6).unwrap();
        assert_eq!(info.params, vec![DataType::Int]);
        assert_eq!(info.returns, DataType::None);
    }

    #[test]
    fn frequency_ranks_by_uses_then_name() {
        let reg = NativeRegistry::new();
        reg.snapshot(1, 0, 0, true);
        reg.snapshot(2, 0, 0, true);
        reg.snapshot(2, 0, 0, true);
        let rows = reg.frequency(false);
        assert_eq!(rows[0].1, 2);
        assert_eq!(rows[1].1, 1);
    }
}
