//! Inferred data types for stack slots and variables.
//!
//! Types form a small lattice ordered by [`DataType::precedence`]; inference
//! only ever moves a slot to a type of equal or higher precedence, which is
//! what guarantees the whole-script fixpoint terminates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    Int,
    IntPtr,
    Float,
    FloatPtr,
    String,
    StringPtr,
    Bool,
    BoolPtr,
    #[default]
    Unk,
    UnkPtr,
    Unsure,
    /// Empty returns.
    None,
    Vector3,
    Vector3Ptr,
}

impl DataType {
    pub fn is_unknown(self) -> bool {
        matches!(self, DataType::Unk | DataType::UnkPtr)
    }

    /// Lattice height of this type. Refinement must be non-decreasing.
    pub fn precedence(self) -> u8 {
        match self {
            DataType::Unk | DataType::UnkPtr => 0,
            DataType::Unsure => 1,
            DataType::Vector3 => 2,
            DataType::Int
            | DataType::IntPtr
            | DataType::Float
            | DataType::FloatPtr
            | DataType::String
            | DataType::StringPtr
            | DataType::BoolPtr
            | DataType::Vector3Ptr => 3,
            DataType::Bool | DataType::None => 4,
        }
    }

    pub fn pointer_type(self) -> DataType {
        match self {
            DataType::Int => DataType::IntPtr,
            DataType::Unk => DataType::UnkPtr,
            DataType::Float => DataType::FloatPtr,
            DataType::Bool => DataType::BoolPtr,
            DataType::Vector3 => DataType::Vector3Ptr,
            _ => DataType::Unk,
        }
    }

    pub fn base_type(self) -> DataType {
        match self {
            DataType::IntPtr => DataType::Int,
            DataType::UnkPtr => DataType::Unk,
            DataType::FloatPtr => DataType::Float,
            DataType::BoolPtr => DataType::Bool,
            DataType::Vector3Ptr => DataType::Vector3,
            _ => DataType::Unk,
        }
    }

    pub fn long_name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::BoolPtr => "bool*",
            DataType::Float => "float",
            DataType::FloatPtr => "float*",
            DataType::Int => "int",
            DataType::IntPtr => "int*",
            DataType::String => "char[]",
            DataType::StringPtr => "char*",
            DataType::Vector3 => "Vector3",
            DataType::Vector3Ptr => "Vector3*",
            DataType::None => "void",
            DataType::UnkPtr => "var*",
            DataType::Unk | DataType::Unsure => "var",
        }
    }

    /// Prefix used when synthesizing variable names.
    pub fn short_name(self) -> &'static str {
        match self {
            DataType::Bool | DataType::BoolPtr => "b",
            DataType::Float | DataType::FloatPtr => "f",
            DataType::Int | DataType::IntPtr => "i",
            DataType::String => "c",
            DataType::StringPtr => "s",
            DataType::Vector3 | DataType::Vector3Ptr => "v",
            DataType::None => "f",
            DataType::Unk | DataType::UnkPtr | DataType::Unsure => "u",
        }
    }

    pub fn return_type(self) -> String {
        format!("{} ", self.long_name())
    }

    pub fn var_declaration(self) -> String {
        format!("{} {}", self.long_name(), self.short_name())
    }

    pub fn var_array_declaration(self) -> String {
        format!("{}[] {}", self.long_name(), self.short_name())
    }
}

/// Render a raw 64-bit static initializer in a type-appropriate way.
pub fn represent(value: i64, ty: DataType) -> String {
    match ty {
        DataType::Float => {
            let f = f32::from_bits(value as u32);
            format!("{f}f")
        }
        DataType::Bool => {
            if value == 0 { "false".to_string() } else { "true".to_string() }
        }
        DataType::FloatPtr | DataType::IntPtr | DataType::StringPtr | DataType::UnkPtr => {
            "NULL".to_string()
        }
        _ => {
            if value > i32::MAX as i64 && value <= u32::MAX as i64 {
                (value as u32 as i32).to_string()
            } else {
                value.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_is_monotonic_along_refinement_chains() {
        assert!(DataType::Unk.precedence() < DataType::Unsure.precedence());
        assert!(DataType::Unsure.precedence() < DataType::Vector3.precedence());
        assert!(DataType::Vector3.precedence() < DataType::Int.precedence());
        assert!(DataType::Int.precedence() < DataType::Bool.precedence());
    }

    #[test]
    fn pointer_base_round_trip() {
        for ty in [DataType::Int, DataType::Float, DataType::Bool, DataType::Vector3] {
            assert_eq!(ty.pointer_type().base_type(), ty);
        }
        assert_eq!(DataType::String.pointer_type(), DataType::Unk);
    }

    #[test]
    fn represent_reinterprets_floats() {
        assert_eq!(represent(1065353216, DataType::Float), "1f");
        assert_eq!(represent(0, DataType::Bool), "false");
        assert_eq!(represent(3, DataType::Int), "3");
    }
}
