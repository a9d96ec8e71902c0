//! Error taxonomy. Every variant is fatal for the script being decompiled;
//! batch callers isolate the failure and move on to the next file.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecompileError>;

#[derive(Debug, Error)]
pub enum DecompileError {
    #[error("unknown opcode {raw:#04x} at offset {offset}")]
    UnknownOpcode { raw: u8, offset: usize },

    #[error("truncated operands at offset {offset} (opcode needs {need} bytes, {have} remain)")]
    TruncatedOperands { offset: usize, need: usize, have: usize },

    #[error("unexpected {what} at offset {offset} in {function}")]
    UnexpectedInstruction {
        function: String,
        offset: usize,
        what: &'static str,
    },

    #[error("function frame markers inconsistent at offset {offset}: {reason}")]
    MalformedFunctionFrame { offset: usize, reason: &'static str },

    #[error("jump at offset {offset} in {function} targets unknown offset {target}")]
    UnresolvableJumpTarget {
        function: String,
        offset: usize,
        target: usize,
    },

    #[error("struct pop expected {expected} slots but value spans {found} in {function} at offset {offset}")]
    StructSizeMismatch {
        function: String,
        offset: usize,
        expected: usize,
        found: usize,
    },

    #[error("operand stack underflow in {function} at offset {offset}")]
    StackUnderflow { function: String, offset: usize },

    #[error("native table index {index} out of range ({len} entries)")]
    NativeIndexOutOfRange { index: usize, len: usize },

    #[error("native database rejects hash {hash:#018x}")]
    UnknownNativeHash { hash: u64 },

    #[error("string table index {index} out of range ({len} bytes)")]
    StringIndexOutOfRange { index: usize, len: usize },

    #[error("script image truncated: {context}")]
    TruncatedImage { context: &'static str },

    #[error("failed to parse native database: {0}")]
    NativeDb(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stack-machine failures carry no location; the function decompiler wraps
/// them with its own name and the faulting instruction offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    Underflow,
    StructSizeMismatch { expected: usize, found: usize },
    Unexpected(&'static str),
}

impl StackError {
    pub fn at(self, function: &str, offset: usize) -> DecompileError {
        match self {
            StackError::Underflow => DecompileError::StackUnderflow {
                function: function.to_string(),
                offset,
            },
            StackError::Unexpected(what) => DecompileError::UnexpectedInstruction {
                function: function.to_string(),
                offset,
                what,
            },
            StackError::StructSizeMismatch { expected, found } => {
                DecompileError::StructSizeMismatch {
                    function: function.to_string(),
                    offset,
                    expected,
                    found,
                }
            }
        }
    }
}
