//! Decompiler for RAGE script containers (`.ysc` and friends): parses the
//! script image, rebuilds functions from the stack bytecode and renders
//! them as C-like pseudo code.
//!
//! The top-level entry points are [`decompile`] for one image with default
//! settings and [`ScriptFile`](script::ScriptFile) for callers that need
//! the parsed form (native cross references, batch aggregation, reports).

pub mod aggregate;
pub mod codepath;
pub mod error;
pub mod function;
pub mod hashes;
pub mod header;
pub mod instruction;
pub mod natives;
pub mod opcodes;
pub mod script;
pub mod stack;
pub mod strings;
pub mod types;
pub mod vars;

pub use error::{DecompileError, Result};
pub use script::ScriptFile;

use aggregate::AggregateRegistry;
use hashes::{GxtLookup, HashLookup};
use natives::{NativeRegistry, TableCipher};
use opcodes::{OpcodeSet, RdrConsoleOpcodeSet, RdrOpcodeSet, VOpcodeSet};

/// Which game build produced the script image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edition {
    #[default]
    GtaV,
    Rdr,
    RdrConsole,
}

impl Edition {
    pub fn opcode_set(self) -> &'static dyn OpcodeSet {
        match self {
            Edition::GtaV => &VOpcodeSet,
            Edition::Rdr => &RdrOpcodeSet,
            Edition::RdrConsole => &RdrConsoleOpcodeSet,
        }
    }

    /// The RDR editions widen switch counts and extend the opcode table.
    pub fn is_extended(self) -> bool {
        self.opcode_set().is_extended()
    }
}

/// How integer literals are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntStyle {
    #[default]
    Int,
    Uint,
    Hex,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub edition: Edition,
    /// Packed 32-bit console image layout (big-endian fields).
    pub is_bit32: bool,
    /// Multi-byte instruction operands are stored big-endian.
    pub swap_endian: bool,
    pub int_style: IntStyle,
    /// Emit declarations for statics and frame variables.
    pub declare_variables: bool,
    /// Renumber variables to skip unused slots.
    pub shift_variables: bool,
    /// Rewrite known integer literals as `joaat("NAME")`.
    pub reverse_hashes: bool,
    pub show_array_size: bool,
    /// Annotate literals with GXT label text.
    pub show_entry_comments: bool,
    pub show_func_position: bool,
    pub hex_index: bool,
    pub uppercase_natives: bool,
    /// Also run the stateless decode used for cross-script deduplication.
    pub aggregate_functions: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            edition: Edition::GtaV,
            is_bit32: false,
            swap_endian: false,
            int_style: IntStyle::Int,
            declare_variables: true,
            shift_variables: false,
            reverse_hashes: true,
            show_array_size: true,
            show_entry_comments: true,
            show_func_position: false,
            hex_index: false,
            uppercase_natives: false,
            aggregate_functions: false,
        }
    }
}

impl Options {
    pub fn native_cipher(&self) -> TableCipher {
        if self.is_bit32 {
            TableCipher::Console32
        } else if self.edition == Edition::GtaV {
            TableCipher::Rotated
        } else {
            TableCipher::XorChain
        }
    }
}

/// Shared lookup state for a run: native descriptors, hash and GXT
/// dictionaries and the aggregate registry. One instance serves every
/// script of a batch.
pub struct Services {
    pub natives: NativeRegistry,
    pub hashes: HashLookup,
    pub gxt: GxtLookup,
    pub aggregate: AggregateRegistry,
}

impl Default for Services {
    fn default() -> Self {
        Services {
            natives: NativeRegistry::new(),
            hashes: HashLookup::empty(),
            gxt: GxtLookup::empty(),
            aggregate: AggregateRegistry::new(7, 1),
        }
    }
}

/// Decompile one script image with default options.
pub fn decompile(data: &[u8]) -> Result<String> {
    let services = Services::default();
    decompile_with_options(data, Options::default(), &services)
}

/// Decompile one script image. `services` carries the native database and
/// lookup dictionaries and may be shared across a batch.
pub fn decompile_with_options(data: &[u8], options: Options, services: &Services) -> Result<String> {
    let mut script = ScriptFile::parse(data, options, services)?;
    script.decompile()?;
    Ok(script.render())
}
