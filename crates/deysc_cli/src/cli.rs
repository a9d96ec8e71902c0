use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EditionCli {
    /// GTA V, 64-bit PC images
    V,
    /// GTA V console, packed 32-bit big-endian images
    Vconsole,
    /// Red Dead Redemption, PC opcode table
    Rdr,
    /// Red Dead Redemption, console opcode table
    Rdrconsole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IntStyleCli {
    Int,
    Uint,
    Hex,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles RAGE script images
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a single script image
    File {
        /// Path to the compiled script (.ysc)
        path: PathBuf,

        /// Write the listing here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        flags: DecodeFlags,
    },
    /// Decompiles every script image in a directory
    Dir {
        /// Directory holding .ysc files
        path: PathBuf,

        /// Output directory (defaults to the input directory)
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        flags: DecodeFlags,
    },
}

#[derive(Args)]
pub struct DecodeFlags {
    /// Which game build produced the scripts
    #[arg(long, value_enum, default_value_t = EditionCli::V)]
    pub edition: EditionCli,

    /// Integer literal rendering
    #[arg(long, value_enum, default_value_t = IntStyleCli::Int)]
    pub int_style: IntStyleCli,

    /// Native database (JSON) for hash name and signature lookups
    #[arg(long)]
    pub natives: Option<PathBuf>,

    /// Word list for joaat hash reversal (Entities.dat format)
    #[arg(long)]
    pub entities: Option<PathBuf>,

    /// GXT entry dump for literal comments
    #[arg(long)]
    pub gxt: Option<PathBuf>,

    /// Render native names in upper case
    #[arg(long, default_value_t = false)]
    pub uppercase_natives: bool,

    /// Skip static and frame variable declaration blocks
    #[arg(long, default_value_t = false)]
    pub no_declarations: bool,

    /// Renumber variables to skip unused slots
    #[arg(long, default_value_t = false)]
    pub shift_variables: bool,

    /// Keep integer literals as numbers even when the hash is known
    #[arg(long, default_value_t = false)]
    pub no_hash_reversal: bool,

    /// Hide array sizes in declarations
    #[arg(long, default_value_t = false)]
    pub hide_array_size: bool,

    /// Drop GXT entry comments
    #[arg(long, default_value_t = false)]
    pub no_gxt_comments: bool,

    /// Annotate each function with its byte position
    #[arg(long, default_value_t = false)]
    pub show_position: bool,

    /// Hexadecimal global indexing
    #[arg(long, default_value_t = false)]
    pub hex_index: bool,

    /// Deduplicate identical functions across the batch
    #[arg(long, default_value_t = false)]
    pub aggregate: bool,

    /// Minimum function length (lines) for deduplication
    #[arg(long, default_value_t = 7)]
    pub aggregate_min_lines: usize,

    /// Minimum duplicate count for the aggregate report
    #[arg(long, default_value_t = 1)]
    pub aggregate_min_hits: usize,

    /// Write a native call frequency report next to the output
    #[arg(long, default_value_t = false)]
    pub frequency: bool,
}
