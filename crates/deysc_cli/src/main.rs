use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use rayon::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deysc_lib::aggregate::AggregateRegistry;
use deysc_lib::hashes::{GxtLookup, HashLookup};
use deysc_lib::natives::NativeRegistry;
use deysc_lib::{Edition, IntStyle, Options, ScriptFile, Services};

use crate::cli::{Cli, DecodeFlags, DecompileCommand, EditionCli, IntStyleCli, TopLevel};

mod cli;

fn build_options(flags: &DecodeFlags) -> Options {
    let edition = match flags.edition {
        EditionCli::V | EditionCli::Vconsole => Edition::GtaV,
        EditionCli::Rdr => Edition::Rdr,
        EditionCli::Rdrconsole => Edition::RdrConsole,
    };
    let console = matches!(flags.edition, EditionCli::Vconsole | EditionCli::Rdrconsole);
    Options {
        edition,
        is_bit32: console,
        swap_endian: console,
        int_style: match flags.int_style {
            IntStyleCli::Int => IntStyle::Int,
            IntStyleCli::Uint => IntStyle::Uint,
            IntStyleCli::Hex => IntStyle::Hex,
        },
        declare_variables: !flags.no_declarations,
        shift_variables: flags.shift_variables,
        reverse_hashes: !flags.no_hash_reversal,
        show_array_size: !flags.hide_array_size,
        show_entry_comments: !flags.no_gxt_comments,
        show_func_position: flags.show_position,
        hex_index: flags.hex_index,
        uppercase_natives: flags.uppercase_natives,
        aggregate_functions: flags.aggregate,
    }
}

fn build_services(flags: &DecodeFlags) -> Result<Services> {
    let natives = NativeRegistry::new();
    if let Some(path) = &flags.natives {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading native database {}", path.display()))?;
        let count = natives.load_json(&json)?;
        info!(count, "loaded native database");
    }
    let hashes = match &flags.entities {
        Some(path) => HashLookup::from_lines(
            &fs::read_to_string(path)
                .with_context(|| format!("reading hash list {}", path.display()))?,
        ),
        None => HashLookup::empty(),
    };
    let gxt = match &flags.gxt {
        Some(path) => GxtLookup::from_lines(
            &fs::read_to_string(path)
                .with_context(|| format!("reading GXT dump {}", path.display()))?,
        ),
        None => GxtLookup::empty(),
    };
    Ok(Services {
        natives,
        hashes,
        gxt,
        aggregate: AggregateRegistry::new(flags.aggregate_min_lines, flags.aggregate_min_hits),
    })
}

fn decompile_one(path: &Path, opts: &Options, services: &Services) -> Result<String> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut script = ScriptFile::parse(&data, opts.clone(), services)
        .with_context(|| format!("parsing {}", path.display()))?;
    script
        .decompile()
        .with_context(|| format!("decompiling {}", path.display()))?;
    Ok(script.render())
}

/// Output file name for one input: everything before the first dot, plus
/// `.c` (`abc.ysc.full` becomes `abc.c`).
fn output_name(input: &Path) -> String {
    let name = input.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let stem = name.split('.').next().unwrap_or("script");
    format!("{stem}.c")
}

fn run_dir(
    dir: &Path,
    out: Option<PathBuf>,
    flags: &DecodeFlags,
    opts: &Options,
    services: &Services,
) -> Result<()> {
    let out_dir = out.unwrap_or_else(|| dir.to_path_buf());
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    let mut inputs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().contains(".ysc"))
                    .unwrap_or(false)
        })
        .collect();
    inputs.sort();

    let done: usize = inputs
        .par_iter()
        .map(|path| match decompile_one(path, opts, services) {
            Ok(text) => {
                let target = out_dir.join(output_name(path));
                match fs::write(&target, text) {
                    Ok(()) => 1,
                    Err(e) => {
                        error!(output = %target.display(), "write failed: {e}");
                        0
                    }
                }
            }
            Err(e) => {
                error!(script = %path.display(), "{e:#}");
                0
            }
        })
        .sum();
    info!(done, total = inputs.len(), "batch finished");

    if flags.aggregate {
        fs::write(out_dir.join("_aggregate.c"), services.aggregate.report())
            .context("writing aggregate report")?;
    }
    if flags.frequency {
        let mut csv = String::new();
        for (name, count) in services.natives.frequency(flags.uppercase_natives) {
            csv.push_str(&format!("{name},{count}\n"));
        }
        fs::write(out_dir.join("_funcfreq.csv"), csv).context("writing frequency report")?;
    }
    if flags.entities.is_some() {
        let mut csv = String::new();
        for (name, count) in services.hashes.used_report() {
            csv.push_str(&format!("{name},{count}\n"));
        }
        fs::write(out_dir.join("_used_hashes.csv"), csv).context("writing hash usage report")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, out, flags } => {
                let opts = build_options(&flags);
                let services = build_services(&flags)?;
                let text = decompile_one(&path, &opts, &services)?;
                match out {
                    Some(target) => fs::write(&target, text)
                        .with_context(|| format!("writing {}", target.display()))?,
                    None => print!("{text}"),
                }
            }
            DecompileCommand::Dir { path, out, flags } => {
                let opts = build_options(&flags);
                let services = build_services(&flags)?;
                run_dir(&path, out, &flags, &opts, &services)?;
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help()?;
        }
    }
    Ok(())
}
