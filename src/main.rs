use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use graft::build::symbols::Strength;
use graft::build::{BuildConfig, BuildSession};

#[derive(Parser)]
#[command(name = "graft", about = "Compile an IR module for injection at fixed target addresses")]
struct Args {
    /// Input module file.
    module: PathBuf,

    /// Target instruction set.
    #[arg(long, default_value = "x86_64")]
    target: String,

    /// Base target address of the code region.
    #[arg(long, value_parser = parse_hex, default_value = "0xa000")]
    map_code_to: u64,

    /// Base target address of the read-only data region.
    #[arg(long, value_parser = parse_hex, default_value = "0xb000")]
    map_rodata_to: u64,

    /// Base target address of the mutable data region.
    #[arg(long, value_parser = parse_hex, default_value = "0xc000")]
    map_data_to: u64,

    /// Highest address the code region may reach.
    #[arg(long, value_parser = parse_hex)]
    code_ceiling: Option<u64>,

    /// Highest address the read-only data region may reach.
    #[arg(long, value_parser = parse_hex)]
    rodata_ceiling: Option<u64>,

    /// Highest address the mutable data region may reach.
    #[arg(long, value_parser = parse_hex)]
    data_ceiling: Option<u64>,

    /// Pre-existing symbol table, one name,hexaddr,hexsize row per line.
    #[arg(long)]
    symbols: Option<PathBuf>,

    /// Load pre-existing symbols as weak, letting module definitions of
    /// the same name win.
    #[arg(long)]
    weak_symbols: bool,

    /// Pre-linked static objects to merge verbatim, comma separated.
    #[arg(long, value_delimiter = ',')]
    static_link_libs: Vec<PathBuf>,

    /// Where to write the symbol-export table.
    #[arg(long, default_value = "exports.csv")]
    export_to: PathBuf,

    /// Directory for segment artifacts and archived objects.
    #[arg(long, default_value = ".")]
    dump_dir: PathBuf,
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| format!("{value:?} is not a hex address: {e}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = BuildConfig {
        target: args.target,
        code_base: args.map_code_to,
        rodata_base: args.map_rodata_to,
        data_base: args.map_data_to,
        code_ceiling: args.code_ceiling,
        rodata_ceiling: args.rodata_ceiling,
        data_ceiling: args.data_ceiling,
        table_strength: if args.weak_symbols {
            Strength::Weak
        } else {
            Strength::Strong
        },
        out_dir: args.dump_dir,
    };

    let mut session = BuildSession::new(&config)?;
    if let Some(symbols) = &args.symbols {
        session.add_existing_symbols_file(symbols)?;
    }
    for lib in &args.static_link_libs {
        session.add_static_blob(lib)?;
    }

    let source = fs::read_to_string(&args.module)
        .with_context(|| format!("could not read module {}", args.module.display()))?;
    session.add_module(&source)?;

    session.export_symbols(&args.export_to)?;
    session.dump_segments()?;
    Ok(())
}
