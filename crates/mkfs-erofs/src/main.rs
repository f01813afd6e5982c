//! mkfs-erofs - create an EROFS filesystem image from a directory tree.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;

use erofs_mkfs::{block_size_bits, build, Config, CompressorOption};

/// Create an EROFS filesystem image from a directory tree.
#[derive(Parser, Debug)]
#[command(name = "mkfs-erofs", version, about)]
struct Args {
    /// Output image path.
    #[arg(short = 'o', value_name = "image")]
    output: PathBuf,

    /// Source directory.
    #[arg(short = 'i', value_name = "source_dir")]
    source: PathBuf,

    /// Filesystem block size in bytes (power of two, 512..4096).
    #[arg(short = 'b', value_name = "size", default_value_t = 4096)]
    block_size: u32,

    /// Debug verbosity (0..9).
    #[arg(short = 'd', value_name = "level", default_value_t = 2)]
    debug_level: u8,

    /// Use a fixed filesystem UUID instead of a random one.
    #[arg(short = 'U', value_name = "uuid")]
    uuid: Option<String>,

    /// Volume label (at most 16 bytes).
    #[arg(short = 'L', value_name = "label")]
    label: Option<String>,

    /// Use a fixed UNIX timestamp for the build time and all inodes.
    #[arg(short = 'T', value_name = "unix_ts")]
    timestamp: Option<i64>,

    /// Write the build time for every inode, enabling compact encoding.
    #[arg(long)]
    ignore_mtime: bool,

    /// Primary compression algorithm (lz4, lzma, deflate or zstd).
    #[arg(short = 'c', value_name = "alg")]
    compression: Option<String>,

    /// Compression level for the primary algorithm.
    #[arg(short = 'l', value_name = "level", requires = "compression")]
    level: Option<i32>,

    /// Path-regex compression hints file.
    #[arg(short = 'C', value_name = "hints_file", requires = "compression")]
    hints: Option<PathBuf>,

    /// Deduplicate file tails into the packed inode.
    #[arg(long, requires = "compression")]
    fragments: bool,

    /// Largest physical cluster size in bytes.
    #[arg(long, value_name = "size", requires = "compression")]
    max_pcluster_size: Option<u32>,
}

fn parse_uuid(text: &str) -> Result<[u8; 16]> {
    let uuid = uuid::Uuid::parse_str(text).with_context(|| format!("invalid UUID {text:?}"))?;
    Ok(uuid.into_bytes())
}

fn run(args: Args) -> Result<()> {
    let mut cfg = Config::new(&args.source, &args.output);
    cfg.blkszbits = block_size_bits(args.block_size)?;
    cfg.volume_label = args.label.clone();
    cfg.fixed_timestamp = args.timestamp;
    cfg.ignore_mtime = args.ignore_mtime;
    cfg.hints_file = args.hints.clone();
    cfg.fragments = args.fragments;
    cfg.max_pcluster_size = args.max_pcluster_size.unwrap_or(0);
    if let Some(text) = &args.uuid {
        cfg.fixed_uuid = Some(parse_uuid(text)?);
    }
    if let Some(algorithm) = &args.compression {
        cfg.compression.push(CompressorOption {
            algorithm: algorithm.clone(),
            level: args.level,
            dict_size: None,
        });
    }

    let summary = build(&cfg)
        .with_context(|| format!("building {} from {}", args.output.display(), args.source.display()))?;

    println!(
        "{}: {} blocks of {} bytes, {} inodes",
        args.output.display(),
        summary.total_blocks,
        args.block_size,
        summary.inodes
    );
    if summary.compressed_files > 0 {
        println!("{} files compressed", summary.compressed_files);
    }
    if summary.saved_by_deduplication > 0 {
        println!("{} bytes saved by deduplication", summary.saved_by_deduplication);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap handles --help/--version as "errors" that exit cleanly
            if e.use_stderr() {
                let _ = e.print();
                return ExitCode::from(1);
            }
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    env_logger::Builder::new()
        .filter_level(match args.debug_level {
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2..=3 => LevelFilter::Info,
            4..=6 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mkfs-erofs: {e:#}");
            ExitCode::from(2)
        }
    }
}
