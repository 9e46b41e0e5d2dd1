//! Binary entry point for the quarry administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use quarry::admin::{stats, verify, AdminOpenOptions, StatsReport, VerifyLevel, VerifyReport};
use quarry::storage::StorageMode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    about = "Administrative CLI for quarry datasets",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, value_enum, help = "How index files are accessed")]
    mode: Option<ModeArg>,

    #[arg(long, global = true, help = "Read cache size per index (blocks)")]
    cache_blocks: Option<usize>,

    #[arg(long, global = true, help = "Do not take the location lock")]
    no_lock: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print index, dictionary and journal statistics")]
    Stats {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Verify on-disk structures")]
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Full,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    File,
    Mapped,
}

impl From<ModeArg> for StorageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::File => StorageMode::File,
            ModeArg::Mapped => StorageMode::Mapped,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarry=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let open_opts = build_open_options(&cli.open);

    match cli.command {
        Command::Stats { dir } => {
            let report = stats(&dir, &open_opts)?;
            emit(&cli.format, &report, |fmt| print_stats_text(fmt, &report))?;
        }
        Command::Verify { dir, level } => {
            let report = verify(&dir, &open_opts, level.into())?;
            emit(&cli.format, &report, |fmt| print_verify_text(fmt, &report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn build_open_options(args: &OpenArgs) -> AdminOpenOptions {
    let mut opts = AdminOpenOptions::default();
    if let Some(mode) = args.mode {
        opts.mode = mode.into();
    }
    if let Some(blocks) = args.cache_blocks {
        opts.read_cache_blocks = blocks;
    }
    opts.use_lock_file = !args.no_lock;
    opts
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_stats_text(_: OutputFormat, report: &StatsReport) {
    println!(
        "Location: {} block_size={} mode={:?} cache_blocks={}",
        report.location,
        report.params.block_size,
        report.params.mode,
        report.params.read_cache_blocks
    );
    println!();
    println!("Indexes:");
    for index in &report.indexes {
        println!(
            "  {:<8} records={} height={} blocks={} generation={} order={} file={} reads={} writes={}",
            index.name,
            index.records,
            index.height,
            index.block_limit,
            index.generation,
            index.order,
            index.file_bytes,
            index.io.reads,
            index.io.writes
        );
    }
    println!();
    println!(
        "Objects: length={} position={} physical={}",
        report.objects.length, report.objects.position, report.objects.physical_length
    );
    println!(
        "Dictionary: terms={} triples={} quads={}",
        report.dictionary.allocated_terms, report.dictionary.triples, report.dictionary.quads
    );
    println!(
        "Journal: size={} needs_recovery={} path={}",
        report.journal.size_bytes, report.journal.needs_recovery, report.journal.path
    );
    println!(
        "Filesystem: total={} dir={}",
        report.filesystem.total_bytes, report.filesystem.dir
    );
}

fn print_verify_text(_: OutputFormat, report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} indexes={} records={} terms={} triples={} quads={}",
        report.level,
        report.success,
        report.counts.indexes_checked,
        report.counts.index_records,
        report.counts.terms_checked,
        report.counts.triples,
        report.counts.quads,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}
