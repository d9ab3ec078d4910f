use anyhow::{Context, Result};
use clap::Parser;
use sarq_core::{ArchiveKind, Mode, Sink, State, Writer};
use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::time::Instant;

mod output;

use output::{FileReport, OutputWriter};

/// Default read-buffer/block size in bytes.
const DEFAULT_BUFFER_SIZE: usize = 512;

/// Sarq - queue files into a compressed archive
#[derive(Parser)]
#[command(name = "sarq")]
#[command(about = "Stream files into a tar+LZ4 or ZIP archive, one bounded step at a time", long_about = None)]
#[command(version)]
struct Cli {
    /// Archive destination: "file" creates <output>.<ext>, "stderr" streams
    /// the raw archive to standard error
    target: String,

    /// Output name for the file target; the format extension is appended
    output: Option<PathBuf>,

    /// Archive format: tar-lz4 or zip (defaults to SARQ_FORMAT env var or tar-lz4)
    #[arg(long)]
    format: Option<String>,

    /// Read-buffer and compression block size in bytes (defaults to
    /// SARQ_BUFFER_SIZE env var or 512)
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Drain each file with a single blocking write instead of bounded steps
    #[arg(long)]
    block: bool,

    /// Emit per-file reports as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbose diagnostics on stderr (or set RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Determine format: CLI arg > SARQ_FORMAT env var > tar-lz4 default
    let format = cli
        .format
        .or_else(|| std::env::var("SARQ_FORMAT").ok())
        .unwrap_or_else(|| ArchiveKind::TarLz4.as_str().to_string());
    let kind = ArchiveKind::parse(&format)
        .with_context(|| format!("Unsupported archive format: {}", format))?;

    let buffer_size = match cli.buffer_size {
        Some(size) => size,
        None => resolve_env_buffer_size()?,
    };

    let sink = match cli.target.as_str() {
        "file" => {
            let output = cli
                .output
                .context("The file target requires an output name")?;
            Sink::file(output)
        }
        "stderr" => Sink::stream(io::stderr()),
        other => anyhow::bail!("Unknown target: {} (expected \"file\" or \"stderr\")", other),
    };

    let writer = Writer::open(kind, sink, buffer_size)
        .with_context(|| format!("Failed to open {} archive", kind.as_str()))?;

    let mode = if cli.block { Mode::Block } else { Mode::NonBlock };
    tracing::debug!(format = kind.as_str(), buffer_size, mode = ?mode, "configured");
    let out = OutputWriter::new(cli.json);

    if let Err(error) = prompt_loop(writer, mode, &out) {
        out.write_error(&error);
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Parse SARQ_BUFFER_SIZE if set, falling back to the default.
fn resolve_env_buffer_size() -> Result<usize> {
    match std::env::var("SARQ_BUFFER_SIZE") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid SARQ_BUFFER_SIZE: {}", value)),
        Err(_) => Ok(DEFAULT_BUFFER_SIZE),
    }
}

/// Read paths from stdin until `exit` (or end of input), archiving each one
/// as it arrives.
fn prompt_loop(mut writer: Writer, mode: Mode, out: &OutputWriter) -> Result<()> {
    let interactive = atty::is(atty::Stream::Stdin);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        if interactive {
            eprint!("Enter filename: ");
            io::stderr().flush()?;
        }

        let line = match lines.next() {
            Some(line) => line.context("Failed to read from stdin")?,
            None => break,
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" {
            break;
        }

        if !writer.add_file(input) {
            anyhow::bail!("Cannot queue {}: not an accessible regular file", input);
        }

        let started = Instant::now();
        let mut steps = 0u64;
        loop {
            let state = writer
                .write(mode)
                .with_context(|| format!("Failed to archive {}", input))?;
            steps += 1;
            if state == State::Finished {
                break;
            }
        }

        out.write(
            &FileReport {
                success: true,
                file: input.to_string(),
                steps,
                millis: started.elapsed().as_millis(),
            },
            || format!("{} archived in {}ms", input, started.elapsed().as_millis()),
        )?;
    }

    writer.close();
    Ok(())
}
