use clap::{ArgAction, Parser, Subcommand};
use sngpkg::archive::{self, default_archive_path, ArchiveInfo, DecodeOptions, EncodeOptions};
use sngpkg::batch::{run_batch, BatchResult};
use sngpkg::header::DEFAULT_VERSION;
use sngpkg::transcode::{CommandTranscoder, TranscodeOptions};
use sngpkg::MaskKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sng", about = "Encode song folders into .sng archives and back")]
struct Cli {
    /// More log output; repeat for more detail.  RUST_LOG overrides.
    #[arg(short, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode one or more song directories
    Encode {
        #[arg(required = true, num_args = 1..)]
        dirs: Vec<PathBuf>,
        /// Output file (single input only).  Default: <dir>.sng
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Include files outside the song-folder naming convention
        #[arg(short = 'i', long)]
        allow_nonconforming: bool,
        /// Overwrite existing archives
        #[arg(short, long)]
        force: bool,
        #[arg(short = 'V', long = "format-version", default_value_t = DEFAULT_VERSION)]
        version: u32,
        /// Fixed mask key as 32 hex digits.  Default: random
        #[arg(long)]
        mask_key: Option<String>,
        /// Transcode audio to Opus
        #[arg(short, long)]
        encode_audio: bool,
        /// Transcode workers.  Default: a quarter of the available cores
        #[arg(short, long)]
        threads: Option<usize>,
        /// Per-file transcode deadline in seconds; 0 disables it
        #[arg(long, default_value_t = 600)]
        transcode_timeout: u64,
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,
        /// Directories encoded at once
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
    },
    /// Decode one or more archives into song directories
    Decode {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        /// Song directory under the output dir.  Default: "<artist> - <name> (<charter>)"
        #[arg(short = 'd', long)]
        sng_dir: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
        /// Skip entries outside the naming convention
        #[arg(long)]
        strict_names: bool,
        /// Archives decoded at once
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
    },
    /// List archive contents
    List {
        input: PathBuf,
    },
    /// Show archive header and metadata
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode {
            dirs, output, allow_nonconforming, force, version, mask_key,
            encode_audio, threads, transcode_timeout, ffmpeg, jobs,
        } => {
            if output.is_some() && dirs.len() > 1 {
                return Err("--output only applies to a single input directory".into());
            }
            let mask_key = match mask_key {
                Some(hex) => Some(MaskKey::from_hex(&hex).ok_or("mask key must be 32 hex digits")?),
                None => None,
            };
            let transcode = encode_audio.then(|| TranscodeOptions {
                transcoder:   Arc::new(CommandTranscoder::ffmpeg_opus(&ffmpeg)),
                threads,
                task_timeout: (transcode_timeout > 0).then(|| Duration::from_secs(transcode_timeout)),
            });
            let opts = EncodeOptions {
                version,
                mask_key,
                allow_nonconforming,
                overwrite: force,
                transcode,
                ..Default::default()
            };

            let results = run_batch(&dirs, jobs, |dir| {
                let dest = output.clone().unwrap_or_else(|| default_archive_path(dir));
                archive::encode_dir(dir, &dest, &opts).map(|summary| (dest, summary))
            })?;
            report(&results, "encode", |(dest, summary)| {
                format!("Created: {} ({} files, {} B)", dest.display(), summary.table.len(), summary.archive_size)
            })?;
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { files, out_dir, sng_dir, force, strict_names, jobs } => {
            let opts = DecodeOptions {
                out_dir,
                sng_dir,
                overwrite: force,
                allow_nonconforming: !strict_names,
                ..Default::default()
            };
            let results = run_batch(&files, jobs, |file| archive::decode_file(file, &opts))?;
            report(&results, "decode", |dest| format!("Unpacked to: {}", dest.display()))?;
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let reader = archive::open(&input)?;
            println!("Archive: {}", input.display());
            println!("{:<26} {:>12} {:>12}", "Name", "Size", "Offset");
            for entry in reader.entries() {
                println!("{:<26} {:>12} {:>12}", entry.name, entry.content_length, entry.content_offset);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let reader = archive::open(&input)?;
            let info = ArchiveInfo::from_reader(&reader);
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }
            println!("── .sng Archive ─────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Format version {}", info.version);
            println!("  Mask key       {}", info.mask_key);
            println!("  Files          {}", info.files.len());
            println!("  Content        {} B", info.content_length);
            println!("  Metadata ({}):", info.metadata.len());
            for (key, value) in info.metadata.iter() {
                println!("    {key} = {value}");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn report<T>(
    results: &[BatchResult<T>],
    action:  &str,
    show:    impl Fn(&T) -> String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut failed = 0;
    for result in results {
        match &result.outcome {
            Ok(value) => println!("{}", show(value)),
            Err(e) => {
                tracing::error!(input = %result.input.display(), error = %e, "{action} failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(format!("{failed} of {} inputs failed to {action}", results.len()).into());
    }
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}
