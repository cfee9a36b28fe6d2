use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lpak::archive::{Archive, ExtractOptions};
use lpak::bank::{LooseSamples, SampleSet};
use lpak::codec::{AudioFormat, Ffmpeg, Passthrough, Transcoder};
use lpak::container::read_index;
use lpak::export::{export, needs_cut, ExportOptions, ExportStage, Substitutions};
use lpak::io_stream::DEFAULT_BUFFER_SIZE;
use lpak::tables::{read_extractmap, read_tables, TAG_LEN};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lpak", about = "LPAK archive reader and monster container builder")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List archive members
    List {
        input: PathBuf,
        /// Only members matching this pattern
        #[arg(short, long, default_value = "*")]
        pattern: String,
    },
    /// Show archive header and section layout
    Info {
        input: PathBuf,
    },
    /// Extract members matching a pattern
    Extract {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(short, long, default_value = "*")]
        pattern: String,
        /// Copy buffer size in KiB
        #[arg(long, default_value = "64")]
        buffer_size: usize,
        /// Stop at the first member that fails
        #[arg(long)]
        fail_fast: bool,
    },
    /// Extract members into flat directories listed in a JSON map
    ExtractMap {
        input: PathBuf,
        /// JSON object: output directory → list of member patterns
        map: PathBuf,
        /// Copy buffer size in KiB
        #[arg(long, default_value = "64")]
        buffer_size: usize,
        #[arg(long)]
        fail_fast: bool,
    },
    /// Write one member to stdout
    Cat {
        input: PathBuf,
        member: String,
    },
    /// Build a monster container from the index tables and loose samples
    Build {
        /// Directory holding monster.tbl and tags.tbl
        #[arg(short, long, default_value = ".")]
        index: PathBuf,
        /// Directory of <name>.<ogg|flac|mp3> sample files
        #[arg(short, long)]
        samples: PathBuf,
        /// Output audio format: ogg, flac or mp3 (default: keep)
        #[arg(short, long)]
        format: Option<String>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Dump the index of a monster container
    Inspect {
        input: PathBuf,
        #[arg(long, default_value_t = TAG_LEN)]
        tag_len: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, pattern } => {
            let ar = Archive::open(&input)?;
            println!("Archive: {} (LPAK {})", input.display(), ar.version());
            println!("{:<48} {:>12} {:>12} {:>10}", "Name", "Offset", "Size", "Compressed");
            for name in ar.iglob(&pattern)?.iter() {
                let e = ar.entry(name)?;
                println!("{:<48} {:>12} {:>12} {:>10}",
                    name, e.data_offset, e.decompressed_size, e.is_compressed != 0);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let ar = Archive::open(&input)?;
            let h  = ar.header();
            println!("── LPAK Archive ─────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Version        {}", h.version);
            println!("  Header size    {} B", h.header_end);
            for (role, cue) in h.sections() {
                println!("  {:<14} @ {:>10}  {:>10} B", role.to_string(), cue.offset, cue.size);
            }
            println!("  Offsets        {}", ar.index().offset_count());
            println!("  Members        {}", ar.len());
            ar.close();
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, pattern, buffer_size, fail_fast } => {
            let ar = Archive::open(&input)?;
            let opts = ExtractOptions { fail_fast, ..Default::default() }.buffer_kib(buffer_size);
            let total = ar.iglob(&pattern)?.iter().count() as u64;
            let bar = progress_bar(total, "{msg} [{bar:40}] {pos}/{len}");
            bar.set_message("Extracting");
            let mut cb = |done: u64, _total: u64| bar.set_position(done);
            let report = ar.extract_all_with(&output_dir, &pattern, &opts, Some(&mut cb))?;
            bar.finish_and_clear();

            for (name, err) in &report.failed {
                eprintln!("  failed  {name}: {err}");
            }
            println!("Extracted {} member(s), {} B to {}",
                report.extracted.len(), report.bytes, output_dir.display());
            ar.close();
        }

        // ── ExtractMap ───────────────────────────────────────────────────────
        Commands::ExtractMap { input, map, buffer_size, fail_fast } => {
            let ar   = Archive::open(&input)?;
            let map  = read_extractmap(&map)?;
            let opts = ExtractOptions { fail_fast, ..Default::default() }.buffer_kib(buffer_size);
            let bar  = progress_bar(0, "{msg} [{bar:40}] {bytes}/{total_bytes}");
            bar.set_message("Extracting data files");
            let mut cb = |done: u64, total: u64| {
                bar.set_length(total);
                bar.set_position(done);
            };
            let report = ar.extract_map(&map, &opts, Some(&mut cb))?;
            bar.finish_and_clear();

            for (name, err) in &report.failed {
                eprintln!("  failed  {name}: {err}");
            }
            println!("Extracted {} file(s), {} B into {} director(ies)",
                report.extracted.len(), report.bytes, map.len());
            ar.close();
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { input, member } => {
            let ar = Archive::open(&input)?;
            ar.copy_member(&member, io::stdout().lock())?;
        }

        // ── Build ────────────────────────────────────────────────────────────
        Commands::Build { index, samples, format, output_dir } => {
            let table   = read_tables(&index)?;
            let samples = SampleSet::from(LooseSamples::new(samples).load()?);
            let target  = format.as_deref().map(str::parse::<AudioFormat>).transpose()?;

            let subs    = Substitutions::builtin();

            // Substituted rows are cut even when the format is kept.
            let converting = target.is_some_and(|t| t != samples.format());
            let transcoder: Box<dyn Transcoder> = if converting || needs_cut(&table, &samples, &subs) {
                Box::new(Ffmpeg::locate()?)
            } else {
                Box::new(Passthrough)
            };
            let opts = ExportOptions { target, buffer_size: DEFAULT_BUFFER_SIZE };

            let bar = progress_bar(table.len() as u64, "{msg} [{bar:40}] {pos}/{len}");
            bar.set_message("Collecting audio streams");
            let mut stage = ExportStage::Collecting;
            let mut cb = |s: ExportStage, done: u64, total: u64| {
                if s != stage {
                    stage = s;
                    bar.set_style(style("{msg} [{bar:40}] {bytes}/{total_bytes}"));
                    bar.set_message("Writing output file");
                    bar.set_length(total);
                }
                bar.set_position(done);
            };
            let summary = export(
                &table,
                &samples,
                &subs,
                transcoder.as_ref(),
                &opts,
                &output_dir,
                Some(&mut cb),
            )?;
            bar.finish_and_clear();
            println!("Wrote {} record(s), {} B → {}", summary.records, summary.bytes, summary.path.display());
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input, tag_len } => {
            let records = read_index(BufReader::new(File::open(&input)?), tag_len)?;
            println!("Container: {} ({} record(s))", input.display(), records.len());
            println!("{:<18} {:>12} {:>8} {:>12}", "Tag", "Offset", "Aux", "Payload");
            for r in &records {
                println!("{:<18} {:>12} {:>8} {:>12}",
                    hex::encode(&r.tag), r.payload_offset, r.aux_len, r.payload_len);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("lpak=debug"),
        _ => EnvFilter::new("lpak=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn progress_bar(len: u64, template: &str) -> ProgressBar {
    ProgressBar::new(len).with_style(style(template))
}
