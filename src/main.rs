use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dsmerge::MergerConfig;
use dsmerge::core::record::read_jsonl;
use dsmerge::core::{ImageRecord, Pipeline, ProvenanceReason, UnknownHashPolicy};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "dsmerge",
    version,
    about = "Deduplicate, cluster and split merged image datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deduplicate, cluster and split in one pass
    Run {
        #[command(flatten)]
        input: InputArgs,
        /// Write the full report here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Only resolve exact and near duplicates
    Dedup {
        #[command(flatten)]
        input: InputArgs,
        /// Write kept records and provenance here
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Deduplicate, then list similarity clusters
    Cluster {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file to load (defaults are printed otherwise)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Image records, one JSON object per line
    #[arg(short, long, value_name = "FILE")]
    records: PathBuf,
    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Max hamming distance (bits) for near duplicates
    #[arg(long)]
    threshold: Option<u32>,
    /// Clustering radius as a fraction of hash bits
    #[arg(long)]
    eps: Option<f64>,
    /// Neighbours needed to seed a cluster
    #[arg(long)]
    min_samples: Option<usize>,
    /// Keep records with failed hashes instead of collapsing them
    #[arg(long)]
    exclude_unknown: bool,
}

impl InputArgs {
    fn load_config(&self) -> Result<MergerConfig> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(threshold) = self.threshold {
            config.perceptual_threshold = threshold;
        }
        if let Some(eps) = self.eps {
            config.cluster_eps = eps;
        }
        if let Some(min_samples) = self.min_samples {
            config.cluster_min_samples = min_samples;
        }
        if self.exclude_unknown {
            config.unknown_hash_policy = UnknownHashPolicy::Exclude;
        }
        config.validate()?;
        Ok(config)
    }

    fn load_records(&self) -> Result<Vec<ImageRecord>> {
        let spinner = spinner("Reading records…")?;
        let file = File::open(&self.records)
            .with_context(|| format!("Could not open records file {:?}", self.records))?;
        let records = read_jsonl(BufReader::new(file))
            .with_context(|| format!("Failed to read records from {:?}", self.records))?;
        spinner.finish_with_message(format!("Read {} record(s)", records.len()));
        Ok(records)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input, output } => {
            let config = input.load_config()?;
            let records = input.load_records()?;
            println!("▶ Merging {} record(s)", records.len());

            let pipeline = Pipeline::new(config);
            let progress = spinner("Deduplicating, clustering and splitting…")?;
            let report = benchmark("full pipeline", || pipeline.run(records));
            progress.finish_and_clear();

            let summary = &report.summary;
            println!(
                "✅ Kept {} unique record(s): {} exact, {} near duplicate(s) removed",
                summary.unique_records,
                summary.exact_duplicates_removed,
                summary.near_duplicates_removed
            );
            println!(
                "   {} cluster(s), {} noise point(s), {} unclustered",
                summary.clusters, summary.noise_points, summary.unclustered_records
            );
            for (split, count) in &summary.splits {
                println!(
                    "   {:<8} {:>7} ({:.1}%)",
                    split.as_str(),
                    count.count,
                    count.percentage
                );
            }
            if summary.cluster_leaks > 0 {
                println!(
                    "⚠️  {} cluster(s) span more than one split",
                    summary.cluster_leaks
                );
            }

            write_json(&report, output.as_deref())?;
        }

        Commands::Dedup { input, output } => {
            let config = input.load_config()?;
            let records = input.load_records()?;
            println!("▶ Deduplicating {} record(s)", records.len());

            let engine = Pipeline::new(config).deduplicator();
            let result = benchmark("deduplication", || engine.find_duplicates(records));

            // Group dropped records under the record that replaced them.
            let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for entry in result.provenance.iter().filter(|p| !p.kept) {
                let kept = match &entry.reason {
                    ProvenanceReason::DuplicateOf(id) | ProvenanceReason::NearDuplicateOf(id) => {
                        id.as_str()
                    }
                    _ => continue,
                };
                groups
                    .entry(kept)
                    .or_default()
                    .push(entry.source_record_id.as_str());
            }

            if groups.is_empty() {
                println!("No duplicates found.");
            } else {
                println!("Found {} duplicate group(s):", groups.len());
                for (i, (kept, dropped)) in groups.iter().enumerate() {
                    println!("\n✨ Group {}:", i + 1);
                    println!("   🏆 Keeping → {}", kept);
                    for path in dropped {
                        println!("   📦 Dropping {}", path);
                    }
                }
            }

            if let Some(path) = output.as_deref() {
                write_json(&result, Some(path))?;
            }
        }

        Commands::Cluster { input } => {
            let config = input.load_config()?;
            let records = input.load_records()?;

            let pipeline = Pipeline::new(config);
            let unique = pipeline.deduplicator().find_duplicates(records).unique;
            println!("▶ Clustering {} unique record(s)", unique.len());
            let clusters = benchmark("clustering", || pipeline.clusterer().cluster(&unique));

            let mut members: BTreeMap<i32, Vec<&str>> = BTreeMap::new();
            for (path, label) in &clusters {
                members.entry(*label).or_default().push(path.as_str());
            }
            for (label, paths) in &members {
                if *label == dsmerge::core::NOISE {
                    println!("\n· Noise: {} record(s)", paths.len());
                    continue;
                }
                println!("\n✨ Cluster {} ({} record(s)):", label, paths.len());
                for path in paths {
                    println!("   ▶ {}", path);
                }
            }
        }

        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MergerConfig> {
    match path {
        Some(path) => MergerConfig::load(path)
            .with_context(|| format!("Failed to load configuration {:?}", path)),
        None => Ok(MergerConfig::default()),
    }
}

/// Pretty-print `value` to `path`, or to stdout when no path is given.
fn write_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
            fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
            println!("\n✅ Wrote {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn spinner(message: &'static str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
