use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use rayon::prelude::*;
use serde::Serialize;
use steptrace::{
    analysis::{summarize, TraceSummary},
    postprocess::read_trace,
    trace::Phase,
};

/// Summarizes per-layer spans of one trace file or every trace in a directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A trace file, or a directory of `*.log` / `*.trace` files.
    #[arg(short, long)]
    path: PathBuf,
    /// Also export every span as CSV.
    #[arg(long)]
    csv: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    buckets: u64,
}

#[derive(Serialize)]
struct SpanRow<'a> {
    file: String,
    layer: &'a str,
    phase: &'static str,
    start: Option<u64>,
    end: Option<u64>,
    duration: Option<u64>,
}

fn trace_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(anyhow!("{} is neither a file nor a directory", path.display()));
    }
    let mut files = Vec::new();
    for ext in ["log", "trace"] {
        let pattern = path.join(format!("*.{}", ext));
        let pattern = pattern
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 path {}", pattern.display()))?;
        for entry in glob::glob(pattern)? {
            files.push(entry?);
        }
    }
    files.sort();
    Ok(files)
}

fn print_summary(path: &Path, summary: &TraceSummary) {
    println!("{}", path.display().to_string().bold());
    for span in &summary.spans {
        let phase = match span.phase {
            Phase::Forward => span.phase.short_name().green(),
            Phase::Backward => span.phase.short_name().blue(),
            Phase::Optimizer => span.phase.short_name().magenta(),
        };
        match span.duration() {
            Some(d) => println!("  {:<10} {:<32} {:>12}", phase, span.layer, d),
            None => println!(
                "  {:<10} {:<32} {:>12}",
                phase,
                span.layer,
                "incomplete".yellow()
            ),
        }
    }
    if summary.unlabeled > 0 {
        println!("  {} unlabeled lines", summary.unlabeled.to_string().yellow());
    }
    println!("  backward order: {}", summary.backward_order().join(" -> "));
}

fn main() -> Result<()> {
    let args = Args::parse();

    let files = trace_files(&args.path)?;
    if files.is_empty() {
        return Err(anyhow!("No trace files under {}", args.path.display()));
    }

    let summaries = files
        .par_iter()
        .map(|path| {
            read_trace(path)
                .with_context(|| format!("Failed to read trace {}", path.display()))
                .map(|events| (path.clone(), summarize(&events)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut hist = histo::Histogram::with_buckets(args.buckets);
    for (path, summary) in &summaries {
        print_summary(path, summary);
        summary
            .spans
            .iter()
            .filter_map(|s| s.duration())
            .for_each(|d| hist.add(d));
    }
    println!("Span duration distribution:\n{}", hist);

    if let Some(csv_path) = &args.csv {
        let mut writer = csv::Writer::from_path(csv_path)
            .with_context(|| format!("Failed to create {}", csv_path.display()))?;
        for (path, summary) in &summaries {
            for span in &summary.spans {
                writer.serialize(SpanRow {
                    file: path.display().to_string(),
                    layer: &span.layer,
                    phase: span.phase.short_name(),
                    start: span.start,
                    end: span.end,
                    duration: span.duration(),
                })?;
            }
        }
        writer.flush()?;
        println!("Wrote spans to {}", csv_path.display());
    }
    Ok(())
}
