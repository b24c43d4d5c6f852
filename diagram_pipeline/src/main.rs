mod scan;

use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use diagram_pipeline::stages::FileOutcome;
use diagram_pipeline::{DialectRegistry, RepoTarget};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "diagram-scan", about = "Validate and analyze diagrams in a working tree")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Filter {
    /// Root of the working tree
    #[arg(long, default_value = ".")]
    source: PathBuf,
    /// Path prefixes to include (default: everything)
    #[arg(long)]
    include: Vec<String>,
    /// Path prefixes to exclude
    #[arg(long)]
    exclude: Vec<String>,
    /// Accepted extensions (default: md, markdown, mdx)
    #[arg(long = "ext")]
    extensions: Vec<String>,
}

impl Filter {
    fn target(&self) -> eyre::Result<RepoTarget> {
        let mut target = RepoTarget::new("local/working-tree");
        if !self.include.is_empty() {
            target.include = self.include.clone();
        }
        target.exclude = self.exclude.clone();
        if !self.extensions.is_empty() {
            target.extensions = self.extensions.clone();
        }
        Ok(target.validate()?)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Validate every diagram block; fails if any block is invalid
    Check {
        #[command(flatten)]
        filter: Filter,
    },
    /// Print (or write) metadata for every valid diagram-bearing file
    Analyze {
        #[command(flatten)]
        filter: Filter,
        /// Write sidecar files next to their sources
        #[arg(long)]
        write: bool,
    },
    /// List the built-in dialects
    Dialects,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let Cli { command } = Cli::parse();
    let registry = DialectRegistry::builtin();

    match command {
        Command::Check { filter } => {
            let target = filter.target()?;
            let outcomes = scan::scan(&filter.source, &target, &registry, Utc::now())?;
            let mut invalid = 0;
            for outcome in &outcomes {
                if let FileOutcome::Invalid { path, failures } = outcome {
                    invalid += 1;
                    for failure in failures {
                        for error in &failure.errors {
                            println!("{path} [{} @ {}]: {error}", failure.dialect, failure.start);
                        }
                    }
                }
            }
            println!("{} file(s) scanned, {invalid} invalid", outcomes.len());
            if invalid > 0 {
                eyre::bail!("{invalid} file(s) contain invalid diagrams");
            }
        }
        Command::Analyze { filter, write } => {
            let target = filter.target()?;
            let outcomes = scan::scan(&filter.source, &target, &registry, Utc::now())?;
            if write {
                let summary = scan::write_sidecars(&filter.source, &target.metadata_suffix, &outcomes)?;
                for path in &summary.written {
                    println!("write  {path}");
                }
                for path in &summary.deleted {
                    println!("delete {path}");
                }
            } else {
                let metadata: Vec<_> = outcomes
                    .iter()
                    .filter_map(|o| match o {
                        FileOutcome::Analyzed { metadata, .. } => Some(metadata),
                        _ => None,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }
        }
        Command::Dialects => {
            for name in registry.names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
