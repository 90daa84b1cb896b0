//! kg-loom CLI: salvage completions, inspect communities, consolidate triples
//! and issue resilient completion calls.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use kg_loom::config::LoomConfig;
use kg_loom::graph::community;
use kg_loom::graph::consolidate::{ConsolidationPass, StandardizationMapping};
use kg_loom::graph::store::GraphStore;
use kg_loom::graph::Namespace;
use kg_loom::pipeline::{read_triples, write_triples};
use kg_loom::salvage;

#[derive(Parser)]
#[command(name = "kg-loom", version, about = "Knowledge-graph extraction core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover JSON from a raw completion saved to a file.
    Salvage {
        /// File holding the completion text.
        #[arg(long)]
        file: PathBuf,
    },

    /// List weakly-connected communities, largest first.
    Communities {
        /// JSON array of triples.
        #[arg(long)]
        file: PathBuf,

        /// Namespace whose same-namespace edges are considered.
        #[arg(long, default_value = "ENTITY")]
        namespace: Namespace,
    },

    /// Standardize, deduplicate and drop self references.
    Consolidate {
        /// JSON array of triples.
        #[arg(long)]
        file: PathBuf,

        /// JSON object of canonical label -> [variants]; a raw model reply works too.
        #[arg(long)]
        mapping: Option<PathBuf>,

        /// Write the result here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        /// TOML configuration; `[standardization] enabled = false` skips the mapping.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Perform one completion call through the key pool.
    Complete {
        /// TOML configuration file.
        #[arg(long, default_value = "kg-loom.toml")]
        config: PathBuf,

        /// File holding the user prompt.
        #[arg(long)]
        prompt_file: PathBuf,

        /// File holding the system prompt.
        #[arg(long)]
        system_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Salvage { file } => {
            let text = std::fs::read_to_string(&file).into_diagnostic()?;
            let salvaged = salvage::parse_detailed(&text)?;
            eprintln!(
                "recovered via {:?}{}",
                salvaged.strategy,
                if salvaged.fenced { " (fenced)" } else { "" }
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&salvaged.value).into_diagnostic()?
            );
        }

        Commands::Communities { file, namespace } => {
            let store = GraphStore::from_triples(read_triples(&file)?);
            let mut communities = community::detect_in(&store, namespace);
            community::sort_largest_first(&mut communities);

            println!(
                "{} communities over {} {namespace} nodes",
                communities.len(),
                store.unique_nodes(Some(namespace)).len()
            );
            for c in &communities {
                let members: Vec<&str> = c.members.iter().map(|m| m.label()).collect();
                println!("  #{} ({} members): {}", c.id, c.size(), members.join(", "));
            }
        }

        Commands::Consolidate {
            file,
            mapping,
            output,
            config,
        } => {
            let standardize = match &config {
                Some(path) => LoomConfig::load(path)?.standardization.enabled,
                None => true,
            };
            let triples = read_triples(&file)?;
            let mapping = match mapping.filter(|_| standardize) {
                Some(path) => {
                    let content = std::fs::read_to_string(&path).into_diagnostic()?;
                    let value = salvage::parse_object(&content)?.value;
                    Some(StandardizationMapping::from_value(&value))
                }
                None => None,
            };

            let mut pass = ConsolidationPass::new();
            if let Some(mapping) = &mapping {
                pass = pass.with_mapping(mapping);
            }
            let (triples, report) = pass.run(triples);

            eprintln!(
                "input {} | duplicates removed {} | self references removed {} | output {}",
                report.input, report.duplicates_removed, report.self_references_removed, report.output
            );
            match output {
                Some(path) => {
                    write_triples(&path, &triples)?;
                    eprintln!("wrote {} triples to {}", triples.len(), path.display());
                }
                None => println!(
                    "{}",
                    serde_json::to_string_pretty(&triples).into_diagnostic()?
                ),
            }
        }

        Commands::Complete {
            config,
            prompt_file,
            system_file,
        } => {
            let config = LoomConfig::load(&config)?;
            let executor = config.executor()?;

            let prompt = std::fs::read_to_string(&prompt_file).into_diagnostic()?;
            let mut request = config.model_settings().request(prompt);
            if let Some(path) = system_file {
                request = request.with_system(std::fs::read_to_string(&path).into_diagnostic()?);
            }

            let result = executor.execute(&request);
            if let Ok(text) = &result {
                println!("{text}");
            }

            let stats = executor.stats();
            eprintln!(
                "attempts {} | rate limited {} | server errors {} | malformed {} | transport {} | cooldown waits {}",
                stats.attempts,
                stats.rate_limited,
                stats.server_errors,
                stats.malformed,
                stats.transport_failures,
                stats.cooldown_waits
            );
            for key in executor.pool().stats() {
                eprintln!(
                    "  key {} {}: used {} | rate limited {} | malformed {} | {}",
                    key.key_number,
                    key.masked_key,
                    key.usage_count,
                    key.error_count,
                    key.malformed_count,
                    if key.currently_available {
                        "available".to_string()
                    } else {
                        format!("cooling {:.1}s", key.cooldown_remaining.as_secs_f64())
                    }
                );
            }

            result?;
        }
    }

    Ok(())
}
