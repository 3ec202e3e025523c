use gauntlet_core::config::{GauntletConfig, OrderKind};
use gauntlet_core::coverage::{ClassInstrumenter, ProbeStrategy, count_probes};
use gauntlet_core::demo;
use gauntlet_core::instruction::ClassFile;
use gauntlet_core::{MutationAnalysis, MutationEngine, MutatorRegistry, Program};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Comma-separated mutator or group names, e.g. `DEFAULTS,TEMPORAL_BOUNDARY`.
    #[clap(short, long, value_delimiter = ',')]
    mutators: Option<Vec<String>>,
    #[clap(short, long)]
    threads: Option<usize>,
    /// Shuffle test order with this seed.
    #[clap(long)]
    seed: Option<u64>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every mutation found in a JSON program file.
    Mutants { program: PathBuf },
    /// Show the coverage probe strategy chosen for each method.
    Probes { program: PathBuf },
    /// Run a full analysis of the built-in demo program.
    Demo {
        /// Print the report as JSON instead of a summary.
        #[clap(long)]
        json: bool,
    },
    /// List the available mutators.
    Mutators,
}

fn load_config(cli: &Cli) -> anyhow::Result<GauntletConfig> {
    let mut config = match &cli.config_file {
        Some(path) => {
            info!(?path, "loading configuration");
            GauntletConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("gauntlet.toml");
            if default_path.exists() {
                info!(path = ?default_path, "loading default configuration");
                GauntletConfig::load_from_file(&default_path)?
            } else {
                GauntletConfig::default()
            }
        }
    };

    if let Some(mutators) = &cli.mutators {
        config.engine.mutators = mutators.clone();
    }
    if let Some(threads) = cli.threads {
        config.execution.threads = threads;
    }
    if let Some(seed) = cli.seed {
        config.execution.order = OrderKind::Random;
        config.execution.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

fn load_program(path: &Path) -> anyhow::Result<Vec<ClassFile>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read program file {path:?}"))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse program file {path:?}"))
}

fn engine(config: &GauntletConfig) -> anyhow::Result<MutationEngine> {
    let mutators = MutatorRegistry::new().resolve(&config.engine.mutators)?;
    Ok(MutationEngine::new(mutators))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::debug!(?config, "effective configuration");

    match &cli.command {
        Command::Mutants { program } => {
            let engine = engine(&config)?;
            for class in load_program(program)? {
                for details in engine.find_mutations(&class) {
                    println!("{}", serde_json::to_string(&details)?);
                }
            }
        }
        Command::Probes { program } => {
            let instrumenter = ClassInstrumenter::new(config.coverage.register_probe_limit);
            for (class_id, class) in load_program(program)?.iter().enumerate() {
                let instrumented = instrumenter.instrument(class, class_id as u32)?;
                for (method, strategy) in &instrumented.strategies {
                    let probes = class.method(method).map_or(0, count_probes);
                    let strategy = match strategy {
                        None => "none".to_string(),
                        Some(ProbeStrategy::Register { probes }) => format!("register({probes})"),
                        Some(ProbeStrategy::Sink) => "sink".to_string(),
                    };
                    println!("{}.{method}\t{probes}\t{strategy}", class.name);
                }
            }
        }
        Command::Demo { json } => {
            let analysis = MutationAnalysis::new(engine(&config)?, config.analysis_settings());
            let program: Program = demo::program().with_max_steps(config.execution.max_steps);
            let start_time = Instant::now();
            let report = analysis.run(&program, &demo::units())?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for result in &report.results {
                    println!("{:<12} {}", format!("{:?}", result.status), result.details.id);
                }
                println!(
                    "\n{} mutants in {:.2?}, score {:.1}%",
                    report.results.len(),
                    start_time.elapsed(),
                    report.mutation_score()
                );
            }
        }
        Command::Mutators => {
            let registry = MutatorRegistry::new();
            for name in registry.names() {
                if let Some(mutator) = registry.get(name) {
                    println!("{name}\t{}", mutator.globally_unique_id());
                }
            }
        }
    }
    Ok(())
}
