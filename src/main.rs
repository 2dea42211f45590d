//! parity-probe CLI: train, sample and probe a parity-tracking transformer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parity_probe::{
    list_tensors, load_weights, save_weights, select_device, Dfa, Experiment, ExperimentConfig,
    GenerationSummary, HookPoint, ProbeReport, TrainingReport, DEFAULT_WEIGHTS_FILE,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "parity-probe")]
#[command(about = "Train a small transformer on a regular language and probe it for parity")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON experiment config (defaults reproduce the parity experiment)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Safetensors weights file
    #[arg(short, long, global = true, default_value = DEFAULT_WEIGHTS_FILE)]
    weights: PathBuf,

    /// Output directory for results
    #[arg(short, long, global = true, default_value = "outputs")]
    output: PathBuf,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the experiment seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Residual locations to probe, e.g. `mid,post` or `resid_pre`
    #[arg(long, global = true, value_delimiter = ',')]
    locations: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum Command {
    /// Train from scratch and save the weights
    Train,
    /// Sample from trained weights and check the parity of the target symbol
    Generate,
    /// Fit linear probes on trained weights
    Probe,
    /// Train (or load existing weights), generate, then probe
    Run {
        /// Train even if the weights file exists
        #[arg(long)]
        retrain: bool,
    },
    /// Print the minimal DFA of the configured regex as Graphviz DOT
    Dfa {
        /// Regex to compile instead of the configured one
        #[arg(long)]
        regex: Option<String>,
    },
    /// List the tensors stored in the weights file
    Weights,
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Results saved to {}", path.display());
    Ok(())
}

fn print_training(report: &TrainingReport) {
    println!("\n=== Training ===");
    println!("Parameters: {}", report.n_params);
    println!("Steps:      {}", report.steps());
    if let Some(loss) = report.recent_mean(100) {
        println!("Final loss: {loss:.4} (mean of last 100 steps)");
    }
    println!("Time:       {:.1}s", report.elapsed_secs);
}

fn print_generation(summary: &GenerationSummary) {
    let report = &summary.report;
    println!("\n=== Generation ===");
    for s in report.strings.iter().take(10) {
        println!("  {s:?}");
    }
    println!(
        "Even '{}' count: {:.1}% of {} samples (training data {:.1}%)",
        report.target_symbol,
        report.even_fraction * 100.0,
        report.n_samples(),
        summary.data_even_fraction * 100.0
    );
    println!("In language:    {:.1}%", report.accepted_fraction * 100.0);
    println!(
        "z = {:.3}, p = {:.4}",
        summary.z_test.z, summary.z_test.p_value
    );
    println!("Length  even   odd");
    for (len, counts) in &report.length_histogram {
        println!("{len:6} {:5} {:5}", counts.even, counts.odd);
    }
}

fn print_probes(report: &ProbeReport) {
    println!(
        "\n=== Probes ({}) ===",
        if report.held_out {
            "held-out accuracy"
        } else {
            "fitting accuracy"
        }
    );
    println!("Layer Location    Accuracy Precision Recall    F1");
    for probe in &report.layer_results {
        let r = &probe.results;
        println!(
            "{:5} {:10} {:7.1}% {:9.3} {:6.3} {:5.3}",
            probe.layer,
            probe.location.to_string(),
            r.accuracy * 100.0,
            r.precision(),
            r.recall(),
            r.f1()
        );
    }
    println!(
        "\nBest: layer {} {} with {:.1}% accuracy",
        report.best_layer,
        report.best_location,
        report.best_accuracy * 100.0
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(locations) = &cli.locations {
        config.probe.locations = locations
            .iter()
            .map(|name| name.parse::<HookPoint>())
            .collect::<Result<_>>()?;
    }

    match &cli.command {
        Command::Dfa { regex } => {
            let pattern = regex.as_deref().unwrap_or(&config.regex);
            let dfa = Dfa::from_regex(pattern)?;
            print!("{}", dfa.to_dot());
            return Ok(());
        }
        Command::Weights => {
            for (name, shape) in list_tensors(&cli.weights)? {
                println!("{name}: {shape:?}");
            }
            return Ok(());
        }
        _ => {}
    }

    println!("=== parity-probe ===");
    println!("Regex:   {}", config.regex);
    println!("Weights: {}", cli.weights.display());
    println!("Output:  {}", cli.output.display());
    if cli.cpu {
        println!("Mode:    CPU (forced)");
    }

    let device = select_device(cli.cpu);
    let experiment = Experiment::new(config, device)?;

    match cli.command {
        Command::Train => {
            let model = experiment.build_model()?;
            let report = experiment.train(&model)?;
            save_weights(&model, &cli.weights)?;
            print_training(&report);
            write_json(&cli.output, "losses.json", &report.losses)?;
        }
        Command::Generate => {
            let mut model = experiment.build_model()?;
            load_weights(&mut model, &cli.weights)?;
            let summary = experiment.generate(&model)?;
            print_generation(&summary);
            write_json(&cli.output, "generation.json", &summary)?;
        }
        Command::Probe => {
            let mut model = experiment.build_model()?;
            load_weights(&mut model, &cli.weights)?;
            let report = experiment.probe(&model)?;
            print_probes(&report);
            write_json(&cli.output, "probe_results.json", &report)?;
        }
        Command::Run { retrain } => {
            let results = experiment.run(&cli.weights, retrain)?;
            if let Some(training) = &results.training {
                print_training(training);
                write_json(&cli.output, "losses.json", &training.losses)?;
            }
            print_generation(&results.generation);
            write_json(&cli.output, "generation.json", &results.generation)?;
            print_probes(&results.probes);
            write_json(&cli.output, "probe_results.json", &results.probes)?;
        }
        Command::Dfa { .. } | Command::Weights => {}
    }

    Ok(())
}
