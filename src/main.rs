//! posprobe CLI: word-position probing of residual streams

use anyhow::Result;
use clap::Parser;
use posprobe::{load_word_list, Experiment, ExperimentConfig, ProbeModel};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "posprobe")]
#[command(about = "Probe transformer residual streams for word position")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (GPT-2 family)
    #[arg(short, long, default_value = "openai-community/gpt2")]
    model: String,

    /// Newline-delimited word list
    #[arg(short, long, default_value = "data/common_words.txt")]
    words: PathBuf,

    /// Output directory for results
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// JSON file overriding experiment defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
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

    let config = match &cli.config {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig::default(),
    };

    println!("=== posprobe: word-position probing ===");
    println!("Model:  {}", cli.model);
    println!("Words:  {}", cli.words.display());
    println!("Output: {}", cli.output.display());
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    let raw_words = load_word_list(&cli.words)?;
    info!("Word list: {} entries", raw_words.len());

    // Load model
    info!("Loading model...");
    let model = ProbeModel::from_pretrained_with_device(&cli.model, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} hidden",
        model.n_layers(),
        model.d_model()
    );

    let experiment = Experiment::new(model, config);
    let results = experiment.run(&raw_words)?;

    // Print results
    println!("\n=== Layer {} probe ===", results.probe.layer);
    println!("Train (n={}):\n{}", results.probe.n_train, results.probe.train);
    println!("Test (n={}):\n{}", results.probe.n_test, results.probe.test);

    if !results.layer_scan.is_empty() {
        println!("\n=== Layer scan ===");
        for r in &results.layer_scan {
            println!("Layer {:2}: {:.1}%", r.layer, r.accuracy() * 100.0);
        }
        println!(
            "\nBest: layer {} with {:.1}% accuracy",
            results.best_layer,
            results.best_accuracy * 100.0
        );
    }

    println!("\n=== Held-out predictions ===");
    println!("{}", results.predictions.head(10));
    for (slot, acc) in results.slot_accuracy.iter().enumerate() {
        println!("Slot {slot}: {:.1}%", acc * 100.0);
    }
    println!("\n{}", results.predictions.render_histogram(60));

    // Save results
    std::fs::create_dir_all(&cli.output)?;
    results.save_json(cli.output.join("posprobe_results.json"))?;

    Ok(())
}
