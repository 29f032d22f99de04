//! maths-quanta CLI: interpretability sweeps over arithmetic transformers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maths_quanta::{
    calc_attention_tags, classify, find_useful_nodes, find_useful_positions, load_backend,
    search_and_tag, test_correctness_on_num_questions, test_questions_by_complexity,
    AblationConfig, MathsConfig, MathsQuestion, MathsToken, MeanActivations, QuestionBatch,
    QuestionGenerator, SubTask, UsefulNodeRegistry,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "maths-quanta")]
#[command(about = "Find the algorithm an arithmetic transformer implements")]
#[command(version)]
struct Cli {
    /// JSON configuration file (defaults are used when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode a question and show its complexity
    Classify {
        first: i64,
        /// `+`, `-` or `*`
        op: String,
        second: i64,
    },
    /// Print a generated batch with the complexity of each question
    Generate {
        #[arg(long)]
        seed: Option<u64>,
        /// Splice carry and borrow cascades into some questions
        #[arg(long)]
        enrich: bool,
    },
    /// Measure accuracy on a large held-out question stream
    Accuracy {
        /// Local model directory, safetensors file or HuggingFace repo id
        #[arg(short, long)]
        model: String,
        #[arg(short, long, default_value_t = 1_000_000)]
        num_questions: usize,
        #[arg(long)]
        enrich: bool,
    },
    /// Find useful positions and nodes, tag them and export the registry
    Analyse {
        #[arg(short, long)]
        model: String,
        #[arg(short, long, default_value = "nodes.json")]
        output: PathBuf,
        /// Generated batches pooled into the analysis set
        #[arg(long, default_value_t = 4)]
        batches: usize,
        /// Also ablate MLP neurons
        #[arg(long)]
        neurons: bool,
        /// Minimum attention share (percent) recorded as a tag
        #[arg(long, default_value_t = 10.0)]
        min_perc: f32,
        /// Also try pairs of nodes in the sub-task search
        #[arg(long)]
        pairs: bool,
    },
}

fn parse_operator(op: &str) -> Result<MathsToken> {
    let mut chars = op.chars();
    match (chars.next().and_then(MathsToken::from_symbol), chars.next()) {
        (Some(token), None) if token.is_operator() => Ok(token),
        _ => anyhow::bail!("Unknown operator '{op}', expected one of + - *"),
    }
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

    let cfg = match &cli.config {
        Some(path) => MathsConfig::load(path)?,
        None => MathsConfig::default(),
    };
    cfg.validate()?;

    match cli.command {
        Command::Classify { first, op, second } => {
            let question = MathsQuestion::new(&cfg, first, second, parse_operator(&op)?)?;
            let tokens = question.to_tokens(&cfg);
            let (category, tag) = classify(&cfg, &tokens);
            println!("Tokens:     {tokens:?}");
            println!("Question:   {}", question.to_text(&cfg));
            println!("Complexity: {category}.{tag}");
        }
        Command::Generate { seed, enrich } => {
            let seed = seed.unwrap_or(cfg.analysis_seed);
            let batch = QuestionGenerator::new(&cfg, seed, enrich)?.next_batch()?;
            for row in batch.rows() {
                let question = MathsQuestion::from_tokens(&cfg, row)?;
                let (category, tag) = classify(&cfg, row);
                println!("{}  {category}.{tag}", question.to_text(&cfg));
            }
        }
        Command::Accuracy {
            model,
            num_questions,
            enrich,
        } => {
            let model = load_backend(&model, cli.cpu)?;
            let acfg = AblationConfig::new().with_show_failures(cli.verbose);
            println!("=== Correctness on {num_questions} questions ===");
            for summary in
                test_correctness_on_num_questions(model.as_ref(), &cfg, &acfg, num_questions, enrich)?
            {
                let (lo, hi) = summary.wilson_interval()?;
                println!("{summary}, 95% interval [{lo:.6}, {hi:.6}]");
            }
        }
        Command::Analyse {
            model,
            output,
            batches,
            neurons,
            min_perc,
            pairs,
        } => {
            anyhow::ensure!(
                cfg.analysis_seed != cfg.training_seed,
                "Analysis seed must differ from the training seed"
            );
            let model = load_backend(&model, cli.cpu)?;
            info!(
                "Model: {} layers, {} heads, {} neurons",
                model.n_layers(),
                model.n_heads(),
                model.d_mlp()
            );

            let mut generator = QuestionGenerator::new(&cfg, cfg.analysis_seed, true)?;
            let mut questions = QuestionBatch::new(cfg.n_ctx());
            for _ in 0..batches {
                questions.concat(&generator.next_batch()?)?;
            }

            let mut acfg = AblationConfig::new().with_show_failures(cli.verbose);
            let questions = test_questions_by_complexity(model.as_ref(), &cfg, &mut acfg, &questions)?;
            anyhow::ensure!(!questions.is_empty(), "Model answered no analysis question correctly");
            acfg = acfg.with_means(MeanActivations::compute(model.as_ref(), &questions)?);

            let mut registry = UsefulNodeRegistry::new();
            find_useful_positions(model.as_ref(), &cfg, &mut acfg, &mut registry, &questions)?;
            find_useful_nodes(model.as_ref(), &cfg, &mut acfg, &mut registry, &questions, neurons)?;
            calc_attention_tags(model.as_ref(), &cfg, &mut registry, &questions, min_perc)?;
            for subtask in SubTask::ALL {
                search_and_tag(model.as_ref(), &cfg, &mut acfg, &mut registry, subtask, true, pairs)?;
            }

            registry.sort_nodes();
            registry.log_tags();
            registry
                .save(&output)
                .with_context(|| format!("Failed to export nodes to {}", output.display()))?;
            println!(
                "Exported {} useful nodes to {}",
                registry.len(),
                output.display()
            );
        }
    }

    Ok(())
}
