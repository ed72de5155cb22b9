//! embee CLI - local LLM inference
//!
//! Prime a model once over the prompt, then stream sampled tokens.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rs_embee::{
    utils::{default_dtype, format_bytes, get_device, kv_cache_bytes, parse_dtype, weight_bytes},
    AutoModel, AutoTokenizer, EmbeeError, Engine, ForwardPass, GenerationConfig,
    GenerationSummary, Tokenizer,
};

type CliEngine = Engine<Box<dyn ForwardPass>, AutoTokenizer>;

#[derive(Parser)]
#[command(name = "embee")]
#[command(author, version, about = "Local LLM inference runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a prompt
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        /// Input prompt
        #[arg(short, long)]
        prompt: String,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Show a progress bar and print the text at the end
        #[arg(long)]
        no_stream: bool,
    },

    /// Interactive chat mode
    Chat {
        #[command(flatten)]
        model: ModelArgs,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Show information about a model
    Info {
        /// Model weight file or directory
        #[arg(short, long)]
        model: PathBuf,
    },

    /// Print the highest next-token scores for a prompt
    Logits {
        #[command(flatten)]
        model: ModelArgs,

        /// Input prompt
        #[arg(short, long)]
        prompt: String,

        /// Number of entries to show
        #[arg(long, default_value = "10")]
        top_k: usize,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Model weight file or directory (config.json beside the weights)
    #[arg(short, long)]
    model: PathBuf,

    /// tokenizer.json (defaults to the one beside the model)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// GPU device ID (auto-detect if not specified)
    #[arg(long)]
    device: Option<usize>,

    /// Compute dtype: f32, f16 or bf16
    #[arg(long)]
    dtype: Option<String>,
}

#[derive(Args)]
struct SamplingArgs {
    /// JSON file with generation settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum tokens to generate
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sampling temperature (0.0 = greedy)
    #[arg(long)]
    temperature: Option<f32>,

    /// Top-p sampling threshold
    #[arg(long)]
    top_p: Option<f32>,

    /// Repetition penalty (1.0 = off)
    #[arg(long)]
    repetition_penalty: Option<f32>,

    /// Random seed for reproducible output
    #[arg(long, env = "EMBEE_SEED")]
    seed: Option<u64>,

    /// Reallocate the KV cache for every call
    #[arg(long)]
    no_cache: bool,
}

impl SamplingArgs {
    fn to_config(&self) -> anyhow::Result<GenerationConfig> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => GenerationConfig::default(),
        };

        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_length(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }
        if let Some(top_p) = self.top_p {
            config = config.with_top_p(top_p);
        }
        if let Some(penalty) = self.repetition_penalty {
            config = config.with_repetition_penalty(penalty);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if self.no_cache {
            config = config.with_cache(false);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_embee=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            prompt,
            sampling,
            no_stream,
        } => {
            let config = sampling.to_config()?;
            let mut engine = load_engine(&model)?;
            generate(&mut engine, &prompt, &config, !no_stream)?;
        }

        Commands::Chat {
            model,
            system,
            sampling,
        } => {
            let config = sampling.to_config()?;
            let mut engine = load_engine(&model)?;
            chat(&mut engine, system.as_deref(), &config)?;
        }

        Commands::Info { model } => {
            show_info(&model)?;
        }

        Commands::Logits {
            model,
            prompt,
            top_k,
        } => {
            let mut engine = load_engine(&model)?;
            show_logits(&mut engine, &prompt, top_k)?;
        }
    }

    Ok(())
}

fn load_engine(args: &ModelArgs) -> anyhow::Result<CliEngine> {
    println!("Loading model: {}", args.model.display());

    let device = get_device(args.device)?;
    println!("Using device: {:?}", device);

    let dtype = args.dtype.as_deref().map(parse_dtype).transpose()?;
    let model = AutoModel::from_path(&args.model, Some(device), dtype)?;

    let tokenizer = match &args.tokenizer {
        Some(path) => AutoTokenizer::from_path(path)?,
        None => AutoTokenizer::for_model(&args.model)?,
    };

    Ok(Engine::new(model, tokenizer)?)
}

fn generate(
    engine: &mut CliEngine,
    prompt: &str,
    config: &GenerationConfig,
    stream: bool,
) -> anyhow::Result<()> {
    println!("\nGenerating...\n");
    let started = Instant::now();

    let summary = if stream {
        print!("{prompt}");
        io::stdout().flush()?;

        let summary = engine.generate_streaming(prompt, config, |_, text| {
            print!("{text}");
            // a closed stdout stops generation
            io::stdout().flush().is_ok()
        })?;
        println!();
        summary
    } else {
        let pb = ProgressBar::new(config.max_length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len}")?,
        );

        let mut text = prompt.to_string();
        let summary = engine.generate_streaming(prompt, config, |_, fragment| {
            text.push_str(fragment);
            pb.inc(1);
            true
        })?;
        pb.finish_and_clear();

        println!("{text}");
        summary
    };

    println!("\n---");
    print_stats(&summary, started);

    Ok(())
}

fn print_stats(summary: &GenerationSummary, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        summary.num_tokens() as f64 / elapsed
    } else {
        0.0
    };
    println!(
        "Generated {} tokens in {:.2}s ({:.1} tok/s), stopped: {:?}",
        summary.num_tokens(),
        elapsed,
        rate,
        summary.finish_reason
    );
}

fn show_info(model_path: &Path) -> anyhow::Result<()> {
    let (format, config, files) = AutoModel::inspect(model_path)?;

    println!("Model Information");
    println!("=================");
    println!("Format: {} ({} file(s))", format, files.len());
    println!("Architecture: {:?}", config.architecture());
    if let Some(name) = &config.model_name {
        println!("Name: {}", name);
    }
    println!("Vocab size: {}", config.vocab_size);
    println!("Embedding width: {}", config.n_embd);
    println!("MLP width: {}", config.ffn_dim());
    println!("Num layers: {}", config.n_layers);
    println!("Num attention heads: {}", config.n_heads);
    println!("Num KV heads: {}", config.num_kv_heads());
    println!("Head dim: {}", config.head_dim());
    println!("Max sequence length: {}", config.max_seq_len);
    println!("Rotary embeddings: {}", config.is_rope);
    println!("RoPE base: {}", config.rope_freq_base);
    println!("Activation: {:?}", config.activation);
    println!("Quantization: {:?}", config.quant_type);
    println!("Using GQA: {}", config.is_gqa());

    let dtype = default_dtype(&get_device(None)?);
    println!("\nEstimated Memory ({:?})", dtype);
    println!("====================");
    println!("Weights: ~{}", format_bytes(weight_bytes(&config, dtype)));
    println!("KV cache: {}", format_bytes(kv_cache_bytes(&config, dtype)));

    Ok(())
}

fn show_logits(engine: &mut CliEngine, prompt: &str, top_k: usize) -> anyhow::Result<()> {
    let logits = engine.get_logits(prompt)?;

    let mut ranked: Vec<(usize, f32)> = logits.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    println!("{:>8}  {:>10}  text", "token", "score");
    for (id, score) in ranked.into_iter().take(top_k) {
        let token = i32::try_from(id)?;
        let text = engine.tokenizer().decode(&[token])?;
        println!("{:>8}  {:>10.4}  {:?}", token, score, text);
    }

    Ok(())
}

fn chat(
    engine: &mut CliEngine,
    system_prompt: Option<&str>,
    config: &GenerationConfig,
) -> anyhow::Result<()> {
    println!("\nChat mode started. Type 'exit' or 'quit' to end.\n");

    if let Some(system) = system_prompt {
        println!("System: {}\n", system);
    }
    let mut turns: Vec<String> = Vec::new();

    loop {
        print!("You: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Goodbye!");
            break;
        }

        if input.is_empty() {
            continue;
        }

        let prompt = chat_prompt(system_prompt, &turns, input);

        print!("Assistant:");
        io::stdout().flush()?;
        let started = Instant::now();
        let mut reply = String::new();

        let result = engine.generate_streaming(&prompt, config, |_, text| {
            reply.push_str(text);
            print!("{text}");
            io::stdout().flush().is_ok()
        });

        match result {
            Ok(summary) => {
                println!();
                print_stats(&summary, started);
                println!();
                turns.push(format!("User: {}\nAssistant:{}\n\n", input, reply.trim_end()));
            }
            Err(EmbeeError::CacheCapacityExceeded { .. }) => {
                println!("\n(Context too long, dropped earlier turns; please repeat)\n");
                drop_oldest_turns(&mut turns);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// The system prompt, the kept turns, then the new user line
fn chat_prompt(system_prompt: Option<&str>, turns: &[String], input: &str) -> String {
    let mut prompt = String::new();
    if let Some(system) = system_prompt {
        prompt.push_str(&format!("System: {}\n\n", system));
    }
    for turn in turns {
        prompt.push_str(turn);
    }
    prompt.push_str(&format!("User: {}\nAssistant:", input));
    prompt
}

/// Forget the older half of the conversation, at least one turn
fn drop_oldest_turns(turns: &mut Vec<String>) {
    let n = turns.len().div_ceil(2);
    turns.drain(..n);
}
