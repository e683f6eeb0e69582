use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use gpt2ml::models::gpt2::{Gpt2, Gpt2ModelType, Gpt2Params};
use gpt2ml::models::sampler::Sampler;
use gpt2ml::ops::SoftMax;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Where the model weights come from.
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Directory containing `config.json` and `model.safetensors`.
    #[arg(long, global = true, conflicts_with_all = ["hub", "random"])]
    pub weights: Option<PathBuf>,

    /// Download a pretrained checkpoint (gpt2, gpt2-medium, gpt2-large, gpt2-xl).
    #[arg(long, global = true, value_parser = parse_model_type, conflicts_with = "random")]
    pub hub: Option<Gpt2ModelType>,

    /// Randomly initialize a model with the dimensions of the given checkpoint.
    #[arg(long, global = true, value_parser = parse_model_type)]
    pub random: Option<Gpt2ModelType>,

    /// Seed of the random initialization.
    #[arg(long, global = true, default_value_t = 0)]
    pub seed: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the model hyperparameters.
    Info,
    /// Sample a continuation of a prompt.
    Generate {
        /// Comma-separated token ids.
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 32)]
        max_new_tokens: usize,
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
        #[arg(long, default_value_t = 0.9)]
        top_p: f32,
        /// 0 disables top-k truncation.
        #[arg(long, default_value_t = 0)]
        top_k: usize,
        /// Seed of the sampler. Random if unset.
        #[arg(long)]
        sampler_seed: Option<u64>,
        /// Token ending the generation, e.g. 50256 (<|endoftext|>).
        #[arg(long)]
        stop: Option<usize>,
    },
    /// Compute the next-token cross-entropy of a token sequence.
    Score {
        /// Comma-separated token ids (at least two).
        #[arg(long)]
        tokens: String,
    },
}

fn parse_model_type(s: &str) -> Result<Gpt2ModelType, String> {
    s.parse().map_err(|e: gpt2ml::Gpt2Error| e.to_string())
}

fn parse_tokens(s: &str) -> anyhow::Result<Vec<usize>> {
    s.split(',')
        .map(|tok| {
            tok.trim()
                .parse()
                .with_context(|| format!("invalid token id `{}`", tok))
        })
        .collect()
}

fn load_model(args: &ModelArgs) -> anyhow::Result<Gpt2> {
    let t_load = Instant::now();
    let model = if let Some(dir) = &args.weights {
        println!("{}", format!("Loading weights from {:?}", dir).dimmed());
        Gpt2::load_dir(dir)?
    } else if let Some(model_type) = args.hub {
        println!("{}", format!("Fetching {} from the hub", model_type).dimmed());
        Gpt2::from_hub(model_type)?
    } else if let Some(model_type) = args.random {
        println!(
            "{}",
            format!("Initializing a random {} (seed {})", model_type, args.seed).dimmed()
        );
        Gpt2::new_random(Gpt2Params::from_model_type(model_type), args.seed)?
    } else {
        return Err(anyhow!(
            "no model provided, use one of --weights, --hub or --random"
        ));
    };

    println!(
        "{}",
        format!("Model ready in {:.2} seconds.", t_load.elapsed().as_secs_f32()).dimmed()
    );
    Ok(model)
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let model = load_model(&cli.model)?;

    match &cli.command {
        Command::Info => print_info(model.params()),
        Command::Generate {
            prompt,
            max_new_tokens,
            temperature,
            top_p,
            top_k,
            sampler_seed,
            stop,
        } => {
            let prompt = parse_tokens(prompt)?;
            let mut sampler =
                Sampler::new(model.params().n_vocab, *temperature, *top_p).with_top_k(*top_k);
            if let Some(seed) = sampler_seed {
                sampler = sampler.with_seed(*seed);
            }
            generate(&model, &prompt, *max_new_tokens, &mut sampler, *stop)?;
        }
        Command::Score { tokens } => score(&model, &parse_tokens(tokens)?)?,
    }

    Ok(())
}

fn print_info(params: &Gpt2Params) {
    println!("{}", "[Model]".green().bold());
    println!("  vocabulary:   {}", params.n_vocab);
    println!("  block size:   {}", params.n_seq);
    println!("  embedding:    {}", params.n_embd);
    println!("  heads:        {} (size {})", params.n_head, params.head_size());
    println!("  layers:       {}", params.n_layer);
    println!("  activation:   {:?}", params.activation);
    println!("  parameters:   {}", params.num_parameters());
}

fn generate(
    model: &Gpt2,
    prompt: &[usize],
    max_new_tokens: usize,
    sampler: &mut Sampler,
    stop: Option<usize>,
) -> anyhow::Result<()> {
    println!("{}", "[Prompt]".purple().bold());
    println!("{:?}", prompt);
    println!("{}", "[Generated]".green().bold());

    let t_gen = Instant::now();
    let mut stdout = std::io::stdout();
    let generated = model.generate(prompt, max_new_tokens, sampler, stop, |token| {
        print!("{} ", token);
        stdout.flush().is_ok()
    })?;
    println!();

    let tok_per_second = generated.len() as f32 / t_gen.elapsed().as_secs_f32();
    println!(
        "{}",
        format!(
            "({:.2} tok/s) − generated {} tokens",
            tok_per_second,
            generated.len()
        )
        .italic()
        .dimmed()
    );
    Ok(())
}

fn score(model: &Gpt2, tokens: &[usize]) -> anyhow::Result<()> {
    if tokens.len() < 2 {
        return Err(anyhow!("at least two tokens are needed to compute a loss"));
    }

    let (inputs, targets) = (&tokens[..tokens.len() - 1], &tokens[1..]);
    let mut logits = model.forward(inputs)?;

    println!("{}", "[Log-probabilities]".green().bold());
    for (t, target) in targets.iter().enumerate() {
        let mut log_probs = logits.column_mut(t);
        SoftMax::log_softmax_cpu(&mut log_probs);
        println!("  {:>6} -> {:>6}: {:.4}", inputs[t], target, log_probs[*target]);
    }

    let loss = model.loss(inputs, targets)?;
    log::debug!("scored {} tokens", targets.len());
    println!("{}", format!("loss: {:.4}", loss).bold());
    println!("{}", format!("perplexity: {:.2}", loss.exp()).dimmed());
    Ok(())
}
