#![warn(clippy::all, rust_2018_idioms)]

use clap::Parser;
use colored::Colorize;
use gpt2ml::models::gpt2::{Gpt2, Gpt2ModelType, Gpt2Params, Gpt2State};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

/// Compares full-sequence prefill with KV-cached decoding on a random model.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Dimensions of the benchmarked model.
    #[arg(long, default_value = "gpt2", value_parser = parse_model_type)]
    model: Gpt2ModelType,

    /// Overrides the number of layers of the preset.
    #[arg(long)]
    n_layer: Option<usize>,

    /// Length of the benchmarked sequence.
    #[arg(long, default_value_t = 64)]
    tokens: usize,

    #[arg(long, default_value_t = 3)]
    runs: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn parse_model_type(s: &str) -> Result<Gpt2ModelType, String> {
    s.parse().map_err(|e: gpt2ml::Gpt2Error| e.to_string())
}

#[derive(Debug, Copy, Clone)]
struct BenchEntry {
    prefill: f32,
    decode: f32,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut params = Gpt2Params::from_model_type(cli.model);
    if let Some(n_layer) = cli.n_layer {
        params.n_layer = n_layer;
    }
    let seq_len = cli.tokens.clamp(1, params.n_seq);

    println!(
        "{}",
        format!(
            "Initializing a random {} ({} layers, {} parameters).",
            cli.model,
            params.n_layer,
            params.num_parameters()
        )
        .dimmed()
    );
    let model = Gpt2::new_random(params, cli.seed)?;
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let tokens: Vec<usize> = (0..seq_len).map(|_| rng.gen_range(0..params.n_vocab)).collect();

    let mut best = BenchEntry {
        prefill: f32::MAX,
        decode: f32::MAX,
    };

    for run in 0..cli.runs {
        let t_prefill = Instant::now();
        let full = model.forward(&tokens)?;
        let prefill = t_prefill.elapsed().as_secs_f32();

        let mut state = Gpt2State::new(model.params());
        let t_decode = Instant::now();
        for (pos, token) in tokens.iter().enumerate() {
            model.forward_token(&mut state, *token, pos)?;
        }
        let decode = t_decode.elapsed().as_secs_f32();

        let err = (state.logits() - full.column(seq_len - 1)).amax();
        println!(
            "run {}: prefill {:.3}s, decode {:.3}s (max logit diff {:.2e})",
            run, prefill, decode, err
        );

        best.prefill = best.prefill.min(prefill);
        best.decode = best.decode.min(decode);
    }

    if cli.runs > 0 {
        println!("{}", format!("[{} tokens]", seq_len).green().bold());
        println!(
            "  prefill: {:>10.2} tok/s",
            seq_len as f32 / best.prefill
        );
        println!(
            "  decode:  {:>10.2} tok/s",
            seq_len as f32 / best.decode
        );
    }

    Ok(())
}
