use crate::ops::UnaryOp;
use crate::Gpt2Error;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// The pretrained GPT-2 checkpoints published on the Hugging Face hub.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Gpt2ModelType {
    Gpt2,
    Gpt2Medium,
    Gpt2Large,
    Gpt2Xl,
}

impl Gpt2ModelType {
    pub const ALL: [Self; 4] = [Self::Gpt2, Self::Gpt2Medium, Self::Gpt2Large, Self::Gpt2Xl];

    /// Name of the model repository on the hub.
    pub fn hub_repo(self) -> &'static str {
        match self {
            Self::Gpt2 => "gpt2",
            Self::Gpt2Medium => "gpt2-medium",
            Self::Gpt2Large => "gpt2-large",
            Self::Gpt2Xl => "gpt2-xl",
        }
    }

    /// `(n_layer, n_head, n_embd)` of the checkpoint.
    pub fn dimensions(self) -> (usize, usize, usize) {
        match self {
            Self::Gpt2 => (12, 12, 768),        // 124M params
            Self::Gpt2Medium => (24, 16, 1024), // 350M params
            Self::Gpt2Large => (36, 20, 1280),  // 774M params
            Self::Gpt2Xl => (48, 25, 1600),     // 1558M params
        }
    }
}

impl FromStr for Gpt2ModelType {
    type Err = Gpt2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.hub_repo() == s)
            .ok_or_else(|| Gpt2Error::UnknownModelType(s.to_string()))
    }
}

impl fmt::Display for Gpt2ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hub_repo())
    }
}

/// Hyperparameters of a GPT-2 model.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Gpt2Params {
    /// Vocabulary size.
    pub n_vocab: usize,
    /// Block size: the maximum context length.
    pub n_seq: usize,
    /// Embedding (hidden state) width.
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    /// Output width of the fused QKV projection.
    pub attn_b: usize,
    /// Hidden width of the feed-forward network.
    pub ff_len: usize,
    pub layer_norm_eps: f32,
    pub activation: UnaryOp,
}

impl Default for Gpt2Params {
    fn default() -> Self {
        Self::new(50257, 1024, 768, 12, 12)
    }
}

impl Gpt2Params {
    pub fn new(n_vocab: usize, n_seq: usize, n_embd: usize, n_head: usize, n_layer: usize) -> Self {
        Self {
            n_vocab,
            n_seq,
            n_embd,
            n_head,
            n_layer,
            attn_b: 3 * n_embd,
            ff_len: 4 * n_embd,
            layer_norm_eps: 1.0e-5,
            activation: UnaryOp::Gelu,
        }
    }

    pub fn from_model_type(model_type: Gpt2ModelType) -> Self {
        let (n_layer, n_head, n_embd) = model_type.dimensions();
        Self::new(50257, 1024, n_embd, n_head, n_layer)
    }

    /// Parses the `config.json` shipped with hub checkpoints.
    pub fn from_hf_config(json: &str) -> Result<Self, Gpt2Error> {
        let hf: HfGpt2Config = serde_json::from_str(json)?;
        let n_seq = hf.n_positions.or(hf.n_ctx).ok_or_else(|| {
            Gpt2Error::InvalidConfig("neither `n_positions` nor `n_ctx` is set".to_string())
        })?;

        let mut params = Self::new(hf.vocab_size, n_seq, hf.n_embd, hf.n_head, hf.n_layer);
        params.layer_norm_eps = hf.layer_norm_epsilon;
        if let Some(name) = &hf.activation_function {
            params.activation = UnaryOp::from_hf_name(name).ok_or_else(|| {
                Gpt2Error::InvalidConfig(format!("unsupported activation function `{}`", name))
            })?;
        }
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), Gpt2Error> {
        let dims = [
            ("n_vocab", self.n_vocab),
            ("n_seq", self.n_seq),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, dim)| *dim == 0) {
            return Err(Gpt2Error::InvalidConfig(format!("`{}` must be non-zero", name)));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(Gpt2Error::InvalidConfig(format!(
                "n_embd ({}) is not divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.attn_b != 3 * self.n_embd {
            return Err(Gpt2Error::InvalidConfig(format!(
                "attn_b ({}) must be 3 * n_embd",
                self.attn_b
            )));
        }
        Ok(())
    }

    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Number of learned parameters. The output head is tied to the token
    /// embedding, so it isn't counted twice.
    pub fn num_parameters(&self) -> usize {
        let per_layer = 2 * self.n_embd // ln_1
            + self.attn_b * self.n_embd + self.attn_b // c_attn
            + self.n_embd * self.n_embd + self.n_embd // attn.c_proj
            + 2 * self.n_embd // ln_2
            + self.ff_len * self.n_embd + self.ff_len // c_fc
            + self.n_embd * self.ff_len + self.n_embd; // mlp.c_proj

        self.n_vocab * self.n_embd
            + self.n_seq * self.n_embd
            + self.n_layer * per_layer
            + 2 * self.n_embd
    }
}

#[derive(Clone, Debug, Deserialize)]
struct HfGpt2Config {
    vocab_size: usize,
    n_positions: Option<usize>,
    n_ctx: Option<usize>,
    n_embd: usize,
    n_layer: usize,
    n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    layer_norm_epsilon: f32,
    #[serde(default)]
    activation_function: Option<String>,
}

fn default_layer_norm_epsilon() -> f32 {
    1.0e-5
}

#[cfg(test)]
mod test {
    use super::{Gpt2ModelType, Gpt2Params};
    use crate::ops::UnaryOp;

    const GPT2_CONFIG_JSON: &str = r#"{
        "activation_function": "gelu_new",
        "architectures": ["GPT2LMHeadModel"],
        "layer_norm_epsilon": 1e-05,
        "model_type": "gpt2",
        "n_ctx": 1024,
        "n_embd": 768,
        "n_head": 12,
        "n_layer": 12,
        "n_positions": 1024,
        "vocab_size": 50257
    }"#;

    #[test]
    fn default_is_gpt2_small() {
        let params = Gpt2Params::default();
        assert_eq!(params, Gpt2Params::from_model_type(Gpt2ModelType::Gpt2));
        assert_eq!(params.attn_b, 2304);
        assert_eq!(params.ff_len, 3072);
        assert_eq!(params.head_size(), 64);
        // The well known 124M figure.
        assert_eq!(params.num_parameters(), 124_439_808);
    }

    #[test]
    fn presets() {
        for model_type in Gpt2ModelType::ALL {
            let params = Gpt2Params::from_model_type(model_type);
            params.validate().unwrap();
            assert_eq!(model_type.to_string().parse::<Gpt2ModelType>().unwrap(), model_type);
        }

        let xl = Gpt2Params::from_model_type("gpt2-xl".parse().unwrap());
        assert_eq!((xl.n_layer, xl.n_head, xl.n_embd), (48, 25, 1600));
        assert!("gpt3".parse::<Gpt2ModelType>().is_err());
    }

    #[test]
    fn parse_hf_config() {
        let params = Gpt2Params::from_hf_config(GPT2_CONFIG_JSON).unwrap();
        assert_eq!(params, Gpt2Params::default());

        let tiny = Gpt2Params::from_hf_config(
            r#"{"vocab_size": 11, "n_ctx": 8, "n_embd": 16, "n_layer": 2, "n_head": 4,
                "activation_function": "relu"}"#,
        )
        .unwrap();
        assert_eq!(tiny.n_seq, 8);
        assert_eq!(tiny.activation, UnaryOp::Relu);
    }

    #[test]
    fn reject_invalid_configs() {
        assert!(Gpt2Params::new(10, 8, 10, 3, 1).validate().is_err());
        assert!(Gpt2Params::new(0, 8, 12, 3, 1).validate().is_err());
        assert!(Gpt2Params::from_hf_config(
            r#"{"vocab_size": 11, "n_embd": 16, "n_layer": 2, "n_head": 4}"#
        )
        .is_err());
        assert!(Gpt2Params::from_hf_config(
            r#"{"vocab_size": 11, "n_ctx": 8, "n_embd": 16, "n_layer": 2, "n_head": 4,
                "activation_function": "swish"}"#
        )
        .is_err());
    }
}
