use crate::models::gpt2::Gpt2Params;
use crate::tensor::HostTensor;
use crate::Gpt2Error;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// Suffix of the causal-mask buffer key of each attention layer. The mask isn't
/// a learned parameter and is never imported.
pub const MASK_SUFFIX: &str = ".attn.bias";
/// Key of the output head. It is tied to the token embedding.
pub const LM_HEAD_KEY: &str = "lm_head.weight";
pub const WTE_KEY: &str = "transformer.wte.weight";
pub const WPE_KEY: &str = "transformer.wpe.weight";
const LN_F_G_KEY: &str = "transformer.ln_f.weight";
const LN_F_B_KEY: &str = "transformer.ln_f.bias";
const LAYER_PREFIX: &str = "transformer.h.";

/// Memory layout of a tensor handed to [`Gpt2Weights::load_param`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TensorLayout {
    /// Row-major with the PyTorch shape of the parameter, e.g. `(out, in)` for linear layers.
    Torch,
    /// Row-major and transposed, e.g. `(in, out)` for the hub's `Conv1D` layers.
    Transposed,
}

pub struct Gpt2LayerWeights {
    // Normalization.
    pub ln_1_g: DVector<f32>,
    pub ln_1_b: DVector<f32>,
    pub ln_2_g: DVector<f32>,
    pub ln_2_b: DVector<f32>,

    // attention
    pub c_attn_w: DMatrix<f32>,
    pub c_attn_b: DVector<f32>,
    pub c_proj_w: DMatrix<f32>,
    pub c_proj_b: DVector<f32>,

    // mlp
    pub c_fc_w: DMatrix<f32>,
    pub c_fc_b: DVector<f32>,
    pub mlp_proj_w: DMatrix<f32>,
    pub mlp_proj_b: DVector<f32>,
}

pub struct Gpt2Weights {
    pub wte: DMatrix<f32>, // token embedding, one column per token
    pub wpe: DMatrix<f32>, // position embedding, one column per position
    pub layers: Vec<Gpt2LayerWeights>,
    // Normalization
    pub ln_f_g: DVector<f32>,
    pub ln_f_b: DVector<f32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LayerSlot {
    Ln1G,
    Ln1B,
    CAttnW,
    CAttnB,
    CProjW,
    CProjB,
    Ln2G,
    Ln2B,
    CFcW,
    CFcB,
    MlpProjW,
    MlpProjB,
}

impl LayerSlot {
    const ALL: [(Self, &'static str); 12] = [
        (Self::Ln1G, "ln_1.weight"),
        (Self::Ln1B, "ln_1.bias"),
        (Self::CAttnW, "attn.c_attn.weight"),
        (Self::CAttnB, "attn.c_attn.bias"),
        (Self::CProjW, "attn.c_proj.weight"),
        (Self::CProjB, "attn.c_proj.bias"),
        (Self::Ln2G, "ln_2.weight"),
        (Self::Ln2B, "ln_2.bias"),
        (Self::CFcW, "mlp.c_fc.weight"),
        (Self::CFcB, "mlp.c_fc.bias"),
        (Self::MlpProjW, "mlp.c_proj.weight"),
        (Self::MlpProjB, "mlp.c_proj.bias"),
    ];

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|(_, n)| *n == name).map(|(s, _)| *s)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
    Wte,
    Wpe,
    LnFG,
    LnFB,
    Layer(usize, LayerSlot),
}

impl Slot {
    /// PyTorch shape of the parameter for the given hyperparameters.
    fn expected_shape(self, params: &Gpt2Params) -> Vec<usize> {
        let n_embd = params.n_embd;
        match self {
            Slot::Wte => vec![params.n_vocab, n_embd],
            Slot::Wpe => vec![params.n_seq, n_embd],
            Slot::LnFG | Slot::LnFB => vec![n_embd],
            Slot::Layer(_, slot) => match slot {
                LayerSlot::Ln1G
                | LayerSlot::Ln1B
                | LayerSlot::Ln2G
                | LayerSlot::Ln2B
                | LayerSlot::CProjB
                | LayerSlot::MlpProjB => vec![n_embd],
                LayerSlot::CAttnW => vec![params.attn_b, n_embd],
                LayerSlot::CAttnB => vec![params.attn_b],
                LayerSlot::CProjW => vec![n_embd, n_embd],
                LayerSlot::CFcW => vec![params.ff_len, n_embd],
                LayerSlot::CFcB => vec![params.ff_len],
                LayerSlot::MlpProjW => vec![n_embd, params.ff_len],
            },
        }
    }
}

/// The output head is stored as the token embedding.
fn resolve_alias(key: &str) -> &str {
    if key == LM_HEAD_KEY {
        WTE_KEY
    } else {
        key
    }
}

enum Param<'a> {
    Vector(&'a DVector<f32>),
    /// `(out, in)` matrix of a linear layer.
    Linear(&'a DMatrix<f32>),
    /// `(dim, count)` matrix of an embedding table.
    Embedding(&'a DMatrix<f32>),
}

enum ParamMut<'a> {
    Vector(&'a mut DVector<f32>),
    Linear(&'a mut DMatrix<f32>),
    Embedding(&'a mut DMatrix<f32>),
}

impl Param<'_> {
    /// Shape of the parameter with PyTorch conventions.
    fn torch_shape(&self) -> Vec<usize> {
        match self {
            Self::Vector(v) => vec![v.len()],
            Self::Linear(m) => vec![m.nrows(), m.ncols()],
            Self::Embedding(m) => vec![m.ncols(), m.nrows()],
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Vector(v) => v.len(),
            Self::Linear(m) | Self::Embedding(m) => m.len(),
        }
    }
}

impl Gpt2LayerWeights {
    fn zeros(params: &Gpt2Params) -> Self {
        Self {
            ln_1_g: DVector::repeat(params.n_embd, 1.0),
            ln_1_b: DVector::zeros(params.n_embd),
            ln_2_g: DVector::repeat(params.n_embd, 1.0),
            ln_2_b: DVector::zeros(params.n_embd),
            c_attn_w: DMatrix::zeros(params.attn_b, params.n_embd),
            c_attn_b: DVector::zeros(params.attn_b),
            c_proj_w: DMatrix::zeros(params.n_embd, params.n_embd),
            c_proj_b: DVector::zeros(params.n_embd),
            c_fc_w: DMatrix::zeros(params.ff_len, params.n_embd),
            c_fc_b: DVector::zeros(params.ff_len),
            mlp_proj_w: DMatrix::zeros(params.n_embd, params.ff_len),
            mlp_proj_b: DVector::zeros(params.n_embd),
        }
    }

    fn param(&self, slot: LayerSlot) -> Param<'_> {
        match slot {
            LayerSlot::Ln1G => Param::Vector(&self.ln_1_g),
            LayerSlot::Ln1B => Param::Vector(&self.ln_1_b),
            LayerSlot::CAttnW => Param::Linear(&self.c_attn_w),
            LayerSlot::CAttnB => Param::Vector(&self.c_attn_b),
            LayerSlot::CProjW => Param::Linear(&self.c_proj_w),
            LayerSlot::CProjB => Param::Vector(&self.c_proj_b),
            LayerSlot::Ln2G => Param::Vector(&self.ln_2_g),
            LayerSlot::Ln2B => Param::Vector(&self.ln_2_b),
            LayerSlot::CFcW => Param::Linear(&self.c_fc_w),
            LayerSlot::CFcB => Param::Vector(&self.c_fc_b),
            LayerSlot::MlpProjW => Param::Linear(&self.mlp_proj_w),
            LayerSlot::MlpProjB => Param::Vector(&self.mlp_proj_b),
        }
    }

    fn param_mut(&mut self, slot: LayerSlot) -> ParamMut<'_> {
        match slot {
            LayerSlot::Ln1G => ParamMut::Vector(&mut self.ln_1_g),
            LayerSlot::Ln1B => ParamMut::Vector(&mut self.ln_1_b),
            LayerSlot::CAttnW => ParamMut::Linear(&mut self.c_attn_w),
            LayerSlot::CAttnB => ParamMut::Vector(&mut self.c_attn_b),
            LayerSlot::CProjW => ParamMut::Linear(&mut self.c_proj_w),
            LayerSlot::CProjB => ParamMut::Vector(&mut self.c_proj_b),
            LayerSlot::Ln2G => ParamMut::Vector(&mut self.ln_2_g),
            LayerSlot::Ln2B => ParamMut::Vector(&mut self.ln_2_b),
            LayerSlot::CFcW => ParamMut::Linear(&mut self.c_fc_w),
            LayerSlot::CFcB => ParamMut::Vector(&mut self.c_fc_b),
            LayerSlot::MlpProjW => ParamMut::Linear(&mut self.mlp_proj_w),
            LayerSlot::MlpProjB => ParamMut::Vector(&mut self.mlp_proj_b),
        }
    }
}

impl Gpt2Weights {
    /// Weights with zero matrices and identity layer norms, ready to be overwritten
    /// by an import.
    pub fn zeros(params: &Gpt2Params) -> Self {
        Self {
            wte: DMatrix::zeros(params.n_embd, params.n_vocab),
            wpe: DMatrix::zeros(params.n_embd, params.n_seq),
            layers: (0..params.n_layer)
                .map(|_| Gpt2LayerWeights::zeros(params))
                .collect(),
            ln_f_g: DVector::repeat(params.n_embd, 1.0),
            ln_f_b: DVector::zeros(params.n_embd),
        }
    }

    /// Randomly initialized weights, following the GPT-2 initialization scheme.
    ///
    /// Linear and embedding weights are drawn from `N(0, 0.02)`. The projections
    /// that write into the residual stream are scaled down by `1 / sqrt(2 * n_layer)`.
    pub fn new_random(params: &Gpt2Params, rng: &mut impl Rng) -> Self {
        const STD: f32 = 0.02;
        let proj_std = STD / (2.0 * params.n_layer as f32).sqrt();
        let mut randn = |nrows: usize, ncols: usize, std: f32| {
            DMatrix::from_fn(nrows, ncols, |_, _| rng.sample::<f32, _>(StandardNormal) * std)
        };

        let mut result = Self::zeros(params);
        result.wte = randn(params.n_embd, params.n_vocab, STD);
        result.wpe = randn(params.n_embd, params.n_seq, STD);

        for layer in &mut result.layers {
            layer.c_attn_w = randn(params.attn_b, params.n_embd, STD);
            layer.c_proj_w = randn(params.n_embd, params.n_embd, proj_std);
            layer.c_fc_w = randn(params.ff_len, params.n_embd, STD);
            layer.mlp_proj_w = randn(params.n_embd, params.ff_len, proj_std);
        }

        result
    }

    /// All the state-dict keys of the model, including the causal-mask buffers
    /// (ending with [`MASK_SUFFIX`]) and the tied [`LM_HEAD_KEY`].
    pub fn state_dict_keys(&self) -> Vec<String> {
        let mut keys = vec![WTE_KEY.to_string(), WPE_KEY.to_string()];

        for i_layer in 0..self.layers.len() {
            for (slot, name) in LayerSlot::ALL {
                keys.push(format!("{}{}.{}", LAYER_PREFIX, i_layer, name));
                if slot == LayerSlot::Ln1B {
                    keys.push(format!("{}{}{}", LAYER_PREFIX, i_layer, MASK_SUFFIX));
                }
            }
        }

        keys.push(LN_F_G_KEY.to_string());
        keys.push(LN_F_B_KEY.to_string());
        keys.push(LM_HEAD_KEY.to_string());
        keys
    }

    /// The state-dict keys of the learned parameters. The tied head is
    /// excluded since it aliases the token embedding.
    pub fn parameter_keys(&self) -> Vec<String> {
        self.state_dict_keys()
            .into_iter()
            .filter(|k| !k.ends_with(MASK_SUFFIX) && k != LM_HEAD_KEY)
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameter_keys()
            .iter()
            .filter_map(|k| self.slot(k))
            .map(|slot| self.param(slot).len())
            .sum()
    }

    /// PyTorch shape of the parameter `key`, or `None` if it isn't a parameter.
    pub fn param_shape(&self, key: &str) -> Option<Vec<usize>> {
        self.slot(resolve_alias(key))
            .map(|slot| self.param(slot).torch_shape())
    }

    /// Checks that every parameter has the shape implied by `params`.
    pub fn check_shapes(&self, params: &Gpt2Params) -> Result<(), Gpt2Error> {
        if self.layers.len() != params.n_layer {
            return Err(Gpt2Error::InvalidConfig(format!(
                "expected {} layers, found {}",
                params.n_layer,
                self.layers.len()
            )));
        }

        for key in self.parameter_keys() {
            let Some(slot) = self.slot(&key) else {
                continue;
            };
            let found = self.param(slot).torch_shape();
            let expected = slot.expected_shape(params);
            if found != expected {
                return Err(Gpt2Error::ShapeMismatch {
                    name: key,
                    expected,
                    found,
                });
            }
        }

        Ok(())
    }

    /// Overwrites the parameter `key` with `tensor`.
    pub fn load_param(
        &mut self,
        key: &str,
        tensor: &HostTensor,
        layout: TensorLayout,
    ) -> Result<(), Gpt2Error> {
        let slot = self
            .slot(key)
            .ok_or_else(|| Gpt2Error::UnknownParameter(key.to_string()))?;
        let expected = self.param(slot).torch_shape();
        let mut found = tensor.shape().to_vec();
        if layout == TensorLayout::Transposed {
            found.reverse();
        }

        if found != expected {
            return Err(Gpt2Error::ShapeMismatch {
                name: key.to_string(),
                expected,
                found: tensor.shape().to_vec(),
            });
        }

        let data = tensor.data();
        match (self.param_mut(slot), layout) {
            (ParamMut::Vector(v), _) => v.copy_from_slice(data),
            (ParamMut::Linear(m), TensorLayout::Torch) => {
                *m = DMatrix::from_row_slice(m.nrows(), m.ncols(), data)
            }
            // A row-major `(in, out)` buffer is a column-major `(out, in)` one.
            (ParamMut::Linear(m), TensorLayout::Transposed) => {
                *m = DMatrix::from_column_slice(m.nrows(), m.ncols(), data)
            }
            // Embeddings are `(count, dim)` row-major, i.e. one column per entry.
            (ParamMut::Embedding(m), TensorLayout::Torch) => {
                *m = DMatrix::from_column_slice(m.nrows(), m.ncols(), data)
            }
            (ParamMut::Embedding(m), TensorLayout::Transposed) => {
                *m = DMatrix::from_row_slice(m.nrows(), m.ncols(), data)
            }
        }

        Ok(())
    }

    /// Copies the parameter `key` into a row-major tensor with its PyTorch shape.
    pub fn export_param(&self, key: &str) -> Option<HostTensor> {
        let slot = self.slot(resolve_alias(key))?;
        let param = self.param(slot);
        let shape = param.torch_shape();
        let data = match param {
            Param::Vector(v) => v.as_slice().to_vec(),
            Param::Linear(m) => m.transpose().as_slice().to_vec(),
            Param::Embedding(m) => m.as_slice().to_vec(),
        };
        HostTensor::new(shape, data).ok()
    }

    fn slot(&self, key: &str) -> Option<Slot> {
        match key {
            WTE_KEY => return Some(Slot::Wte),
            WPE_KEY => return Some(Slot::Wpe),
            LN_F_G_KEY => return Some(Slot::LnFG),
            LN_F_B_KEY => return Some(Slot::LnFB),
            _ => {}
        }

        let rest = key.strip_prefix(LAYER_PREFIX)?;
        let (i_layer, name) = rest.split_once('.')?;
        let i_layer: usize = i_layer.parse().ok()?;
        if i_layer >= self.layers.len() {
            return None;
        }
        LayerSlot::parse(name).map(|s| Slot::Layer(i_layer, s))
    }

    fn param(&self, slot: Slot) -> Param<'_> {
        match slot {
            Slot::Wte => Param::Embedding(&self.wte),
            Slot::Wpe => Param::Embedding(&self.wpe),
            Slot::LnFG => Param::Vector(&self.ln_f_g),
            Slot::LnFB => Param::Vector(&self.ln_f_b),
            Slot::Layer(i, s) => self.layers[i].param(s),
        }
    }

    fn param_mut(&mut self, slot: Slot) -> ParamMut<'_> {
        match slot {
            Slot::Wte => ParamMut::Embedding(&mut self.wte),
            Slot::Wpe => ParamMut::Embedding(&mut self.wpe),
            Slot::LnFG => ParamMut::Vector(&mut self.ln_f_g),
            Slot::LnFB => ParamMut::Vector(&mut self.ln_f_b),
            Slot::Layer(i, s) => self.layers[i].param_mut(s),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Gpt2Weights, TensorLayout, LM_HEAD_KEY, MASK_SUFFIX, WTE_KEY};
    use crate::Gpt2Error;
    use nalgebra::{DMatrix, DVector};
    use crate::models::gpt2::Gpt2Params;
    use crate::tensor::HostTensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_params() -> Gpt2Params {
        Gpt2Params::new(11, 8, 16, 4, 2)
    }

    #[test]
    fn state_dict_keys() {
        let weights = Gpt2Weights::zeros(&tiny_params());
        let keys = weights.state_dict_keys();
        // 2 embeddings + 2 * (12 params + 1 mask buffer) + ln_f + lm_head.
        assert_eq!(keys.len(), 2 + 2 * 13 + 2 + 1);
        assert_eq!(keys.last().map(|k| k.as_str()), Some(LM_HEAD_KEY));
        assert!(keys.contains(&"transformer.h.1.attn.bias".to_string()));
        assert!(keys.contains(&"transformer.h.0.mlp.c_proj.weight".to_string()));

        let params = weights.parameter_keys();
        assert_eq!(params.len(), 2 + 2 * 12 + 2);
        assert!(params.iter().all(|k| !k.ends_with(MASK_SUFFIX) && k != LM_HEAD_KEY));
        assert!(params.iter().all(|k| weights.param_shape(k).is_some()));
        assert_eq!(weights.param_shape("transformer.h.0.attn.bias"), None);
        assert_eq!(weights.param_shape("transformer.h.2.ln_1.weight"), None);
    }

    #[test]
    fn param_shapes_follow_torch_conventions() {
        let weights = Gpt2Weights::zeros(&tiny_params());
        assert_eq!(weights.param_shape(WTE_KEY), Some(vec![11, 16]));
        assert_eq!(weights.param_shape("transformer.wpe.weight"), Some(vec![8, 16]));
        assert_eq!(
            weights.param_shape("transformer.h.0.attn.c_attn.weight"),
            Some(vec![48, 16])
        );
        assert_eq!(
            weights.param_shape("transformer.h.1.mlp.c_proj.weight"),
            Some(vec![16, 64])
        );
        assert_eq!(weights.num_parameters(), tiny_params().num_parameters());
    }

    #[test]
    fn lm_head_aliases_the_token_embedding() {
        let params = tiny_params();
        let weights = Gpt2Weights::new_random(&params, &mut StdRng::seed_from_u64(1));
        assert_eq!(weights.param_shape(LM_HEAD_KEY), Some(vec![11, 16]));
        assert_eq!(weights.export_param(LM_HEAD_KEY), weights.export_param(WTE_KEY));
        // Tied, so counted once.
        assert_eq!(weights.num_parameters(), params.num_parameters());
    }

    #[test]
    fn check_shapes_covers_every_parameter() {
        let params = tiny_params();
        Gpt2Weights::zeros(&params).check_shapes(&params).unwrap();

        let mut weights = Gpt2Weights::zeros(&params);
        weights.layers[0].c_proj_b = DVector::zeros(3);
        match weights.check_shapes(&params) {
            Err(Gpt2Error::ShapeMismatch { name, expected, found }) => {
                assert_eq!(name, "transformer.h.0.attn.c_proj.bias");
                assert_eq!((expected, found), (vec![16], vec![3]));
            }
            _ => panic!("expected a shape mismatch"),
        }

        let mut weights = Gpt2Weights::zeros(&params);
        weights.layers[1].mlp_proj_w = DMatrix::zeros(16, 16);
        assert!(weights.check_shapes(&params).is_err());

        let mut weights = Gpt2Weights::zeros(&params);
        weights.ln_f_g = DVector::zeros(15);
        assert!(weights.check_shapes(&params).is_err());

        let mut weights = Gpt2Weights::zeros(&params);
        weights.layers.pop();
        assert!(weights.check_shapes(&params).is_err());
    }

    #[test]
    fn load_torch_and_transposed_layouts() {
        let mut weights = Gpt2Weights::zeros(&Gpt2Params::new(3, 2, 4, 2, 1));
        let key = "transformer.h.0.attn.c_proj.weight";

        // (out, in) row-major.
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let torch = HostTensor::new(vec![4, 4], data.clone()).unwrap();
        weights.load_param(key, &torch, TensorLayout::Torch).unwrap();
        assert_eq!(weights.layers[0].c_proj_w[(1, 2)], 6.0);

        // (in, out) row-major.
        weights.load_param(key, &torch, TensorLayout::Transposed).unwrap();
        assert_eq!(weights.layers[0].c_proj_w[(1, 2)], 9.0);

        // Embedding rows become columns.
        let wte = HostTensor::new(vec![3, 4], (0..12).map(|i| i as f32).collect()).unwrap();
        weights.load_param(WTE_KEY, &wte, TensorLayout::Torch).unwrap();
        assert_eq!(weights.wte.column(2).as_slice(), &[8.0, 9.0, 10.0, 11.0]);
        assert_eq!(weights.export_param(WTE_KEY).unwrap(), wte);
        assert_eq!(weights.export_param(key).unwrap().data()[6], 9.0);
    }

    #[test]
    fn load_rejects_bad_shapes_and_keys() {
        let mut weights = Gpt2Weights::zeros(&tiny_params());
        let c_fc = HostTensor::zeros(vec![16, 64]);
        assert!(weights
            .load_param("transformer.h.0.mlp.c_fc.weight", &c_fc, TensorLayout::Torch)
            .is_err());
        assert!(weights
            .load_param("transformer.h.0.mlp.c_fc.weight", &c_fc, TensorLayout::Transposed)
            .is_ok());
        assert!(weights
            .load_param("transformer.h.0.attn.bias", &c_fc, TensorLayout::Torch)
            .is_err());
    }

    #[test]
    fn random_init_statistics() {
        let params = Gpt2Params::new(64, 32, 64, 4, 8);
        let weights = Gpt2Weights::new_random(&params, &mut StdRng::seed_from_u64(0));

        let std = |m: &DMatrix<f32>| (m.norm_squared() / m.len() as f32).sqrt();
        approx::assert_relative_eq!(std(&weights.wte), 0.02, epsilon = 2.0e-3);
        approx::assert_relative_eq!(std(&weights.layers[0].c_fc_w), 0.02, epsilon = 2.0e-3);
        approx::assert_relative_eq!(
            std(&weights.layers[0].mlp_proj_w),
            0.005,
            epsilon = 5.0e-4
        );
        assert_eq!(weights.layers[3].ln_2_g.sum(), 64.0);
        assert_eq!(weights.layers[3].c_attn_b.sum(), 0.0);
    }
}
