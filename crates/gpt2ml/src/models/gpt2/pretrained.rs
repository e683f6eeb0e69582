//! Import of pretrained GPT-2 checkpoints.
//!
//! Checkpoints published on the hub store their weights under the
//! `GPT2LMHeadModel` state-dict names, either with or without the
//! `transformer.` prefix. The attention and MLP projections are `Conv1D`
//! modules whose weights are stored `(in, out)`, i.e. transposed compared to a
//! `Linear` layer, so they are transposed while being copied.

use crate::models::gpt2::weights::{LM_HEAD_KEY, MASK_SUFFIX, WTE_KEY};
use crate::models::gpt2::{Gpt2, Gpt2ModelType, Gpt2Params, Gpt2Weights, TensorLayout};
use crate::tensor::HostTensor;
use crate::Gpt2Error;
use memmap2::Mmap;
use safetensors::SafeTensors;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

/// Buffer of the legacy attention implementation, never a parameter.
const MASKED_BIAS_SUFFIX: &str = ".attn.masked_bias";
const TRANSFORMER_PREFIX: &str = "transformer.";

/// Weights stored as `Conv1D` in the hub checkpoints.
const TRANSPOSED_SUFFIXES: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

/// A named collection of tensors, such as a checkpoint file.
pub trait WeightSource {
    fn tensor_names(&self) -> Vec<String>;
    fn tensor(&self, name: &str) -> Result<HostTensor, Gpt2Error>;

    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>, Gpt2Error> {
        Ok(self.tensor(name)?.shape().to_vec())
    }
}

impl WeightSource for HashMap<String, HostTensor> {
    fn tensor_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn tensor(&self, name: &str) -> Result<HostTensor, Gpt2Error> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Gpt2Error::MissingTensors(vec![name.to_string()]))
    }

    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>, Gpt2Error> {
        self.get(name)
            .map(|t| t.shape().to_vec())
            .ok_or_else(|| Gpt2Error::MissingTensors(vec![name.to_string()]))
    }
}

/// A memory-mapped `.safetensors` file.
pub struct SafeTensorsFile {
    mmap: Mmap,
    shapes: HashMap<String, Vec<usize>>,
}

impl SafeTensorsFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Gpt2Error> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the file is only read, and is expected not to be modified while mapped.
        let mmap = unsafe { Mmap::map(&file)? };

        let shapes = SafeTensors::deserialize(&mmap)?
            .tensors()
            .into_iter()
            .map(|(name, view)| (name, view.shape().to_vec()))
            .collect::<HashMap<_, _>>();

        log::info!("opened {:?}: {} tensors", path, shapes.len());
        Ok(Self { mmap, shapes })
    }
}

impl WeightSource for SafeTensorsFile {
    fn tensor_names(&self) -> Vec<String> {
        self.shapes.keys().cloned().collect()
    }

    fn tensor(&self, name: &str) -> Result<HostTensor, Gpt2Error> {
        let tensors = SafeTensors::deserialize(&self.mmap)?;
        let view = tensors.tensor(name)?;
        HostTensor::from_view(name, &view)
    }

    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>, Gpt2Error> {
        self.shapes
            .get(name)
            .cloned()
            .ok_or_else(|| Gpt2Error::MissingTensors(vec![name.to_string()]))
    }
}

/// Maps a checkpoint tensor name to the model's state-dict key.
fn normalize_key(name: &str) -> String {
    if name == LM_HEAD_KEY || name.starts_with(TRANSFORMER_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", TRANSFORMER_PREFIX, name)
    }
}

fn is_buffer(key: &str) -> bool {
    key.ends_with(MASK_SUFFIX) || key.ends_with(MASKED_BIAS_SUFFIX)
}

fn layout_of(key: &str) -> TensorLayout {
    if TRANSPOSED_SUFFIXES.iter().any(|s| key.ends_with(s)) {
        TensorLayout::Transposed
    } else {
        TensorLayout::Torch
    }
}

impl Gpt2Weights {
    /// Copies every parameter of a hub checkpoint into freshly allocated weights.
    ///
    /// The mask buffers are ignored. `lm_head.weight` is optional since the head is
    /// tied to the token embedding; when present, only its shape is checked. Fails
    /// if a parameter is missing from `source` or if `source` contains tensors the
    /// model doesn't know about.
    pub fn from_pretrained(
        params: &Gpt2Params,
        source: &impl WeightSource,
    ) -> Result<Self, Gpt2Error> {
        let mut weights = Self::zeros(params);

        // Normalized key -> name in the source. A tensor stored both with and
        // without the prefix is reported under its prefix-less name.
        let mut source_keys: HashMap<String, String> = HashMap::new();
        let mut duplicates = vec![];
        for name in source.tensor_names() {
            let key = normalize_key(&name);
            if is_buffer(&key) {
                continue;
            }
            match source_keys.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(name);
                }
                Entry::Occupied(mut entry) => {
                    let duplicate = if name == *entry.key() {
                        std::mem::replace(entry.get_mut(), name)
                    } else {
                        name
                    };
                    duplicates.push(duplicate);
                }
            }
        }

        let expected = weights.parameter_keys();
        let mut missing: Vec<_> = expected
            .iter()
            .filter(|k| !source_keys.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(Gpt2Error::MissingTensors(missing));
        }

        let known: HashSet<_> = expected.iter().map(|k| k.as_str()).collect();
        let mut unexpected: Vec<_> = source_keys
            .keys()
            .filter(|k| !known.contains(k.as_str()) && k.as_str() != LM_HEAD_KEY)
            .cloned()
            .chain(duplicates)
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(Gpt2Error::UnexpectedTensors(unexpected));
        }

        if let Some(name) = source_keys.get(LM_HEAD_KEY) {
            let found = source.tensor_shape(name)?;
            let expected = weights.param_shape(WTE_KEY).unwrap_or_default();
            if found != expected {
                return Err(Gpt2Error::ShapeMismatch {
                    name: LM_HEAD_KEY.to_string(),
                    expected,
                    found,
                });
            }
        }

        for key in &expected {
            let name = &source_keys[key];
            let tensor = source.tensor(name)?;
            weights.load_param(key, &tensor, layout_of(key))?;
            log::trace!("loaded {} {:?}", key, tensor.shape());
        }

        Ok(weights)
    }
}

impl Gpt2 {
    /// Builds one of the standard GPT-2 models from its checkpoint tensors.
    pub fn from_pretrained(
        model_type: Gpt2ModelType,
        source: &impl WeightSource,
    ) -> Result<Self, Gpt2Error> {
        log::info!("Loading weights from pretrained gpt: {}", model_type);
        let params = Gpt2Params::from_model_type(model_type);
        let weights = Gpt2Weights::from_pretrained(&params, source)?;
        Self::new(params, weights)
    }

    /// Loads a model from a directory containing `config.json` and
    /// `model.safetensors`, the layout of a hub model repository.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, Gpt2Error> {
        let dir = dir.as_ref();
        let config = std::fs::read_to_string(dir.join("config.json"))?;
        let params = Gpt2Params::from_hf_config(&config)?;
        let source = SafeTensorsFile::open(dir.join("model.safetensors"))?;

        log::info!(
            "loading a {}-layer model ({} parameters) from {:?}",
            params.n_layer,
            params.num_parameters(),
            dir
        );
        let weights = Gpt2Weights::from_pretrained(&params, &source)?;
        Self::new(params, weights)
    }
}
