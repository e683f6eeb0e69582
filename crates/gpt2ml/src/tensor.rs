//! Host-side tensors decoded from checkpoint files.

use crate::Gpt2Error;
use half::{bf16, f16};
use safetensors::tensor::TensorView;
use safetensors::Dtype;

/// A dense, row-major `f32` tensor living in RAM.
///
/// This is the exchange format between weight files and the model: whatever
/// precision a checkpoint stores, it is widened to `f32` here.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, Gpt2Error> {
        let len: usize = shape.iter().product();
        if len != data.len() {
            return Err(Gpt2Error::LengthMismatch {
                expected: len,
                found: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Decodes a safetensors view, widening `F16` and `BF16` to `f32`.
    pub fn from_view(name: &str, view: &TensorView<'_>) -> Result<Self, Gpt2Error> {
        let bytes = view.data();
        let data = match view.dtype() {
            Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            dtype => {
                return Err(Gpt2Error::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{:?}", dtype),
                })
            }
        };

        Self::new(view.shape().to_vec(), data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::HostTensor;
    use half::{bf16, f16};
    use safetensors::tensor::TensorView;
    use safetensors::Dtype;

    #[test]
    fn rejects_inconsistent_shape() {
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert_eq!(HostTensor::zeros(vec![2, 3]).len(), 6);
    }

    #[test]
    fn widens_half_precision() {
        let vals = [1.5f32, -2.25, 0.125];

        let f16_bytes: Vec<u8> = vals
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F16, vec![3], &f16_bytes).unwrap();
        let t = HostTensor::from_view("a", &view).unwrap();
        assert_eq!(t.data(), &vals);

        let bf16_bytes: Vec<u8> = vals
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::BF16, vec![1, 3], &bf16_bytes).unwrap();
        let t = HostTensor::from_view("b", &view).unwrap();
        assert_eq!(t.shape(), &[1, 3]);
        assert_eq!(t.data(), &vals);
    }

    #[test]
    fn rejects_integer_tensors() {
        let bytes = [0u8; 8];
        let view = TensorView::new(Dtype::I64, vec![1], &bytes).unwrap();
        assert!(HostTensor::from_view("ids", &view).is_err());
    }
}
