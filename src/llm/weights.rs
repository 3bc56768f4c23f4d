use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

/// Memory-mapped checkpoint plus the device and dtype every tensor is
/// materialised in.
pub struct Weights {
    tensors: MmapedSafetensors,
    device: Device,
    dtype: DType,
}

impl Weights {
    pub fn new(tensors: MmapedSafetensors, device: Device, dtype: DType) -> Self {
        Self {
            tensors,
            device,
            dtype,
        }
    }

    pub fn get(&self, name: &str) -> CandleResult<Tensor> {
        self.get_as(name, self.dtype)
    }

    /// Loads `name` in an explicit dtype instead of the model dtype.
    pub fn get_as(&self, name: &str, dtype: DType) -> CandleResult<Tensor> {
        self.tensors.load(name, &self.device)?.to_dtype(dtype)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.get(name).is_ok()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
