use anyhow::{anyhow, Error};
use candle_core::{Result as CandleResult, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// Exact erf formulation.
    Gelu,
    /// Tanh approximation.
    GeluTanh,
    Relu,
    Silu,
}

impl TryFrom<&str> for Activation {
    type Error = Error;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::GeluTanh),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            other => Err(anyhow!("unsupported activation function: {}", other)),
        }
    }
}

impl Activation {
    pub fn apply(&self, input: &Tensor) -> CandleResult<Tensor> {
        match self {
            Activation::Gelu => input.gelu_erf(),
            // candle's gelu is the tanh approximation
            Activation::GeluTanh => input.gelu(),
            Activation::Relu => input.relu(),
            Activation::Silu => input.silu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_names() {
        assert_eq!(Activation::try_from("silu").unwrap(), Activation::Silu);
        assert_eq!(Activation::try_from("gelu").unwrap(), Activation::Gelu);
        assert_eq!(Activation::try_from("gelu_pytorch_tanh").unwrap(), Activation::GeluTanh);
        assert_eq!(Activation::try_from("relu").unwrap(), Activation::Relu);
        assert!(Activation::try_from("tanh").is_err());
    }

    #[test]
    fn test_gelu_variants_differ() {
        let x = Tensor::new(&[1f32], &candle_core::Device::Cpu).unwrap();
        let exact = Activation::Gelu.apply(&x).unwrap().to_vec1::<f32>().unwrap()[0];
        let approx = Activation::GeluTanh.apply(&x).unwrap().to_vec1::<f32>().unwrap()[0];
        // 0.5 * (1 + erf(1 / sqrt(2))) = 0.841345
        assert!((exact - 0.841_345).abs() < 1e-5, "{exact}");
        assert!((approx - 0.841_192).abs() < 1e-5, "{approx}");
    }
}
