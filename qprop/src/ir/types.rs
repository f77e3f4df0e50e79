use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantization::QuantParams;

/// Floating point formats a quantized element can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatKind {
    F16,
    F32,
    F64,
}

impl fmt::Display for FloatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatKind::F16 => write!(f, "f16"),
            FloatKind::F32 => write!(f, "f32"),
            FloatKind::F64 => write!(f, "f64"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementType {
    Float {
        width: FloatKind,
    },
    Int {
        bits: u32,
        signed: bool,
    },
    /// Integer storage carrying quantization parameters, standing for values of `expressed`.
    Quantized {
        params: QuantParams,
        expressed: FloatKind,
    },
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Float { width } => write!(f, "{width}"),
            ElementType::Int { bits, signed: true } => write!(f, "i{bits}"),
            ElementType::Int { bits, signed: false } => write!(f, "u{bits}"),
            ElementType::Quantized { params, expressed } => {
                write!(f, "quant<{params}:{expressed}>")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorType {
    pub shape: Vec<usize>,
    pub element: ElementType,
}

impl TensorType {
    pub fn new(shape: Vec<usize>, element: ElementType) -> Self {
        Self { shape, element }
    }

    /// A `f32` tensor of the given shape.
    pub fn float(shape: impl Into<Vec<usize>>) -> Self {
        Self::new(
            shape.into(),
            ElementType::Float {
                width: FloatKind::F32,
            },
        )
    }

    pub fn int(shape: impl Into<Vec<usize>>, bits: u32) -> Self {
        Self::new(shape.into(), ElementType::Int { bits, signed: true })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_float(&self) -> bool {
        matches!(self.element, ElementType::Float { .. })
    }

    pub fn is_quantized(&self) -> bool {
        self.quant_params().is_some()
    }

    pub fn quant_params(&self) -> Option<&QuantParams> {
        match &self.element {
            ElementType::Quantized { params, .. } => Some(params),
            _ => None,
        }
    }

    pub fn float_kind(&self) -> Option<FloatKind> {
        match &self.element {
            ElementType::Float { width } => Some(*width),
            ElementType::Quantized { expressed, .. } => Some(*expressed),
            ElementType::Int { .. } => None,
        }
    }

    /// The floating point type this tensor stands for: itself when already float, the expressed
    /// type when quantized, nothing for plain integers.
    pub fn expressed_type(&self) -> Option<TensorType> {
        self.float_kind().map(|width| {
            TensorType::new(self.shape.clone(), ElementType::Float { width })
        })
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<")?;
        for dim in &self.shape {
            write!(f, "{dim}x")?;
        }
        write!(f, "{}>", self.element)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::quantization::{StorageType, UniformParams};

    #[test]
    fn test_expressed_type() {
        let float = TensorType::float(vec![2, 3]);
        assert_eq!(float.expressed_type(), Some(float.clone()));
        assert_eq!(float.num_elements(), 6);

        let quantized = TensorType::new(
            vec![2, 3],
            ElementType::Quantized {
                params: QuantParams::PerTensor(UniformParams::new(
                    StorageType::new(8, true, false),
                    0.5,
                    0,
                )),
                expressed: FloatKind::F32,
            },
        );
        assert!(quantized.is_quantized());
        assert!(!quantized.is_float());
        assert_eq!(quantized.expressed_type(), Some(float));

        assert_eq!(TensorType::int(vec![4], 32).expressed_type(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TensorType::float(vec![1, 4]).to_string(), "tensor<1x4xf32>");
        assert_eq!(TensorType::int(vec![4], 32).to_string(), "tensor<4xi32>");
    }
}
