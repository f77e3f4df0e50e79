use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ir::{ElementType, TensorType};

/// Integer storage of a quantized value: bit width, signedness and the clamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageType {
    pub bits: u32,
    pub signed: bool,
    pub min: i64,
    pub max: i64,
}

impl StorageType {
    /// `bits` must lie in `1..=32`. Narrow range drops the lowest representable value.
    pub fn new(bits: u32, signed: bool, narrow_range: bool) -> Self {
        debug_assert!((1..=32).contains(&bits), "unsupported storage width {bits}");
        let (min, max) = Self::full_range(bits, signed);
        Self {
            bits,
            signed,
            min: if narrow_range { min + 1 } else { min },
            max,
        }
    }

    fn full_range(bits: u32, signed: bool) -> (i64, i64) {
        if signed {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        }
    }

    pub fn is_narrow_range(&self) -> bool {
        self.min == Self::full_range(self.bits, self.signed).0 + 1
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.signed { 'i' } else { 'u' };
        write!(f, "{sign}{}", self.bits)?;
        if self.is_narrow_range() {
            write!(f, "<{}:{}>", self.min, self.max)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniformParams {
    pub storage: StorageType,
    pub scale: f64,
    pub zero_point: i64,
}

impl UniformParams {
    pub fn new(storage: StorageType, scale: f64, zero_point: i64) -> Self {
        Self {
            storage,
            scale,
            zero_point,
        }
    }
}

/// One scale / zero-point pair per slice along `axis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerAxisParams {
    pub storage: StorageType,
    pub scales: Vec<f64>,
    pub zero_points: Vec<i64>,
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "granularity", rename_all = "snake_case")]
pub enum QuantParams {
    PerTensor(UniformParams),
    PerAxis(PerAxisParams),
}

impl QuantParams {
    pub fn per_tensor(storage: StorageType, scale: f64, zero_point: i64) -> Self {
        QuantParams::PerTensor(UniformParams::new(storage, scale, zero_point))
    }

    pub fn per_axis(
        storage: StorageType,
        scales: Vec<f64>,
        zero_points: Vec<i64>,
        axis: usize,
    ) -> Self {
        QuantParams::PerAxis(PerAxisParams {
            storage,
            scales,
            zero_points,
            axis,
        })
    }

    pub fn storage(&self) -> &StorageType {
        match self {
            QuantParams::PerTensor(p) => &p.storage,
            QuantParams::PerAxis(p) => &p.storage,
        }
    }

    pub fn bit_width(&self) -> u32 {
        self.storage().bits
    }

    pub fn scales(&self) -> &[f64] {
        match self {
            QuantParams::PerTensor(p) => std::slice::from_ref(&p.scale),
            QuantParams::PerAxis(p) => &p.scales,
        }
    }

    pub fn zero_points(&self) -> &[i64] {
        match self {
            QuantParams::PerTensor(p) => std::slice::from_ref(&p.zero_point),
            QuantParams::PerAxis(p) => &p.zero_points,
        }
    }

    pub fn axis(&self) -> Option<usize> {
        match self {
            QuantParams::PerTensor(_) => None,
            QuantParams::PerAxis(p) => Some(p.axis),
        }
    }

    pub fn as_per_tensor(&self) -> Option<&UniformParams> {
        match self {
            QuantParams::PerTensor(p) => Some(p),
            QuantParams::PerAxis(_) => None,
        }
    }

    pub fn as_per_axis(&self) -> Option<&PerAxisParams> {
        match self {
            QuantParams::PerAxis(p) => Some(p),
            QuantParams::PerTensor(_) => None,
        }
    }

    /// The quantized counterpart of the float tensor type `ty`, or `None` when `ty` is not a
    /// float tensor or these parameters cannot describe it (bad scales, out of range
    /// zero-points, per-axis layout not matching the shape).
    pub fn cast_from_expressed(&self, ty: &TensorType) -> Option<TensorType> {
        let ElementType::Float { width } = ty.element else {
            return None;
        };
        let storage = self.storage();
        let scales_ok = self
            .scales()
            .iter()
            .all(|scale| scale.is_finite() && *scale > 0.0);
        let zero_points_ok = self.zero_points().iter().all(|zp| storage.contains(*zp));
        if !scales_ok || !zero_points_ok {
            return None;
        }
        if let QuantParams::PerAxis(p) = self {
            let channels = ty.shape.get(p.axis);
            if p.scales.len() != p.zero_points.len() || channels != Some(&p.scales.len()) {
                return None;
            }
        }
        Some(TensorType::new(
            ty.shape.clone(),
            ElementType::Quantized {
                params: self.clone(),
                expressed: width,
            },
        ))
    }
}

impl fmt::Display for QuantParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantParams::PerTensor(p) => write!(f, "{}, {}:{}", p.storage, p.scale, p.zero_point),
            QuantParams::PerAxis(p) => write!(
                f,
                "{}:{}, {{{}}}",
                p.storage,
                p.axis,
                p.scales
                    .iter()
                    .zip(&p.zero_points)
                    .map(|(scale, zp)| format!("{scale}:{zp}"))
                    .join(",")
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_storage_ranges() {
        let i8 = StorageType::new(8, true, false);
        assert_eq!((i8.min, i8.max), (-128, 127));
        assert!(!i8.is_narrow_range());

        let narrow = StorageType::new(8, true, true);
        assert_eq!((narrow.min, narrow.max), (-127, 127));
        assert!(narrow.is_narrow_range());
        assert_eq!(narrow.to_string(), "i8<-127:127>");

        let u8 = StorageType::new(8, false, false);
        assert_eq!((u8.min, u8.max), (0, 255));

        let i32 = StorageType::new(32, true, false);
        assert_eq!((i32.min, i32.max), (i32::MIN as i64, i32::MAX as i64));
    }

    #[test]
    fn test_cast_from_expressed() {
        let storage = StorageType::new(8, true, false);
        let params = QuantParams::per_tensor(storage, 0.5, 0);
        let float = TensorType::float(vec![3, 2]);
        let quantized = params.cast_from_expressed(&float).expect("float tensor");
        assert_eq!(quantized.quant_params(), Some(&params));
        // only expressed (float) types can be cast
        assert!(params.cast_from_expressed(&quantized).is_none());
        assert!(params
            .cast_from_expressed(&TensorType::int(vec![3, 2], 32))
            .is_none());

        let degenerate = QuantParams::per_tensor(storage, 0.0, 0);
        assert!(degenerate.cast_from_expressed(&float).is_none());
        let out_of_range = QuantParams::per_tensor(storage, 1.0, 300);
        assert!(out_of_range.cast_from_expressed(&float).is_none());
    }

    #[test]
    fn test_per_axis_cast_checks_layout() {
        let storage = StorageType::new(8, true, true);
        let params = QuantParams::per_axis(storage, vec![0.1, 0.2, 0.3], vec![0, 0, 0], 0);
        assert!(params
            .cast_from_expressed(&TensorType::float(vec![3, 2]))
            .is_some());
        assert!(params
            .cast_from_expressed(&TensorType::float(vec![2, 3]))
            .is_none());
        assert!(params
            .cast_from_expressed(&TensorType::float(vec![3]))
            .is_some());
        assert_eq!(params.axis(), Some(0));
        assert_eq!(params.scales().len(), 3);
    }
}
