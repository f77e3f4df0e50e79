//! Parameter derivation from observed ranges: weight content, accumulator scales for biases and
//! fixed activation ranges.
use itertools::Itertools;
use tracing::trace;

use super::params::{QuantParams, StorageType};
use crate::{config::SUPPORTED_BIT_WIDTHS, ir::TensorType, rules::WeightQuantizer};

/// What the engine asks of a [`WeightQuantizer`] for a single constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightRequest {
    /// Quantize per slice along this axis instead of per tensor.
    pub axis: Option<usize>,
    pub symmetric: bool,
    pub bits: u32,
    pub signed: bool,
    pub narrow_range: bool,
    /// Compute scales in single precision, matching older converters bit for bit.
    pub legacy_float_scale: bool,
}

/// Derives weight parameters from the minimum and maximum of the content.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinMaxQuantizer;

impl WeightQuantizer for MinMaxQuantizer {
    fn weight_params(
        &self,
        ty: &TensorType,
        values: &[f64],
        request: &WeightRequest,
    ) -> Option<QuantParams> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let storage = StorageType::new(request.bits, request.signed, request.narrow_range);
        match request.axis {
            None => {
                let (min, max) = values
                    .iter()
                    .copied()
                    .minmax()
                    .into_option()
                    .unwrap_or((0.0, 0.0));
                let (scale, zero_point) = uniform_from_range(
                    min,
                    max,
                    request.symmetric,
                    &storage,
                    request.legacy_float_scale,
                );
                Some(QuantParams::per_tensor(storage, scale, zero_point))
            }
            Some(axis) => {
                let ranges = channel_ranges(&ty.shape, values, axis)?;
                trace!(axis, channels = ranges.len(), "per-axis weight range");
                let (scales, zero_points) = ranges
                    .into_iter()
                    .map(|(min, max)| {
                        uniform_from_range(
                            min,
                            max,
                            request.symmetric,
                            &storage,
                            request.legacy_float_scale,
                        )
                    })
                    .unzip();
                Some(QuantParams::per_axis(storage, scales, zero_points, axis))
            }
        }
    }
}

/// Scale and nudged zero-point mapping `[min, max]` onto `storage`. The range is always widened
/// to contain zero so that zero is exactly representable.
pub fn uniform_from_range(
    min: f64,
    max: f64,
    symmetric: bool,
    storage: &StorageType,
    legacy_float_scale: bool,
) -> (f64, i64) {
    let (mut min, mut max) = (min.min(0.0), max.max(0.0));
    if symmetric {
        let bound = min.abs().max(max.abs());
        (min, max) = (-bound, bound);
    }
    if (max - min).abs() < f64::EPSILON {
        // all zeros: any scale works, zero maps onto the lowest code
        return (1.0, storage.min);
    }
    let (qmin, qmax) = (storage.min as f64, storage.max as f64);
    let scale = if legacy_float_scale {
        ((max as f32 - min as f32) / (qmax - qmin) as f32) as f64
    } else {
        (max - min) / (qmax - qmin)
    };
    let zero_point_from_min = qmin - min / scale;
    let zero_point = if zero_point_from_min < qmin {
        storage.min
    } else if zero_point_from_min > qmax {
        storage.max
    } else {
        zero_point_from_min.round() as i64
    };
    (scale, zero_point)
}

/// Minimum and maximum of every slice of a row-major tensor along `axis`.
pub fn channel_ranges(shape: &[usize], values: &[f64], axis: usize) -> Option<Vec<(f64, f64)>> {
    let channels = *shape.get(axis)?;
    let inner: usize = shape[axis + 1..].iter().product();
    if channels == 0 || inner == 0 || values.len() != shape.iter().product::<usize>() {
        return None;
    }
    let mut ranges = vec![(f64::INFINITY, f64::NEG_INFINITY); channels];
    for (i, value) in values.iter().enumerate() {
        let (min, max) = &mut ranges[(i / inner) % channels];
        *min = min.min(*value);
        *max = max.max(*value);
    }
    Some(ranges)
}

/// Largest magnitude of every slice along `axis`, or of the whole tensor when `axis` is `None`.
pub fn channel_abs_max(shape: &[usize], values: &[f64], axis: Option<usize>) -> Option<Vec<f64>> {
    match axis {
        None => Some(vec![values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))]),
        Some(axis) => channel_ranges(shape, values, axis).map(|ranges| {
            ranges
                .into_iter()
                .map(|(min, max)| min.abs().max(max.abs()))
                .collect()
        }),
    }
}

/// Bias parameters for an accumulator fed by `operands`: the scale is the product of the operand
/// scales (per channel when any operand is per-axis), the zero-point is 0 and the storage is a
/// full range signed 32 bit integer. Returns `None` while any operand is still unknown.
pub fn accumulator_bias_params(
    operands: &[Option<QuantParams>],
    adjusted_axis: Option<usize>,
    legacy_float_scale: bool,
) -> Option<QuantParams> {
    let operands = operands.iter().cloned().collect::<Option<Vec<_>>>()?;
    if operands.is_empty() {
        return None;
    }
    let storage = StorageType::new(32, true, false);
    let channels = operands.iter().filter_map(|p| p.as_per_axis()).map(|p| p.scales.len());
    let channels = match channels.dedup().collect_vec().as_slice() {
        [] => None,
        [single] => Some(*single),
        _ => return None,
    };
    let product = |channel: usize| {
        if legacy_float_scale {
            operands
                .iter()
                .map(|p| scale_at(p, channel) as f32)
                .product::<f32>() as f64
        } else {
            operands.iter().map(|p| scale_at(p, channel)).product::<f64>()
        }
    };
    Some(match channels {
        None => QuantParams::per_tensor(storage, product(0), 0),
        Some(channels) => QuantParams::per_axis(
            storage,
            (0..channels).map(product).collect(),
            vec![0; channels],
            adjusted_axis.unwrap_or(0),
        ),
    })
}

fn scale_at(params: &QuantParams, channel: usize) -> f64 {
    match params {
        QuantParams::PerTensor(p) => p.scale,
        QuantParams::PerAxis(p) => p.scales[channel],
    }
}

/// Parameters pinning the float interval `[min, max]` onto the full `bits` wide range, e.g.
/// `[0, 1]` gets scale `1/256` and `[-1, 1]` gets `1/128` at 8 bits. `None` for widths outside
/// [`SUPPORTED_BIT_WIDTHS`].
pub fn fixed_range_params(min: f64, max: f64, signed: bool, bits: u32) -> Option<QuantParams> {
    if !(min.is_finite() && max.is_finite() && max > min) {
        return None;
    }
    if !SUPPORTED_BIT_WIDTHS.contains(&bits) {
        return None;
    }
    let storage = StorageType::new(bits, signed, false);
    let scale = (max - min) / 2f64.powi(bits as i32);
    let zero_point = (storage.min - (min / scale).round() as i64).clamp(storage.min, storage.max);
    Some(QuantParams::per_tensor(storage, scale, zero_point))
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn request(axis: Option<usize>, symmetric: bool, narrow_range: bool) -> WeightRequest {
        WeightRequest {
            axis,
            symmetric,
            bits: 8,
            signed: true,
            narrow_range,
            legacy_float_scale: false,
        }
    }

    #[test]
    fn test_symmetric_narrow_weight() {
        let ty = TensorType::float(vec![4]);
        let params = MinMaxQuantizer
            .weight_params(&ty, &[-0.5, 0.25, 1.27, 0.0], &request(None, true, true))
            .expect("finite content");
        let p = params.as_per_tensor().expect("per tensor");
        assert_eq!(p.zero_point, 0);
        assert!((p.scale - 0.01).abs() < 1e-12);
        assert_eq!((p.storage.min, p.storage.max), (-127, 127));
    }

    #[test]
    fn test_asymmetric_range_includes_zero() {
        let ty = TensorType::float(vec![2]);
        let params = MinMaxQuantizer
            .weight_params(&ty, &[1.0, 2.55], &request(None, false, false))
            .expect("finite content");
        let p = params.as_per_tensor().expect("per tensor");
        // range widened to [0, 2.55]
        assert!((p.scale - 0.01).abs() < 1e-12);
        assert_eq!(p.zero_point, -128);
    }

    #[test]
    fn test_all_zero_content() {
        let ty = TensorType::float(vec![3]);
        let params = MinMaxQuantizer
            .weight_params(&ty, &[0.0; 3], &request(None, false, false))
            .expect("finite content");
        assert_eq!(params, QuantParams::per_tensor(StorageType::new(8, true, false), 1.0, -128));
    }

    #[rstest]
    #[case::nan(vec![1.0, f64::NAN])]
    #[case::inf(vec![f64::INFINITY, 1.0])]
    #[case::empty(vec![])]
    fn test_unusable_content(#[case] values: Vec<f64>) {
        let ty = TensorType::float(vec![values.len()]);
        assert!(MinMaxQuantizer
            .weight_params(&ty, &values, &request(None, true, true))
            .is_none());
    }

    #[test]
    fn test_per_axis_weight() {
        // two output channels along axis 0
        let ty = TensorType::float(vec![2, 3]);
        let values = [0.5, -1.27, 0.1, 2.54, 0.0, -0.3];
        let params = MinMaxQuantizer
            .weight_params(&ty, &values, &request(Some(0), true, true))
            .expect("finite content");
        let p = params.as_per_axis().expect("per axis");
        assert_eq!(p.axis, 0);
        assert_eq!(p.zero_points, vec![0, 0]);
        assert!((p.scales[0] - 0.01).abs() < 1e-12);
        assert!((p.scales[1] - 0.02).abs() < 1e-12);

        assert!(MinMaxQuantizer
            .weight_params(&ty, &values, &request(Some(2), true, true))
            .is_none());
    }

    #[test]
    fn test_channel_ranges_inner_axis() {
        let ranges = channel_ranges(&[2, 2], &[1.0, -2.0, 3.0, 4.0], 1).expect("valid axis");
        assert_eq!(ranges, vec![(1.0, 3.0), (-2.0, 4.0)]);
        assert_eq!(
            channel_abs_max(&[2, 2], &[1.0, -2.0, 3.0, 4.0], None),
            Some(vec![4.0])
        );
    }

    #[test]
    fn test_accumulator_params() {
        let i8 = StorageType::new(8, true, false);
        let input = QuantParams::per_tensor(i8, 0.5, 3);
        let filter = QuantParams::per_tensor(i8, 0.25, 0);
        let bias = accumulator_bias_params(&[Some(input.clone()), Some(filter)], Some(0), false)
            .expect("both known");
        assert_eq!(
            bias,
            QuantParams::per_tensor(StorageType::new(32, true, false), 0.125, 0)
        );

        let per_axis = QuantParams::per_axis(i8, vec![0.1, 0.2], vec![0, 0], 0);
        let bias = accumulator_bias_params(&[Some(input.clone()), Some(per_axis)], Some(0), false)
            .expect("both known");
        let p = bias.as_per_axis().expect("per axis bias");
        assert!((p.scales[0] - 0.05).abs() < 1e-12);
        assert!((p.scales[1] - 0.1).abs() < 1e-12);

        assert!(accumulator_bias_params(&[Some(input), None], None, false).is_none());
    }

    #[rstest]
    #[case::sigmoid_signed(0.0, 1.0, true, 1.0 / 256.0, -128)]
    #[case::sigmoid_unsigned(0.0, 1.0, false, 1.0 / 256.0, 0)]
    #[case::tanh_signed(-1.0, 1.0, true, 1.0 / 128.0, 0)]
    #[case::tanh_unsigned(-1.0, 1.0, false, 1.0 / 128.0, 128)]
    fn test_fixed_range(
        #[case] min: f64,
        #[case] max: f64,
        #[case] signed: bool,
        #[case] scale: f64,
        #[case] zero_point: i64,
    ) {
        let params = fixed_range_params(min, max, signed, 8).expect("valid range");
        let p = params.as_per_tensor().expect("per tensor");
        assert_eq!(p.scale, scale);
        assert_eq!(p.zero_point, zero_point);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::one(1)]
    #[case::wider_than_storage(64)]
    fn test_fixed_range_rejects_unsupported_width(#[case] bits: u32) {
        assert!(fixed_range_params(0.0, 1.0, true, bits).is_none());
        assert!(fixed_range_params(-1.0, 1.0, false, bits).is_none());
    }
}
