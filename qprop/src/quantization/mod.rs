//! Quantization parameter types and the numeric formulas deriving them.
mod calibration;
mod params;

pub use calibration::{
    accumulator_bias_params, channel_abs_max, channel_ranges, fixed_range_params,
    uniform_from_range, MinMaxQuantizer, WeightRequest,
};
pub use params::{PerAxisParams, QuantParams, StorageType, UniformParams};

/// Storage width of weights whose parameters are inferred from their content.
pub const WEIGHT_BIT_WIDTH: u32 = 8;

/// Largest quantized bias magnitude accepted before bias and filter scales get enlarged. Half of
/// the 32 bit range is kept free for the accumulation itself.
pub const BIAS_MAX: f64 = (i32::MAX / 2) as f64;
