//! Knobs of a propagation run.
use std::{env, ops::RangeInclusive};

use once_cell::sync::Lazy;
use serde::{de, Deserialize, Deserializer, Serialize};

/// Storage widths fixed output ranges can be quantized to.
pub const SUPPORTED_BIT_WIDTHS: RangeInclusive<u32> = 2..=16;

// Get the default bit width from the environment, falling back to 8
pub static DEFAULT_BIT_WIDTH: Lazy<u32> = Lazy::new(|| {
    env::var("QPROP_BIT_WIDTH")
        .ok()
        .and_then(|val| val.parse::<u32>().ok())
        .filter(|bits| SUPPORTED_BIT_WIDTHS.contains(bits))
        .unwrap_or(8)
});

fn deserialize_bit_width<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let bits = u32::deserialize(deserializer)?;
    if !SUPPORTED_BIT_WIDTHS.contains(&bits) {
        return Err(de::Error::custom(format!(
            "bit_width {bits} is outside {}..={}",
            SUPPORTED_BIT_WIDTHS.start(),
            SUPPORTED_BIT_WIDTHS.end()
        )));
    }
    Ok(bits)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropagationConfig {
    /// Quantize to signed storage. Per-channel weights require it.
    pub signed: bool,
    /// Storage width handed to fixed output range rules.
    #[serde(deserialize_with = "deserialize_bit_width")]
    pub bit_width: u32,
    pub disable_per_channel: bool,
    /// Infer parameters from weight content and fixed activation ranges.
    pub infer_ranges: bool,
    pub legacy_float_scale: bool,
    /// The graph already carries explicit quantize/dequantize pairs; fixed output ranges are
    /// left to them.
    pub qdq_conversion: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            signed: true,
            bit_width: *DEFAULT_BIT_WIDTH,
            disable_per_channel: false,
            infer_ranges: true,
            legacy_float_scale: false,
            qdq_conversion: false,
        }
    }
}

impl PropagationConfig {
    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn with_bit_width(mut self, bit_width: u32) -> Self {
        self.bit_width = bit_width;
        self
    }

    pub fn with_disable_per_channel(mut self, disable: bool) -> Self {
        self.disable_per_channel = disable;
        self
    }

    pub fn with_infer_ranges(mut self, infer: bool) -> Self {
        self.infer_ranges = infer;
        self
    }

    pub fn with_legacy_float_scale(mut self, legacy: bool) -> Self {
        self.legacy_float_scale = legacy;
        self
    }

    pub fn with_qdq_conversion(mut self, qdq: bool) -> Self {
        self.qdq_conversion = qdq;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PropagationConfig =
            serde_json::from_str(r#"{"signed": false, "qdq_conversion": true}"#)
                .expect("valid config");
        assert_eq!(
            config,
            PropagationConfig::default()
                .with_signed(false)
                .with_qdq_conversion(true)
        );
        assert!(config.infer_ranges);
        assert!(serde_json::from_str::<PropagationConfig>(r#"{"bits": 8}"#).is_err());
    }

    #[test]
    fn test_bit_width_is_range_checked() {
        for bits in [0, 1, 17, 64] {
            let json = format!(r#"{{"bit_width": {bits}}}"#);
            let err = serde_json::from_str::<PropagationConfig>(&json).expect_err("out of range");
            assert!(err.to_string().contains("outside 2..=16"));
        }
        let config: PropagationConfig =
            serde_json::from_str(r#"{"bit_width": 16}"#).expect("valid config");
        assert_eq!(config.bit_width, 16);
    }
}
