//! Per-operation quantization behavior consulted by the engine.
//!
//! The engine never hardcodes operation semantics. It asks a [`QuantRuleProvider`] which operands
//! are biases, which operations need one shared scale and which produce a fixed range, and a
//! [`WeightQuantizer`] for parameters derived from constant content.
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    ir::{Graph, OpId, TensorType},
    quantization::{accumulator_bias_params, QuantParams, WeightRequest},
};

mod table;

pub use table::{FixedRange, RuleEntry, RuleTable};

/// Bias parameters from the parameters of the non-bias operands, the axis the bias is laid out
/// along and the legacy float scale flag.
pub type AccumulatorFn =
    Arc<dyn Fn(&[Option<QuantParams>], Option<usize>, bool) -> Option<QuantParams> + Send + Sync>;

/// Output parameters from the signedness and bit width of the run.
pub type FixedRangeFn = Arc<dyn Fn(bool, u32) -> Option<QuantParams> + Send + Sync>;

#[derive(Clone)]
pub struct BiasRule {
    /// Operands whose parameters determine the bias scale.
    pub non_biases: Vec<usize>,
    pub accumulator: AccumulatorFn,
}

impl BiasRule {
    /// Bias solved with [`accumulator_bias_params`].
    pub fn new(non_biases: Vec<usize>) -> Self {
        Self {
            non_biases,
            accumulator: Arc::new(accumulator_bias_params),
        }
    }
}

impl fmt::Debug for BiasRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiasRule")
            .field("non_biases", &self.non_biases)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct OpQuantRules {
    /// Bias operand index to the rule solving it.
    pub biases: BTreeMap<usize, BiasRule>,
    /// Operands holding coefficients (weights), with the axis they may be quantized along
    /// per channel.
    pub coefficient_axes: BTreeMap<usize, Option<usize>>,
    /// The filter operand of affine operations (convolutions, fully connected).
    pub affine_operand: Option<usize>,
    pub quantizable: bool,
}

#[derive(Clone, Default)]
pub struct ScaleRules {
    /// Operands and results must all share one set of parameters.
    pub same_scale: bool,
    pub fixed_output_range: Option<FixedRangeFn>,
}

impl fmt::Debug for ScaleRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScaleRules")
            .field("same_scale", &self.same_scale)
            .field("fixed_output_range", &self.fixed_output_range.is_some())
            .finish()
    }
}

pub trait QuantRuleProvider {
    fn op_rules(&self, graph: &Graph, op: OpId) -> OpQuantRules;
    fn scale_rules(&self, graph: &Graph, op: OpId) -> ScaleRules;
}

/// Parameters for a constant from its content. `None` when no valid parameters exist.
pub trait WeightQuantizer {
    fn weight_params(
        &self,
        ty: &TensorType,
        values: &[f64],
        request: &WeightRequest,
    ) -> Option<QuantParams>;
}
