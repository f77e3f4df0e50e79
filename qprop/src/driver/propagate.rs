use tracing::{debug, trace, warn};

use super::{
    state::{Assignment, QuantState, StateId},
    QuantizationDriver,
};
use crate::{
    ir::{OpId, Use},
    quantization::{channel_abs_max, QuantParams, WeightRequest, BIAS_MAX, WEIGHT_BIT_WIDTH},
    rules::BiasRule,
};

impl QuantizationDriver<'_> {
    /// Drains the worklist. An operation is visited at most once unless it had to be deferred;
    /// whenever a state receives its first parameters, the tracked operations bound to it that
    /// have not been visited yet are queued again.
    pub(super) fn propagate(&mut self) -> bool {
        let mut changed = false;
        while let Some(op) = self.worklist.pop_front() {
            self.queued.remove(&op);
            if !self.visited.insert(op) {
                continue;
            }
            changed |= self.visit(op);
        }
        changed
    }

    fn visit(&mut self, op: OpId) -> bool {
        let mut changed = false;
        if self.graph.op(op).is_constant() {
            if self.config.infer_ranges
                && self.weight_constants.contains(&op)
                && !self.is_quantized(op)
            {
                changed |= self.set_constant_result_params(op);
            }
            return changed;
        }

        let scale_rules = self.rules.scale_rules(self.graph, op);
        if scale_rules.same_scale {
            let Some(params) = self.same_scale_params(op) else {
                self.defer(op, "no operand or result has parameters yet");
                return changed;
            };
            for index in 0..self.graph.op(op).operands().len() {
                // shared non-float tensors must not pick up parameters
                if self.graph.value_type(self.graph.operand(op, index)).is_float() {
                    changed |= self.set_operand_params(op, index, params.clone());
                }
            }
            for index in 0..self.graph.op(op).results().len() {
                if self.graph.value_type(self.graph.result(op, index)).is_float() {
                    changed |= self.set_result_params(op, index, params.clone());
                }
            }
        }

        // explicit quantize/dequantize pairs already fix the ranges in conversion mode
        if self.config.infer_ranges && !self.config.qdq_conversion {
            if let Some(fixed) = &scale_rules.fixed_output_range {
                if let Some(params) = fixed(self.config.signed, self.config.bit_width) {
                    for index in 0..self.graph.op(op).results().len() {
                        changed |= self.set_result_params(op, index, params.clone());
                    }
                }
            }
        }

        let rules = self.rules.op_rules(self.graph, op);
        for (bias, rule) in &rules.biases {
            match self.bias_params(op, *bias, rule) {
                Some(params) => {
                    changed |= self.set_bias_params_with_adjustments(
                        op,
                        *bias,
                        &rule.non_biases,
                        rules.affine_operand,
                        params,
                    );
                }
                None => self.defer(op, "bias inputs are not quantized yet"),
            }
        }
        changed
    }

    fn defer(&mut self, op: OpId, reason: &str) {
        self.visited.remove(&op);
        trace!(%op, name = self.graph.op(op).name(), reason, "deferred");
    }

    fn enqueue(&mut self, op: OpId) {
        if !self.visited.contains(&op) && self.queued.insert(op) {
            self.worklist.push_back(op);
        }
    }

    /// Bookkeeping after an assignment; returns whether anything changed.
    fn record(&mut self, id: StateId, outcome: Assignment) -> bool {
        match outcome {
            Assignment::Settled => {
                for op in self.store.dependents(id).to_vec() {
                    self.enqueue(op);
                }
            }
            Assignment::Requantized => {
                self.report.requantizations += 1;
                debug!(state = %id, "conflicting parameters, requantization queued");
            }
            Assignment::Unchanged | Assignment::Replaced => {}
        }
        outcome.changed()
    }

    fn set_operand_params(&mut self, op: OpId, index: usize, params: QuantParams) -> bool {
        let Some(id) = self.store.operand_state(op, index) else {
            return false;
        };
        let outcome = self.store.propose_operand(id, Use::new(op, index), params);
        self.record(id, outcome)
    }

    fn set_result_params(&mut self, op: OpId, index: usize, params: QuantParams) -> bool {
        let Some(id) = self.store.result_state(op, index) else {
            return false;
        };
        let outcome = self.store.propose_result(id, params);
        self.record(id, outcome)
    }

    fn override_operand_params(&mut self, op: OpId, index: usize, params: QuantParams) -> bool {
        let Some(id) = self.store.operand_state(op, index) else {
            return false;
        };
        let outcome = self.store.override_operand(id, Use::new(op, index), params);
        self.record(id, outcome)
    }

    fn operand_params(&self, op: OpId, index: usize) -> Option<&QuantParams> {
        self.store
            .operand_state(op, index)
            .and_then(|id| self.store.params(id))
    }

    /// All results already hold parameters.
    fn is_quantized(&self, op: OpId) -> bool {
        (0..self.graph.op(op).results().len()).all(|index| {
            self.store
                .result_state(op, index)
                .is_some_and(|id| !self.store.state(id).is_empty())
        })
    }

    /// Infers the parameters of a weight constant from its content. Coefficients are quantized
    /// symmetrically over a narrow range, per channel when the consumer supports it and the run
    /// is signed.
    fn set_constant_result_params(&mut self, op: OpId) -> bool {
        let value = self.graph.result(op, 0);
        let ty = self.graph.value_type(value);
        let Some(values) = self.graph.op(op).constant_values() else {
            return false;
        };
        let coefficient = self.coefficient_weights.get(&op).copied();
        let is_coefficient = coefficient.is_some();
        let signed = self.config.signed;
        let per_channel_axis = coefficient.flatten().filter(|_| signed);
        let request = match per_channel_axis {
            Some(axis) if !self.config.disable_per_channel => WeightRequest {
                axis: Some(axis),
                symmetric: true,
                bits: WEIGHT_BIT_WIDTH,
                signed,
                narrow_range: true,
                legacy_float_scale: self.config.legacy_float_scale,
            },
            _ => WeightRequest {
                axis: None,
                symmetric: is_coefficient && signed,
                bits: WEIGHT_BIT_WIDTH,
                signed,
                narrow_range: is_coefficient,
                legacy_float_scale: self.config.legacy_float_scale,
            },
        };
        let params = self
            .weights
            .weight_params(ty, values, &request)
            .filter(|params| params.cast_from_expressed(ty).is_some());
        let Some(params) = params else {
            debug!(%op, ?request, "no valid weight parameters for constant");
            return false;
        };
        trace!(%op, %params, "weight parameters inferred from content");
        self.set_result_params(op, 0, params)
    }

    /// Picks the parameters every operand and result of a same scale operation must share:
    /// immutable states win over inferred ones, and a lone operand or result wins over an
    /// arbitrary pick.
    pub(super) fn same_scale_params(&self, op: OpId) -> Option<QuantParams> {
        let operation = self.graph.op(op);
        let (num_operands, num_results) = (operation.operands().len(), operation.results().len());
        let (immutable_operands, mutable_operands) = partition_states(
            (0..num_operands)
                .filter_map(|index| self.store.operand_state(op, index))
                .map(|id| self.store.state(id)),
        );
        if num_operands == 1 && immutable_operands.len() == 1 {
            return Some(immutable_operands[0].clone());
        }
        let (immutable_results, mutable_results) = partition_states(
            (0..num_results)
                .filter_map(|index| self.store.result_state(op, index))
                .map(|id| self.store.state(id)),
        );
        if num_results == 1 && immutable_results.len() == 1 {
            return Some(immutable_results[0].clone());
        }
        if let Some(first) = immutable_operands.first().or(immutable_results.first()) {
            return Some((*first).clone());
        }
        if num_operands == 1 && mutable_operands.len() == 1 {
            return Some(mutable_operands[0].clone());
        }
        if num_results == 1 && mutable_results.len() == 1 {
            return Some(mutable_results[0].clone());
        }
        mutable_operands
            .first()
            .or(mutable_results.first())
            .map(|params| (*params).clone())
    }

    /// Existing bias parameters, or the accumulator parameters derived from the non-bias
    /// operands. `None` while those are not known yet.
    fn bias_params(&self, op: OpId, bias: usize, rule: &BiasRule) -> Option<QuantParams> {
        if bias >= self.graph.op(op).operands().len() {
            return None;
        }
        if let Some(params) = self.operand_params(op, bias) {
            return Some(params.clone());
        }
        // 1-D biases are broadcast by the kernel; wider ones are laid out along the last axis
        let adjusted_axis = self
            .graph
            .defining_op(self.graph.operand(op, bias))
            .and_then(|def| self.graph.op(def).results().first().copied())
            .map(|result| self.graph.value_type(result).rank())
            .map(|rank| if rank > 1 { rank - 1 } else { 0 });
        let operands = rule
            .non_biases
            .iter()
            .map(|index| self.operand_params(op, *index).cloned())
            .collect::<Vec<_>>();
        (rule.accumulator)(&operands, adjusted_axis, self.config.legacy_float_scale)
    }

    /// Sets the bias parameters, enlarging bias and filter scales together when the quantized
    /// bias would not fit in half of the 32 bit accumulator.
    fn set_bias_params_with_adjustments(
        &mut self,
        op: OpId,
        bias: usize,
        non_biases: &[usize],
        affine_operand: Option<usize>,
        params: QuantParams,
    ) -> bool {
        let operands = self.bias_scale_operands(op, bias, non_biases, affine_operand, &params);
        let Some((input, filter)) = operands else {
            return self.set_operand_params(op, bias, params);
        };
        let adjusted = (|| {
            let input_scale = self.operand_params(op, input)?.as_per_tensor()?.scale;
            let filter_params = self.operand_params(op, filter)?;
            let bias_value = self.graph.operand(op, bias);
            let bias_values = self
                .graph
                .op(self.graph.defining_op(bias_value)?)
                .constant_values()?;
            adjust_for_bias_overflow(
                &params,
                filter_params,
                input_scale,
                &self.graph.value_type(bias_value).shape,
                bias_values,
            )
        })();
        let Some((new_bias, new_filter)) = adjusted else {
            return self.set_operand_params(op, bias, params);
        };
        warn!(
            %op,
            bias = %new_bias,
            filter = %new_filter,
            "bias scale too small for the accumulator, enlarging bias and filter scales"
        );
        let mut changed = self.set_operand_params(op, bias, new_bias);
        let filter_value = self.graph.operand(op, filter);
        if let Some(filter_cst) = self.graph.defining_op(filter_value) {
            self.duplicate_constant_if_needed(filter_cst, Use::new(op, filter));
        }
        changed |= self.override_operand_params(op, filter, new_filter);
        changed
    }

    /// The `(input, filter)` operand pair when the overflow guard applies: an affine operation
    /// with constant float bias and filter, a mutable filter, 8 bit input and filter, and a 32
    /// bit bias.
    fn bias_scale_operands(
        &self,
        op: OpId,
        bias: usize,
        non_biases: &[usize],
        affine_operand: Option<usize>,
        params: &QuantParams,
    ) -> Option<(usize, usize)> {
        let filter = affine_operand?;
        let &[first, second] = non_biases else {
            return None;
        };
        let input = if filter == first {
            second
        } else if filter == second {
            first
        } else {
            return None;
        };
        let num_operands = self.graph.op(op).operands().len();
        if [bias, filter, input].iter().any(|index| *index >= num_operands) {
            return None;
        }
        let is_constant = |index: usize| {
            let value = self.graph.operand(op, index);
            self.graph.value_type(value).is_float()
                && self
                    .graph
                    .defining_op(value)
                    .is_some_and(|def| self.graph.op(def).is_constant())
        };
        if !is_constant(bias) || !is_constant(filter) {
            return None;
        }
        let filter_state = self.store.state(self.store.operand_state(op, filter)?);
        let input_params = self.operand_params(op, input)?;
        let widths_match = input_params.bit_width() == 8
            && filter_state.params.as_ref().is_some_and(|p| p.bit_width() == 8)
            && params.bit_width() == 32;
        (widths_match && !filter_state.immutable).then_some((input, filter))
    }
}

/// Splits states into the parameters of immutable states and of mutable, already assigned ones.
fn partition_states<'s>(
    states: impl Iterator<Item = &'s QuantState>,
) -> (Vec<&'s QuantParams>, Vec<&'s QuantParams>) {
    let mut immutable = Vec::new();
    let mut mutable = Vec::new();
    for state in states {
        match (&state.params, state.immutable) {
            (Some(params), true) => immutable.push(params),
            (Some(params), false) => mutable.push(params),
            (None, _) => {}
        }
    }
    (immutable, mutable)
}

/// New `(bias, filter)` parameters when some bias magnitude divided by its scale exceeds
/// [`BIAS_MAX`]: the offending bias scale becomes `|bias| / BIAS_MAX` and the matching filter
/// scale `bias_scale / input_scale`. `None` when no adjustment is needed or the bias and filter
/// layouts do not line up.
pub(super) fn adjust_for_bias_overflow(
    bias: &QuantParams,
    filter: &QuantParams,
    input_scale: f64,
    bias_shape: &[usize],
    bias_values: &[f64],
) -> Option<(QuantParams, QuantParams)> {
    match (bias, filter) {
        (QuantParams::PerTensor(b), QuantParams::PerTensor(f)) => {
            let half_range = channel_abs_max(bias_shape, bias_values, None)?[0];
            if half_range / b.scale <= BIAS_MAX {
                return None;
            }
            let bias_scale = half_range / BIAS_MAX;
            Some((
                QuantParams::per_tensor(b.storage, bias_scale, 0),
                QuantParams::per_tensor(f.storage, bias_scale / input_scale, 0),
            ))
        }
        (QuantParams::PerAxis(b), QuantParams::PerAxis(f)) => {
            let magnitudes = channel_abs_max(bias_shape, bias_values, Some(b.axis))?;
            if magnitudes.len() != b.scales.len() || f.scales.len() != b.scales.len() {
                return None;
            }
            let mut bias_scales = b.scales.clone();
            let mut filter_scales = f.scales.clone();
            let mut adjusted = false;
            for (channel, magnitude) in magnitudes.into_iter().enumerate() {
                if magnitude / bias_scales[channel] > BIAS_MAX {
                    bias_scales[channel] = magnitude / BIAS_MAX;
                    filter_scales[channel] = bias_scales[channel] / input_scale;
                    adjusted = true;
                }
            }
            adjusted.then(|| {
                (
                    QuantParams::per_axis(b.storage, bias_scales, b.zero_points.clone(), b.axis),
                    QuantParams::per_axis(f.storage, filter_scales, f.zero_points.clone(), f.axis),
                )
            })
        }
        _ => None,
    }
}
