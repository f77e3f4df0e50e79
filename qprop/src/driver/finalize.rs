use itertools::Itertools;
use tracing::{debug, trace};

use super::{
    state::{RequantizePosition, RequantizeState, StateId},
    QuantizationDriver,
};
use crate::{
    ir::{InsertPoint, OpId, OpKind, Use, ValueId},
    quantization::QuantParams,
};

impl QuantizationDriver<'_> {
    /// Materializes the settled states: every mutable state gets a quantize/dequantize pair
    /// right after its producer, and pending requantizations become extra quantize markers.
    pub(super) fn finalize(&mut self) {
        for (index, arg) in self.graph.arguments().to_vec().into_iter().enumerate() {
            let Some(id) = self.store.arg_state(index) else {
                continue;
            };
            let Some((params, requantizes)) = self.pending(id) else {
                continue;
            };
            if let Some(params) = params {
                self.quantize_value(arg, &params, InsertPoint::BlockStart);
            }
            if !requantizes.is_empty() {
                self.requantize_arg(arg, &requantizes);
            }
        }

        for op in self.graph.block().to_vec() {
            for index in 0..self.graph.op(op).results().len() {
                let Some(id) = self.store.result_state(op, index) else {
                    continue;
                };
                let Some((params, requantizes)) = self.pending(id) else {
                    continue;
                };
                let result = self.graph.result(op, index);
                if let Some(params) = params {
                    self.quantize_value(result, &params, InsertPoint::After(op));
                }
                if !requantizes.is_empty() {
                    self.requantize_result(op, result, &requantizes);
                }
            }
        }
    }

    /// What finalization still has to do for a state: parameters to materialize (mutable states
    /// only) and the requantizations. `None` when there is nothing to do.
    fn pending(&self, id: StateId) -> Option<(Option<QuantParams>, Vec<RequantizeState>)> {
        let state = self.store.state(id);
        let requantizes = self.store.requantizes(id);
        if state.is_empty() || (state.immutable && requantizes.is_empty()) {
            return None;
        }
        let params = state.params.clone().filter(|_| !state.immutable);
        Some((params, requantizes.to_vec()))
    }

    /// Inserts `value -> quantize -> dequantize` at `point` and moves every other use of `value`
    /// onto the dequantized value.
    fn quantize_value(&mut self, value: ValueId, params: &QuantParams, mut point: InsertPoint) {
        let expressed = self.graph.value_type(value).clone();
        let Some(quantized) = params.cast_from_expressed(&expressed) else {
            debug!(%value, ty = %expressed, %params, "parameters do not fit the value type");
            return;
        };
        let quantize = self
            .graph
            .insert_op(&mut point, OpKind::Quantize, vec![value], vec![quantized]);
        self.graph.op_mut(quantize).volatile = true;
        let quantized = self.graph.result(quantize, 0);
        let dequantize =
            self.graph
                .insert_op(&mut point, OpKind::Dequantize, vec![quantized], vec![expressed]);
        let dequantized = self.graph.result(dequantize, 0);
        self.graph.replace_all_uses_except(value, dequantized, quantize);
        self.report.inserted_ops += 2;
        trace!(%value, %params, "quantized");
    }

    fn requantize_arg(&mut self, arg: ValueId, requantizes: &[RequantizeState]) {
        let (value, point) = match self.graph.single_user(arg) {
            Some(user) if self.graph.op(user).is_quantize() => {
                (self.graph.result(user, 0), InsertPoint::After(user))
            }
            _ => (arg, InsertPoint::BlockStart),
        };
        self.requantize_value(value, requantizes, point);
    }

    fn requantize_result(&mut self, op: OpId, result: ValueId, requantizes: &[RequantizeState]) {
        let mut value = result;
        let mut point = InsertPoint::After(op);
        if common_position(requantizes) == Some(RequantizePosition::BeforeConsumer) {
            // consumers read the dequantized value, the requantization goes between the markers
            if let Some(first) = self.graph.uses(result).first().copied() {
                if self.graph.op(first.op).is_quantize() {
                    value = self.graph.result(first.op, 0);
                    point = InsertPoint::After(first.op);
                }
            }
        }
        self.requantize_value(value, requantizes, point);
    }

    fn requantize_value(
        &mut self,
        value: ValueId,
        requantizes: &[RequantizeState],
        point: InsertPoint,
    ) {
        match common_position(requantizes) {
            Some(RequantizePosition::AfterProducer) => {
                self.requantize_after_producer(value, &requantizes[0], point)
            }
            Some(RequantizePosition::BeforeConsumer) => {
                self.requantize_before_consumers(value, requantizes, point)
            }
            Some(RequantizePosition::NoRequantize) | None => {}
        }
    }

    /// Every use of `value` reads it through a single requantization.
    fn requantize_after_producer(
        &mut self,
        value: ValueId,
        requantize: &RequantizeState,
        mut point: InsertPoint,
    ) {
        let Some(ty) = requantize.params.cast_from_expressed(self.graph.value_type(value)) else {
            debug!(%value, params = %requantize.params, "cannot requantize a non-float value");
            return;
        };
        let op = self
            .graph
            .insert_op(&mut point, OpKind::Quantize, vec![value], vec![ty]);
        let requantized = self.graph.result(op, 0);
        self.graph.replace_all_uses_except(value, requantized, op);
        self.report.inserted_ops += 1;
        debug!(%value, params = %requantize.params, "requantized after producer");
    }

    /// Gives each recorded consumer a requantized copy of the quantized `value`. The existing
    /// dequantize marker is reused for the first target when nobody else reads it.
    fn requantize_before_consumers(
        &mut self,
        value: ValueId,
        requantizes: &[RequantizeState],
        mut point: InsertPoint,
    ) {
        let Some(dequantize) = self
            .graph
            .single_user(value)
            .filter(|user| self.graph.op(*user).is_dequantize())
        else {
            debug!(%value, "requantized value is not read through a single dequantize");
            return;
        };
        let Some(expressed) = self.graph.value_type(value).expressed_type() else {
            return;
        };
        let dequantized = self.graph.result(dequantize, 0);
        let dequantized_ty = self.graph.value_type(dequantized).clone();
        let recorded = requantizes
            .iter()
            .flat_map(|r| r.users.iter().copied())
            .collect::<Vec<Use>>();
        let mut clobber = self
            .graph
            .uses(dequantized)
            .iter()
            .all(|u| recorded.contains(u));

        for requantize in requantizes {
            let Some(ty) = requantize.params.cast_from_expressed(&expressed) else {
                continue;
            };
            let op = self
                .graph
                .insert_op(&mut point, OpKind::Quantize, vec![value], vec![ty]);
            let requantized = self.graph.result(op, 0);
            self.report.inserted_ops += 1;
            if clobber {
                self.graph.set_operand(dequantize, 0, requantized);
                clobber = false;
            } else {
                let new_dequantize = self.graph.insert_op(
                    &mut point,
                    OpKind::Dequantize,
                    vec![requantized],
                    vec![dequantized_ty.clone()],
                );
                let new_dequantized = self.graph.result(new_dequantize, 0);
                for user in &requantize.users {
                    self.graph.set_operand(user.op, user.operand, new_dequantized);
                }
                self.report.inserted_ops += 1;
            }
            debug!(
                %value,
                params = %requantize.params,
                users = %requantize.users.iter().join(", "),
                "requantized before consumers"
            );
        }
    }
}

/// The position shared by all pending requantizations of a value. Mixed positions are not
/// materialized.
fn common_position(requantizes: &[RequantizeState]) -> Option<RequantizePosition> {
    let position = requantizes.first()?.position;
    if position == RequantizePosition::NoRequantize {
        return None;
    }
    if requantizes.iter().any(|r| r.position != position) {
        debug!(%position, "mixed requantization positions, skipping");
        return None;
    }
    Some(position)
}
