use tracing::{debug, trace};

use super::{state::Binding, QuantizationDriver};
use crate::ir::{InsertPoint, OpId, OpKind, Use, ValueId};

impl QuantizationDriver<'_> {
    /// Splits float constants into weights, whose parameters come from their content, and
    /// propagated operands (biases, same scale operands, quantize inputs). A propagated use of a
    /// constant that is still shared gets its own copy so it can settle independently.
    pub(super) fn preprocess_constants(&mut self) {
        let constants = self
            .graph
            .block()
            .iter()
            .copied()
            .filter(|op| self.graph.op(*op).is_constant())
            .collect::<Vec<_>>();
        for cst in constants {
            let value = self.graph.result(cst, 0);
            if !self.graph.value_type(value).is_float() {
                continue;
            }
            let finite = self
                .graph
                .op(cst)
                .constant_values()
                .is_some_and(|values| !values.is_empty() && values.iter().all(|v| v.is_finite()));
            if !finite {
                debug!(%cst, "skipping constant with non-finite content");
                continue;
            }
            for slot in self.graph.uses(value).to_vec() {
                let rules = self.rules.op_rules(self.graph, slot.op);
                let same_scale = self.rules.scale_rules(self.graph, slot.op).same_scale;
                let weight_like = !rules.biases.contains_key(&slot.operand)
                    && !same_scale
                    && !self.graph.op(slot.op).is_quantize();
                if weight_like {
                    self.weight_constants.insert(cst);
                    if let Some(axis) = rules.coefficient_axes.get(&slot.operand) {
                        self.coefficient_weights.insert(cst, *axis);
                    }
                } else if self.graph.uses(value).len() > 1 {
                    let copy = self.graph.clone_op(cst, &mut InsertPoint::After(cst));
                    let copied = self.graph.result(copy, 0);
                    self.graph.set_operand(slot.op, slot.operand, copied);
                    self.report.duplicated_constants += 1;
                    trace!(%cst, %copy, user = %slot, "duplicated shared constant");
                }
            }
        }
    }

    /// Creates the states of every argument and of every operand and result of the operations
    /// the scheduler tracks, looking through existing quantize/dequantize markers.
    pub(super) fn setup_all_states(&mut self) {
        for (index, arg) in self.graph.arguments().to_vec().into_iter().enumerate() {
            let value = self.look_through_quantize(arg);
            self.store.get_or_create(
                value,
                self.graph.value_type(value),
                Binding::Argument(index),
            );
        }

        for op in self.graph.block().to_vec() {
            if !self.is_quantizable(op) && !self.rules.scale_rules(self.graph, op).same_scale {
                continue;
            }
            self.tracked.push(op);
            for index in 0..self.graph.op(op).operands().len() {
                let mut operand = self.graph.operand(op, index);
                if let Some(def) = self.graph.defining_op(operand) {
                    if self.graph.op(def).is_dequantize() {
                        operand = self.graph.operand(def, 0);
                    }
                }
                self.store.get_or_create(
                    operand,
                    self.graph.value_type(operand),
                    Binding::Operand(Use::new(op, index)),
                );
            }
            for index in 0..self.graph.op(op).results().len() {
                let result = self.look_through_quantize(self.graph.result(op, index));
                self.store.get_or_create(
                    result,
                    self.graph.value_type(result),
                    Binding::Result { op, index },
                );
            }
        }

        // the last operation is visited first
        for op in self.tracked.iter().rev() {
            self.queued.insert(*op);
            self.worklist.push_back(*op);
        }
        debug!(
            tracked = self.tracked.len(),
            states = self.store.len(),
            weights = self.weight_constants.len(),
            "initialized quantization states"
        );
    }

    /// A value whose only user is a quantize marker is represented by the marker's result.
    pub(super) fn look_through_quantize(&self, value: ValueId) -> ValueId {
        match self.graph.single_user(value) {
            Some(user) if self.graph.op(user).is_quantize() => self.graph.result(user, 0),
            _ => value,
        }
    }

    pub(super) fn is_quantizable(&self, op: OpId) -> bool {
        match &self.graph.op(op).kind {
            OpKind::Constant { .. } => true,
            OpKind::Quantize | OpKind::Dequantize | OpKind::Return => false,
            OpKind::Compute { .. } => self.rules.op_rules(self.graph, op).quantizable,
        }
    }

    /// Gives operand `user` its own copy of constant `cst` unless the constant has a single use,
    /// and returns the constant `user` now reads.
    pub(super) fn duplicate_constant_if_needed(&mut self, cst: OpId, user: Use) -> OpId {
        let value = self.graph.result(cst, 0);
        if self.graph.has_one_use(value) {
            return cst;
        }
        let copy = self.graph.clone_op(cst, &mut InsertPoint::After(cst));
        let copied = self.graph.result(copy, 0);
        self.graph.set_operand(user.op, user.operand, copied);
        let ty = self.graph.value_type(copied);
        self.store.get_or_create(copied, ty, Binding::Operand(user));
        self.store
            .get_or_create(copied, ty, Binding::Result { op: copy, index: 0 });
        self.report.duplicated_constants += 1;
        debug!(%cst, %copy, %user, "duplicated shared filter");
        copy
    }
}
