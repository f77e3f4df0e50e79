use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{BiasRule, FixedRangeFn, OpQuantRules, QuantRuleProvider, ScaleRules};
use crate::{
    ir::{Graph, OpId, OpKind},
    quantization::fixed_range_params,
};

/// Float interval an operation always produces, e.g. `[0, 1]` for a logistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedRange {
    pub min: f64,
    pub max: f64,
}

/// Quantization behavior of one operation name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleEntry {
    pub quantizable: bool,
    pub same_scale: bool,
    /// Bias operand index to the operands its scale is derived from.
    pub biases: BTreeMap<usize, Vec<usize>>,
    /// Coefficient operand index to its per-channel axis, if any.
    pub coefficients: BTreeMap<usize, Option<usize>>,
    pub affine_operand: Option<usize>,
    pub fixed_output_range: Option<FixedRange>,
}

impl Default for RuleEntry {
    fn default() -> Self {
        Self {
            quantizable: true,
            same_scale: false,
            biases: BTreeMap::new(),
            coefficients: BTreeMap::new(),
            affine_operand: None,
            fixed_output_range: None,
        }
    }
}

impl RuleEntry {
    pub fn same_scale() -> Self {
        Self {
            same_scale: true,
            ..Default::default()
        }
    }

    pub fn not_quantizable() -> Self {
        Self {
            quantizable: false,
            ..Default::default()
        }
    }

    /// A convolution-like operation: `input * filter + bias`, with the filter quantized per
    /// channel along `axis` when supported.
    pub fn affine(input: usize, filter: usize, bias: usize, axis: Option<usize>) -> Self {
        Self {
            biases: BTreeMap::from([(bias, vec![input, filter])]),
            coefficients: BTreeMap::from([(filter, axis)]),
            affine_operand: Some(filter),
            ..Default::default()
        }
    }

    pub fn with_fixed_output_range(mut self, min: f64, max: f64) -> Self {
        self.fixed_output_range = Some(FixedRange { min, max });
        self
    }
}

/// Rules keyed by the name of compute operations, typically loaded from JSON. Constants are
/// always quantizable; markers, the terminator and unknown operations never are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleTable {
    ops: BTreeMap<String, RuleEntry>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_op(mut self, name: impl Into<String>, entry: RuleEntry) -> Self {
        self.insert(name, entry);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: RuleEntry) {
        self.ops.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&RuleEntry> {
        self.ops.get(name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn entry(&self, graph: &Graph, op: OpId) -> Option<&RuleEntry> {
        match &graph.op(op).kind {
            OpKind::Compute { name } => self.ops.get(name),
            _ => None,
        }
    }
}

impl QuantRuleProvider for RuleTable {
    fn op_rules(&self, graph: &Graph, op: OpId) -> OpQuantRules {
        if graph.op(op).is_constant() {
            return OpQuantRules {
                quantizable: true,
                ..Default::default()
            };
        }
        let Some(entry) = self.entry(graph, op) else {
            return OpQuantRules::default();
        };
        OpQuantRules {
            biases: entry
                .biases
                .iter()
                .map(|(bias, non_biases)| (*bias, BiasRule::new(non_biases.clone())))
                .collect(),
            coefficient_axes: entry.coefficients.clone(),
            affine_operand: entry.affine_operand,
            quantizable: entry.quantizable,
        }
    }

    fn scale_rules(&self, graph: &Graph, op: OpId) -> ScaleRules {
        let Some(entry) = self.entry(graph, op) else {
            return ScaleRules::default();
        };
        ScaleRules {
            same_scale: entry.same_scale,
            fixed_output_range: entry
                .fixed_output_range
                .map(|FixedRange { min, max }| -> FixedRangeFn {
                    Arc::new(move |signed: bool, bits: u32| {
                        fixed_range_params(min, max, signed, bits)
                    })
                }),
        }
    }
}
