//! The propagation engine.
//!
//! A run has three stages:
//! 1. `initialize`: duplicate shared constants whose uses need independent parameters, classify
//!    weights, and create one state per value reachable from an argument, operand or result.
//! 2. `propagate`: drain a worklist of operations, settling states from weight content, same
//!    scale constraints, fixed output ranges and bias rules. Conflicts never overwrite a settled
//!    state; they queue a requantization instead.
//! 3. `finalize`: only when propagation changed anything, rewrite the graph with
//!    quantize/dequantize markers and requantization points.
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{info, instrument};

use crate::{
    config::PropagationConfig,
    error::GraphError,
    ir::{Graph, OpId},
    rules::{QuantRuleProvider, WeightQuantizer},
};

mod finalize;
mod preprocess;
mod propagate;
pub mod state;

use state::StateStore;

/// Summary of a propagation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Propagation assigned or requested at least one set of parameters and the graph was
    /// rewritten.
    pub changed: bool,
    pub states: usize,
    pub duplicated_constants: usize,
    pub requantizations: usize,
    /// Operations still undecided when the worklist ran dry.
    pub deferred: usize,
    pub inserted_ops: usize,
}

/// Propagates quantization parameters through `graph` and rewrites it in place.
///
/// The graph is validated first; that is the only failure. Operations whose parameters cannot be
/// decided are left untouched.
pub fn apply_quantization_params_propagation(
    graph: &mut Graph,
    config: &PropagationConfig,
    rules: &dyn QuantRuleProvider,
    weights: &dyn WeightQuantizer,
) -> Result<PropagationReport, GraphError> {
    graph.validate()?;
    let report = QuantizationDriver::new(graph, config.clone(), rules, weights).run();
    debug_assert!(graph.validate().is_ok(), "propagation broke the graph");
    Ok(report)
}

pub struct QuantizationDriver<'a> {
    graph: &'a mut Graph,
    config: PropagationConfig,
    rules: &'a dyn QuantRuleProvider,
    weights: &'a dyn WeightQuantizer,
    store: StateStore,
    /// Constants whose parameters are inferred from their content.
    weight_constants: HashSet<OpId>,
    /// Weight constants consumed as coefficients, with their per-channel axis if supported.
    coefficient_weights: HashMap<OpId, Option<usize>>,
    /// Operations tracked by the scheduler, in program order.
    tracked: Vec<OpId>,
    worklist: VecDeque<OpId>,
    queued: HashSet<OpId>,
    visited: HashSet<OpId>,
    report: PropagationReport,
}

impl<'a> QuantizationDriver<'a> {
    pub fn new(
        graph: &'a mut Graph,
        config: PropagationConfig,
        rules: &'a dyn QuantRuleProvider,
        weights: &'a dyn WeightQuantizer,
    ) -> Self {
        Self {
            graph,
            config,
            rules,
            weights,
            store: StateStore::new(),
            weight_constants: HashSet::new(),
            coefficient_weights: HashMap::new(),
            tracked: Vec::new(),
            worklist: VecDeque::new(),
            queued: HashSet::new(),
            visited: HashSet::new(),
            report: PropagationReport::default(),
        }
    }

    #[instrument(name = "QuantizationDriver::run", skip_all, fields(ops = self.graph.num_ops()))]
    pub fn run(mut self) -> PropagationReport {
        self.initialize();
        let changed = self.propagate();
        if changed {
            self.finalize();
        }
        let report = PropagationReport {
            changed,
            states: self.store.len(),
            deferred: self
                .tracked
                .iter()
                .filter(|op| !self.visited.contains(*op))
                .count(),
            ..self.report
        };
        info!(
            changed = report.changed,
            states = report.states,
            duplicated_constants = report.duplicated_constants,
            requantizations = report.requantizations,
            deferred = report.deferred,
            inserted_ops = report.inserted_ops,
            "quantization parameters propagated"
        );
        report
    }

    fn initialize(&mut self) {
        self.preprocess_constants();
        self.setup_all_states();
    }
}
