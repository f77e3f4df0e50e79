//! Quantization parameter propagation for single-block dataflow graphs.
//!
//! Given a graph whose values are floating point tensors plus some quantization intent (typed
//! quantize markers, or a request to infer ranges from constant content), the engine assigns
//! every reachable value a scale / zero-point pair and rewrites the graph with explicit
//! quantize / dequantize markers. Conflicting requirements on one value are reconciled by
//! inserting requantization points instead of failing.
//!
//! The entry point is [`apply_quantization_params_propagation`]. Operation semantics are supplied
//! through [`rules::QuantRuleProvider`] and [`rules::WeightQuantizer`]; [`rules::RuleTable`] and
//! [`quantization::MinMaxQuantizer`] are the default implementations.
pub mod config;
pub mod driver;
pub mod error;
pub mod ir;
pub mod quantization;
pub mod rules;
pub mod testing;

pub use config::PropagationConfig;
pub use driver::{apply_quantization_params_propagation, PropagationReport, QuantizationDriver};
pub use error::GraphError;
pub use ir::{Graph, OpId, OpKind, TensorType, ValueId};
pub use quantization::{MinMaxQuantizer, QuantParams};
pub use rules::{QuantRuleProvider, RuleTable, WeightQuantizer};
