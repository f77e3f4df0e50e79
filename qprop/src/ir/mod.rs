//! Minimal SSA graph IR the propagation engine operates on.
//!
//! A [`Graph`] is a single block: a list of typed arguments followed by operations in program
//! order. Values are either block arguments or operation results and keep an ordered use list so
//! rewrites (operand redirection, marker insertion) stay cheap and consistent.
mod description;
mod graph;
mod types;

pub use graph::{Graph, InsertPoint, OpId, OpKind, Operation, Use, ValueData, ValueDef, ValueId};
pub use types::{ElementType, FloatKind, TensorType};
