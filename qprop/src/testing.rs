//! Graph and rule fixtures shared by unit tests, benches and downstream crates.
use itertools::Itertools;

use crate::{
    ir::{ElementType, FloatKind, Graph, OpId, OpKind, TensorType, ValueId},
    quantization::{QuantParams, StorageType},
    rules::{RuleEntry, RuleTable},
};

/// Signed 8 bit, full range, per tensor.
pub fn int8(scale: f64, zero_point: i64) -> QuantParams {
    QuantParams::per_tensor(StorageType::new(8, true, false), scale, zero_point)
}

/// An `f32` tensor type quantized with `params`.
pub fn quantized_f32(shape: impl Into<Vec<usize>>, params: QuantParams) -> TensorType {
    TensorType::new(
        shape.into(),
        ElementType::Quantized {
            params,
            expressed: FloatKind::F32,
        },
    )
}

/// Appends a quantize/dequantize pair reading `value` and returns the dequantized value, the
/// shape of a graph carrying calibrated ranges.
pub fn append_qdq(graph: &mut Graph, value: ValueId, params: &QuantParams) -> ValueId {
    let ty = graph.value_type(value).clone();
    let q = graph.append_op(
        OpKind::Quantize,
        vec![value],
        vec![quantized_f32(ty.shape.clone(), params.clone())],
    );
    let quantized = graph.result(q, 0);
    let dq = graph.append_op(OpKind::Dequantize, vec![quantized], vec![ty]);
    graph.result(dq, 0)
}

/// Rules for the operations used throughout the fixtures.
pub fn default_rules() -> RuleTable {
    RuleTable::new()
        .with_op("add", RuleEntry::same_scale())
        .with_op("concat", RuleEntry::same_scale())
        .with_op("reshape", RuleEntry::same_scale())
        .with_op("relu", RuleEntry::same_scale())
        .with_op("split", RuleEntry::same_scale())
        .with_op("fully_connected", RuleEntry::affine(0, 1, 2, Some(0)))
        .with_op(
            "logistic",
            RuleEntry::default().with_fixed_output_range(0.0, 1.0),
        )
        .with_op("tanh", RuleEntry::default().with_fixed_output_range(-1.0, 1.0))
        .with_op("argmax", RuleEntry::not_quantizable())
}

/// `add(dequantize(quantize(x)), y)` where only `x` carries parameters.
pub fn add_graph(params: &QuantParams) -> (Graph, OpId) {
    let mut graph = Graph::new();
    let x = graph.add_argument(TensorType::float(vec![1, 4]));
    let y = graph.add_argument(TensorType::float(vec![1, 4]));
    let lhs = append_qdq(&mut graph, x, params);
    let add = graph.append_op(
        OpKind::compute("add"),
        vec![lhs, y],
        vec![TensorType::float(vec![1, 4])],
    );
    let sum = graph.result(add, 0);
    graph.append_op(OpKind::Return, vec![sum], vec![]);
    (graph, add)
}

/// Deterministic filter content in `[-1.2, 1.2]`.
pub fn filter_values(outputs: usize, inputs: usize) -> Vec<f64> {
    (0..outputs * inputs)
        .map(|i| ((i * 7 % 13) as f64 - 6.0) / 5.0)
        .collect()
}

/// A fully connected layer `input * filter^T + bias` over a calibrated input, returning the
/// graph and the layer. `filter` is `[outputs, inputs]`, `bias` has `outputs` elements.
pub fn fully_connected_graph(
    input_params: &QuantParams,
    filter: Vec<f64>,
    bias: Vec<f64>,
) -> (Graph, OpId) {
    let outputs = bias.len();
    let inputs = filter.len() / outputs.max(1);
    let mut graph = Graph::new();
    let x = graph.add_argument(TensorType::float(vec![1, inputs]));
    let input = append_qdq(&mut graph, x, input_params);
    let filter = graph.append_constant(TensorType::float(vec![outputs, inputs]), filter);
    let bias = graph.append_constant(TensorType::float(vec![outputs]), bias);
    let fc = graph.append_op(
        OpKind::compute("fully_connected"),
        vec![input, filter, bias],
        vec![TensorType::float(vec![1, outputs])],
    );
    let output = graph.result(fc, 0);
    graph.append_op(OpKind::Return, vec![output], vec![]);
    (graph, fc)
}

/// `layers` calibrated `fully_connected -> relu` blocks of width `channels`.
pub fn fully_connected_chain(layers: usize, channels: usize) -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_argument(TensorType::float(vec![1, channels]));
    let mut activation = append_qdq(&mut graph, x, &int8(0.05, 0));
    for layer in 0..layers {
        let filter = graph.append_constant(
            TensorType::float(vec![channels, channels]),
            filter_values(channels, channels),
        );
        let bias = graph.append_constant(
            TensorType::float(vec![channels]),
            (0..channels).map(|c| (c + layer) as f64 / 10.0).collect_vec(),
        );
        let fc = graph.append_op(
            OpKind::compute("fully_connected"),
            vec![activation, filter, bias],
            vec![TensorType::float(vec![1, channels])],
        );
        let output = graph.result(fc, 0);
        let calibrated = append_qdq(&mut graph, output, &int8(0.1, -10));
        let relu = graph.append_op(
            OpKind::compute("relu"),
            vec![calibrated],
            vec![TensorType::float(vec![1, channels])],
        );
        activation = graph.result(relu, 0);
    }
    graph.append_op(OpKind::Return, vec![activation], vec![]);
    graph
}
