//! Serialized form of a [`Graph`]: argument types plus operations in program order, each operand
//! naming either an argument or the result of an earlier operation by position.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{
    graph::{Graph, OpKind, ValueDef, ValueId},
    types::TensorType,
};
use crate::error::GraphError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GraphDescription {
    #[serde(default)]
    arguments: Vec<TensorType>,
    ops: Vec<OpDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpDescription {
    #[serde(flatten)]
    kind: OpKind,
    #[serde(default)]
    operands: Vec<ValueRef>,
    #[serde(default)]
    results: Vec<TensorType>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    volatile: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum ValueRef {
    Argument {
        arg: usize,
    },
    Result {
        op: usize,
        #[serde(default)]
        result: usize,
    },
}

impl TryFrom<GraphDescription> for Graph {
    type Error = GraphError;

    fn try_from(description: GraphDescription) -> Result<Self, Self::Error> {
        let mut graph = Graph::new();
        let arguments = description
            .arguments
            .into_iter()
            .map(|ty| graph.add_argument(ty))
            .collect::<Vec<_>>();
        let mut results: Vec<Vec<ValueId>> = Vec::with_capacity(description.ops.len());
        for (position, op) in description.ops.into_iter().enumerate() {
            let operands = op
                .operands
                .iter()
                .map(|reference| match *reference {
                    ValueRef::Argument { arg } => arguments.get(arg).copied(),
                    ValueRef::Result {
                        op: producer,
                        result,
                    } => results.get(producer).and_then(|r| r.get(result)).copied(),
                })
                .collect::<Option<Vec<_>>>()
                .ok_or(GraphError::UnresolvedOperand { position })?;
            let id = graph.append_op(op.kind, operands, op.results);
            graph.op_mut(id).volatile = op.volatile;
            results.push(graph.op(id).results().to_vec());
        }
        graph.validate()?;
        Ok(graph)
    }
}

impl From<Graph> for GraphDescription {
    fn from(graph: Graph) -> Self {
        let positions = graph
            .block()
            .iter()
            .enumerate()
            .map(|(position, op)| (*op, position))
            .collect::<HashMap<_, _>>();
        let arguments = graph
            .arguments()
            .iter()
            .map(|arg| graph.value_type(*arg).clone())
            .collect();
        let ops = graph
            .block()
            .iter()
            .map(|op| {
                let operation = graph.op(*op);
                let operands = operation
                    .operands()
                    .iter()
                    .map(|value| match graph.value(*value).def {
                        ValueDef::Argument(arg) => ValueRef::Argument { arg },
                        ValueDef::Result { op, index } => ValueRef::Result {
                            op: positions[&op],
                            result: index,
                        },
                    })
                    .collect();
                OpDescription {
                    kind: operation.kind.clone(),
                    operands,
                    results: operation
                        .results()
                        .iter()
                        .map(|r| graph.value_type(*r).clone())
                        .collect(),
                    volatile: operation.volatile,
                }
            })
            .collect();
        GraphDescription { arguments, ops }
    }
}
