use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use super::{description::GraphDescription, types::TensorType};
use crate::error::GraphError;

/// Handle of a value (block argument or operation result) in a [`Graph`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize,
)]
#[display("%{_0}")]
pub struct ValueId(usize);

impl ValueId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handle of an operation in a [`Graph`]. Handles are stable across insertions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize,
)]
#[display("op{_0}")]
pub struct OpId(usize);

impl OpId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    /// The n-th block argument.
    Argument(usize),
    Result { op: OpId, index: usize },
}

/// A single operand slot reading a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{op}#{operand}")]
pub struct Use {
    pub op: OpId,
    pub operand: usize,
}

impl Use {
    pub fn new(op: OpId, operand: usize) -> Self {
        Self { op, operand }
    }
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: TensorType,
    pub def: ValueDef,
    uses: Vec<Use>,
}

impl ValueData {
    pub fn uses(&self) -> &[Use] {
        &self.uses
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Literal tensor content, stored row major.
    Constant { values: Vec<f64> },
    /// Marker converting its operand to the quantized result type.
    Quantize,
    /// Marker converting a quantized operand back to its expressed type.
    Dequantize,
    Return,
    /// Any other operation; its quantization behavior is looked up by name.
    Compute { name: String },
}

impl OpKind {
    pub fn compute(name: impl Into<String>) -> Self {
        OpKind::Compute { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            OpKind::Constant { .. } => "constant",
            OpKind::Quantize => "quantize",
            OpKind::Dequantize => "dequantize",
            OpKind::Return => "return",
            OpKind::Compute { name } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    operands: Vec<ValueId>,
    results: Vec<ValueId>,
    /// Set on quantize markers inserted by the engine; they can be dropped without changing the
    /// float semantics of the program.
    pub volatile: bool,
}

impl Operation {
    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }

    pub fn is_quantize(&self) -> bool {
        matches!(self.kind, OpKind::Quantize)
    }

    pub fn is_dequantize(&self) -> bool {
        matches!(self.kind, OpKind::Dequantize)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, OpKind::Constant { .. })
    }

    pub fn constant_values(&self) -> Option<&[f64]> {
        match &self.kind {
            OpKind::Constant { values } => Some(values),
            _ => None,
        }
    }
}

/// Where [`Graph::insert_op`] places a new operation. The point moves past every inserted
/// operation so successive insertions keep program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    BlockStart,
    After(OpId),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "GraphDescription", into = "GraphDescription")]
pub struct Graph {
    values: Vec<ValueData>,
    ops: Vec<Operation>,
    block: Vec<OpId>,
    arguments: Vec<ValueId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_argument(&mut self, ty: TensorType) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(ValueData {
            ty,
            def: ValueDef::Argument(self.arguments.len()),
            uses: Vec::new(),
        });
        self.arguments.push(id);
        id
    }

    /// Appends an operation at the end of the block.
    pub fn append_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> OpId {
        let id = self.create_op(kind, operands, result_types);
        self.block.push(id);
        id
    }

    /// Appends a constant op and returns its single result.
    pub fn append_constant(&mut self, ty: TensorType, values: Vec<f64>) -> ValueId {
        let op = self.append_op(OpKind::Constant { values }, vec![], vec![ty]);
        self.ops[op.0].results[0]
    }

    /// Inserts an operation at `point` and advances `point` past it.
    pub fn insert_op(
        &mut self,
        point: &mut InsertPoint,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> OpId {
        let position = match *point {
            InsertPoint::BlockStart => 0,
            InsertPoint::After(anchor) => self
                .position(anchor)
                .map(|p| p + 1)
                .unwrap_or(self.block.len()),
        };
        let id = self.create_op(kind, operands, result_types);
        self.block.insert(position, id);
        *point = InsertPoint::After(id);
        id
    }

    /// Copies `op` (same kind and operands, fresh results) and inserts the copy at `point`.
    pub fn clone_op(&mut self, op: OpId, point: &mut InsertPoint) -> OpId {
        let source = &self.ops[op.0];
        let kind = source.kind.clone();
        let operands = source.operands.clone();
        let result_types = source
            .results
            .iter()
            .map(|r| self.values[r.0].ty.clone())
            .collect();
        self.insert_op(point, kind, operands, result_types)
    }

    fn create_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> OpId {
        let id = OpId(self.ops.len());
        for (operand, value) in operands.iter().enumerate() {
            self.values[value.0].uses.push(Use::new(id, operand));
        }
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                let value = ValueId(self.values.len());
                self.values.push(ValueData {
                    ty,
                    def: ValueDef::Result { op: id, index },
                    uses: Vec::new(),
                });
                value
            })
            .collect();
        self.ops.push(Operation {
            kind,
            operands,
            results,
            volatile: false,
        });
        id
    }

    pub fn op(&self, op: OpId) -> &Operation {
        &self.ops[op.0]
    }

    pub fn op_mut(&mut self, op: OpId) -> &mut Operation {
        &mut self.ops[op.0]
    }

    pub fn value(&self, value: ValueId) -> &ValueData {
        &self.values[value.0]
    }

    pub fn value_type(&self, value: ValueId) -> &TensorType {
        &self.values[value.0].ty
    }

    pub fn arguments(&self) -> &[ValueId] {
        &self.arguments
    }

    /// Operations in program order.
    pub fn block(&self) -> &[OpId] {
        &self.block
    }

    pub fn num_ops(&self) -> usize {
        self.block.len()
    }

    pub fn position(&self, op: OpId) -> Option<usize> {
        self.block.iter().position(|o| *o == op)
    }

    pub fn operand(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.0].operands[index]
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.0].results[index]
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        &self.values[value.0].uses
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.values[value.0].uses.len() == 1
    }

    /// The consuming operation when `value` has exactly one use.
    pub fn single_user(&self, value: ValueId) -> Option<OpId> {
        match self.values[value.0].uses.as_slice() {
            [only] => Some(only.op),
            _ => None,
        }
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value.0].def {
            ValueDef::Result { op, .. } => Some(op),
            ValueDef::Argument(_) => None,
        }
    }

    /// Points operand `index` of `op` at `value`, keeping both use lists in sync.
    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        let old = self.ops[op.0].operands[index];
        if old == value {
            return;
        }
        let slot = Use::new(op, index);
        self.values[old.0].uses.retain(|u| *u != slot);
        self.values[value.0].uses.push(slot);
        self.ops[op.0].operands[index] = value;
    }

    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        for slot in self.values[old.0].uses.clone() {
            self.set_operand(slot.op, slot.operand, new);
        }
    }

    /// Like [`Self::replace_all_uses_with`] but leaves the operands of `except` untouched.
    pub fn replace_all_uses_except(&mut self, old: ValueId, new: ValueId, except: OpId) {
        for slot in self.values[old.0].uses.clone() {
            if slot.op != except {
                self.set_operand(slot.op, slot.operand, new);
            }
        }
    }

    /// Checks that every operand is defined before it is read, that use lists mirror operand
    /// lists, and that marker, constant and terminator operations are well formed.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut defined = vec![false; self.values.len()];
        for arg in &self.arguments {
            defined[arg.0] = true;
        }
        for (position, op) in self.block.iter().enumerate() {
            let operation = &self.ops[op.0];
            if matches!(operation.kind, OpKind::Return) && position + 1 != self.block.len() {
                return Err(GraphError::TerminatorNotLast { op: *op });
            }
            let (operands, results) = match &operation.kind {
                OpKind::Constant { .. } => (Some(0), Some(1)),
                OpKind::Quantize | OpKind::Dequantize => (Some(1), Some(1)),
                OpKind::Return => (None, Some(0)),
                OpKind::Compute { .. } => (None, None),
            };
            if operands.is_some_and(|n| n != operation.operands.len())
                || results.is_some_and(|n| n != operation.results.len())
            {
                return Err(GraphError::Arity {
                    op: *op,
                    kind: operation.name().to_string(),
                    operands: operation.operands.len(),
                    results: operation.results.len(),
                });
            }
            if let OpKind::Constant { values } = &operation.kind {
                let expected = self.values[operation.results[0].0].ty.num_elements();
                if values.len() != expected {
                    return Err(GraphError::ConstantShape {
                        op: *op,
                        expected,
                        actual: values.len(),
                    });
                }
            }
            for (index, value) in operation.operands.iter().enumerate() {
                if !defined[value.0] {
                    return Err(GraphError::UseBeforeDef {
                        op: *op,
                        value: *value,
                    });
                }
                if !self.values[value.0].uses.contains(&Use::new(*op, index)) {
                    return Err(GraphError::UseListMismatch { value: *value });
                }
            }
            for result in &operation.results {
                defined[result.0] = true;
            }
        }
        for (index, data) in self.values.iter().enumerate() {
            let consistent = data.uses.iter().all(|u| {
                self.ops[u.op.0].operands.get(u.operand) == Some(&ValueId(index))
            });
            if !consistent {
                return Err(GraphError::UseListMismatch {
                    value: ValueId(index),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn relu_chain() -> (Graph, ValueId, OpId) {
        let mut graph = Graph::new();
        let x = graph.add_argument(TensorType::float(vec![4]));
        let relu = graph.append_op(
            OpKind::compute("relu"),
            vec![x],
            vec![TensorType::float(vec![4])],
        );
        let y = graph.result(relu, 0);
        graph.append_op(OpKind::Return, vec![y], vec![]);
        (graph, x, relu)
    }

    #[test]
    fn test_insert_keeps_order() {
        let (mut graph, x, relu) = relu_chain();
        let mut point = InsertPoint::BlockStart;
        let q = graph.insert_op(
            &mut point,
            OpKind::Quantize,
            vec![x],
            vec![TensorType::float(vec![4])],
        );
        let quantized = graph.result(q, 0);
        let dq = graph.insert_op(
            &mut point,
            OpKind::Dequantize,
            vec![quantized],
            vec![TensorType::float(vec![4])],
        );
        assert_eq!(&graph.block()[..3], &[q, dq, relu]);
        assert_eq!(point, InsertPoint::After(dq));
        let dequantized = graph.result(dq, 0);
        graph.replace_all_uses_except(x, dequantized, q);
        assert_eq!(graph.operand(relu, 0), dequantized);
        assert_eq!(graph.single_user(x), Some(q));
        graph.validate().expect("valid graph");
    }

    #[test]
    fn test_set_operand_updates_uses() {
        let (mut graph, x, relu) = relu_chain();
        let y = graph.result(relu, 0);
        let ret = graph.block()[1];
        graph.set_operand(ret, 0, x);
        assert!(graph.uses(y).is_empty());
        assert_eq!(graph.uses(x), &[Use::new(relu, 0), Use::new(ret, 0)]);
        graph.validate().expect("valid graph");
    }

    #[test]
    fn test_clone_op() {
        let mut graph = Graph::new();
        let c = graph.append_constant(TensorType::float(vec![2]), vec![1.0, 2.0]);
        let cst = graph.defining_op(c).expect("constant op");
        let mut point = InsertPoint::After(cst);
        let copy = graph.clone_op(cst, &mut point);
        assert_ne!(graph.result(copy, 0), c);
        assert_eq!(graph.op(copy).constant_values(), Some(&[1.0, 2.0][..]));
        assert_eq!(graph.block(), &[cst, copy]);
    }

    #[test]
    fn test_validate_rejects_bad_graphs() {
        let (mut graph, x, _) = relu_chain();
        graph.append_op(OpKind::compute("relu"), vec![x], vec![]);
        assert!(matches!(
            graph.validate(),
            Err(GraphError::TerminatorNotLast { .. })
        ));

        let mut graph = Graph::new();
        graph.append_op(
            OpKind::Constant { values: vec![1.0] },
            vec![],
            vec![TensorType::float(vec![3])],
        );
        assert!(matches!(
            graph.validate(),
            Err(GraphError::ConstantShape {
                expected: 3,
                actual: 1,
                ..
            })
        ));
    }
}
