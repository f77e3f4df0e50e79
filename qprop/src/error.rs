//! Errors reported for malformed input graphs. Propagation itself never fails: anything it cannot
//! decide is left unquantized.
use crate::ir::{OpId, ValueId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("operation at position {position} reads an operand that is not defined before it")]
    UnresolvedOperand { position: usize },
    #[error("{op} reads {value} before it is defined")]
    UseBeforeDef { op: OpId, value: ValueId },
    #[error("use list of {value} does not match the operand lists")]
    UseListMismatch { value: ValueId },
    #[error("{op} ({kind}) has {operands} operands and {results} results")]
    Arity {
        op: OpId,
        kind: String,
        operands: usize,
        results: usize,
    },
    #[error("constant {op} holds {actual} elements but its type has {expected}")]
    ConstantShape {
        op: OpId,
        expected: usize,
        actual: usize,
    },
    #[error("terminator {op} is not the last operation of the block")]
    TerminatorNotLast { op: OpId },
}
