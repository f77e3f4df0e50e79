//! Per-value quantization states.
//!
//! Every distinct graph value gets at most one [`QuantState`]; operand slots, results and block
//! arguments only hold a [`StateId`] into the store, so two positions reading the same value
//! always observe the same parameters.
use std::collections::{BTreeMap, HashMap};

use derive_more::Display;

use crate::{
    ir::{OpId, TensorType, Use, ValueId},
    quantization::QuantParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("state{_0}")]
pub struct StateId(usize);

#[derive(Debug, Clone, PartialEq)]
pub struct QuantState {
    pub params: Option<QuantParams>,
    /// The value was already quantized before propagation; its parameters never change.
    pub immutable: bool,
}

impl QuantState {
    pub fn is_empty(&self) -> bool {
        self.params.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RequantizePosition {
    #[display("none")]
    NoRequantize,
    /// Specific consumers need the value in another representation.
    #[display("before-consumer")]
    BeforeConsumer,
    /// Everything after the producer needs another representation.
    #[display("after-producer")]
    AfterProducer,
}

/// A pending conversion of a value whose parameters were already settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RequantizeState {
    pub position: RequantizePosition,
    pub params: QuantParams,
    /// Operand slots needing `params`; only meaningful before consumers.
    pub users: Vec<Use>,
}

/// How a value was reached when its state was looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Argument(usize),
    Operand(Use),
    Result { op: OpId, index: usize },
}

/// Outcome of proposing parameters for a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Unchanged,
    /// The state was empty and now holds the proposal.
    Settled,
    /// Mutable parameters were overwritten in place.
    Replaced,
    /// The state keeps its parameters and a requantization was queued instead.
    Requantized,
}

impl Assignment {
    pub fn changed(&self) -> bool {
        !matches!(self, Assignment::Unchanged)
    }
}

#[derive(Debug, Default)]
pub struct StateStore {
    states: Vec<QuantState>,
    requantizes: Vec<Vec<RequantizeState>>,
    /// Operations bound to each state through an operand or a result.
    dependents: Vec<Vec<OpId>>,
    value_to_state: HashMap<ValueId, StateId>,
    operand_states: HashMap<Use, StateId>,
    result_states: HashMap<(OpId, usize), StateId>,
    arg_states: BTreeMap<usize, StateId>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state of `value`, creating it on first sight, and records `binding` as one
    /// more position it is reachable from. A new state is immutable iff `ty` is quantized.
    pub fn get_or_create(&mut self, value: ValueId, ty: &TensorType, binding: Binding) -> StateId {
        let id = match self.value_to_state.get(&value) {
            Some(id) => *id,
            None => {
                let id = StateId(self.states.len());
                let params = ty.quant_params().cloned();
                self.states.push(QuantState {
                    immutable: params.is_some(),
                    params,
                });
                self.requantizes.push(Vec::new());
                self.dependents.push(Vec::new());
                self.value_to_state.insert(value, id);
                id
            }
        };
        match binding {
            Binding::Argument(index) => {
                self.arg_states.insert(index, id);
            }
            Binding::Operand(slot) => {
                self.operand_states.insert(slot, id);
                self.add_dependent(id, slot.op);
            }
            Binding::Result { op, index } => {
                self.result_states.insert((op, index), id);
                self.add_dependent(id, op);
            }
        }
        id
    }

    fn add_dependent(&mut self, id: StateId, op: OpId) {
        let dependents = &mut self.dependents[id.0];
        if !dependents.contains(&op) {
            dependents.push(op);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, id: StateId) -> &QuantState {
        &self.states[id.0]
    }

    pub fn params(&self, id: StateId) -> Option<&QuantParams> {
        self.states[id.0].params.as_ref()
    }

    pub fn state_of(&self, value: ValueId) -> Option<StateId> {
        self.value_to_state.get(&value).copied()
    }

    pub fn operand_state(&self, op: OpId, index: usize) -> Option<StateId> {
        self.operand_states.get(&Use::new(op, index)).copied()
    }

    pub fn result_state(&self, op: OpId, index: usize) -> Option<StateId> {
        self.result_states.get(&(op, index)).copied()
    }

    pub fn arg_state(&self, index: usize) -> Option<StateId> {
        self.arg_states.get(&index).copied()
    }

    pub fn requantizes(&self, id: StateId) -> &[RequantizeState] {
        &self.requantizes[id.0]
    }

    pub fn dependents(&self, id: StateId) -> &[OpId] {
        &self.dependents[id.0]
    }

    /// Stores `params` if the state is empty. `None` means the state already holds other
    /// parameters and the caller has to resolve the conflict.
    fn settle(&mut self, id: StateId, params: &QuantParams) -> Option<Assignment> {
        let state = &mut self.states[id.0];
        if state.is_empty() {
            state.params = Some(params.clone());
            return Some(Assignment::Settled);
        }
        (state.params.as_ref() == Some(params)).then_some(Assignment::Unchanged)
    }

    /// Proposes `params` for the state read by operand slot `user`. A conflicting proposal joins
    /// an identical pending before-consumer target or opens a new one.
    pub fn propose_operand(&mut self, id: StateId, user: Use, params: QuantParams) -> Assignment {
        if let Some(outcome) = self.settle(id, &params) {
            return outcome;
        }
        let requantizes = &mut self.requantizes[id.0];
        let pending = requantizes
            .iter()
            .position(|r| r.position == RequantizePosition::BeforeConsumer && r.params == params);
        match pending {
            Some(index) if requantizes[index].users.contains(&user) => Assignment::Unchanged,
            Some(index) => {
                requantizes[index].users.push(user);
                Assignment::Requantized
            }
            None => {
                requantizes.push(RequantizeState {
                    position: RequantizePosition::BeforeConsumer,
                    params,
                    users: vec![user],
                });
                Assignment::Requantized
            }
        }
    }

    /// Proposes `params` for the state produced by a result.
    pub fn propose_result(&mut self, id: StateId, params: QuantParams) -> Assignment {
        if let Some(outcome) = self.settle(id, &params) {
            return outcome;
        }
        let requantizes = &mut self.requantizes[id.0];
        let queued = requantizes
            .iter()
            .any(|r| r.position == RequantizePosition::AfterProducer && r.params == params);
        if queued {
            return Assignment::Unchanged;
        }
        requantizes.push(RequantizeState {
            position: RequantizePosition::AfterProducer,
            params,
            users: Vec::new(),
        });
        Assignment::Requantized
    }

    /// Overwrites mutable parameters in place. Immutable states are treated like any other
    /// conflict on operand slot `user`.
    pub fn override_operand(&mut self, id: StateId, user: Use, params: QuantParams) -> Assignment {
        if self.states[id.0].immutable {
            return self.propose_operand(id, user, params);
        }
        if let Some(outcome) = self.settle(id, &params) {
            return outcome;
        }
        self.states[id.0].params = Some(params);
        Assignment::Replaced
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ir::{Graph, OpKind},
        quantization::StorageType,
    };

    fn params(scale: f64) -> QuantParams {
        QuantParams::per_tensor(StorageType::new(8, true, false), scale, 0)
    }

    fn shared_operand_graph() -> (Graph, ValueId, OpId, OpId) {
        let mut graph = Graph::new();
        let x = graph.add_argument(TensorType::float(vec![4]));
        let a = graph.append_op(OpKind::compute("relu"), vec![x], vec![]);
        let b = graph.append_op(OpKind::compute("tanh"), vec![x], vec![]);
        (graph, x, a, b)
    }

    #[test]
    fn test_shared_value_shares_state() {
        let (graph, x, a, b) = shared_operand_graph();
        let ty = graph.value_type(x).clone();
        let mut store = StateStore::new();
        let from_arg = store.get_or_create(x, &ty, Binding::Argument(0));
        let from_a = store.get_or_create(x, &ty, Binding::Operand(Use::new(a, 0)));
        let from_b = store.get_or_create(x, &ty, Binding::Operand(Use::new(b, 0)));
        assert_eq!(from_arg, from_a);
        assert_eq!(from_a, from_b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.dependents(from_a), &[a, b]);

        assert_eq!(
            store.propose_operand(from_a, Use::new(a, 0), params(0.5)),
            Assignment::Settled
        );
        let through_b = store.operand_state(b, 0).expect("bound operand");
        assert_eq!(store.params(through_b), Some(&params(0.5)));
        assert_eq!(store.params(store.arg_state(0).expect("bound argument")), Some(&params(0.5)));
    }

    #[test]
    fn test_quantized_value_is_immutable() {
        let (graph, x, a, _) = shared_operand_graph();
        let quantized = params(0.25)
            .cast_from_expressed(graph.value_type(x))
            .expect("float type");
        let mut store = StateStore::new();
        let id = store.get_or_create(x, &quantized, Binding::Operand(Use::new(a, 0)));
        assert!(store.state(id).immutable);
        assert_eq!(store.params(id), Some(&params(0.25)));

        assert_eq!(
            store.override_operand(id, Use::new(a, 0), params(0.5)),
            Assignment::Requantized
        );
        assert_eq!(store.params(id), Some(&params(0.25)));
    }

    #[test]
    fn test_conflicts_never_overwrite() {
        let (graph, x, a, b) = shared_operand_graph();
        let ty = graph.value_type(x).clone();
        let mut store = StateStore::new();
        let id = store.get_or_create(x, &ty, Binding::Operand(Use::new(a, 0)));
        store.propose_operand(id, Use::new(a, 0), params(1.0));

        assert_eq!(
            store.propose_operand(id, Use::new(a, 0), params(1.0)),
            Assignment::Unchanged
        );
        assert_eq!(
            store.propose_operand(id, Use::new(a, 0), params(2.0)),
            Assignment::Requantized
        );
        assert_eq!(store.params(id), Some(&params(1.0)));
        assert_eq!(
            store.requantizes(id),
            &[RequantizeState {
                position: RequantizePosition::BeforeConsumer,
                params: params(2.0),
                users: vec![Use::new(a, 0)],
            }]
        );

        // same target from another consumer joins the pending entry
        assert_eq!(
            store.propose_operand(id, Use::new(b, 0), params(2.0)),
            Assignment::Requantized
        );
        assert_eq!(
            store.propose_operand(id, Use::new(b, 0), params(2.0)),
            Assignment::Unchanged
        );
        assert_eq!(store.requantizes(id).len(), 1);
        assert_eq!(
            store.requantizes(id)[0].users,
            vec![Use::new(a, 0), Use::new(b, 0)]
        );

        assert_eq!(store.propose_result(id, params(3.0)), Assignment::Requantized);
        assert_eq!(store.propose_result(id, params(3.0)), Assignment::Unchanged);
        assert_eq!(store.requantizes(id).len(), 2);
        assert_eq!(
            store.requantizes(id)[1].position,
            RequantizePosition::AfterProducer
        );
    }

    #[test]
    fn test_override_replaces_mutable_params() {
        let (graph, x, a, _) = shared_operand_graph();
        let ty = graph.value_type(x).clone();
        let mut store = StateStore::new();
        let id = store.get_or_create(x, &ty, Binding::Operand(Use::new(a, 0)));
        assert_eq!(
            store.override_operand(id, Use::new(a, 0), params(1.0)),
            Assignment::Settled
        );
        assert_eq!(
            store.override_operand(id, Use::new(a, 0), params(2.0)),
            Assignment::Replaced
        );
        assert_eq!(store.params(id), Some(&params(2.0)));
        assert!(store.requantizes(id).is_empty());
    }
}
