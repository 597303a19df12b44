#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drover-demo
//!
//! A small metamodel exercising the engine end to end.
//!
//! `Value` objects publish a number through `ValueState:propagate`.
//! `Operator` objects combine the values they name in two phases:
//! `OperatorState:gather` collects the operand values and
//! `OperatorState:calculate` folds them with the operation.

pub mod model;
pub mod objects;
pub mod state;

pub use model::{
    CALCULATE, GATHER, NAMESPACE, OPERATOR, OPERATOR_STATE, PROPAGATE, UPDATE_REQUEST, VALUE,
    VALUE_STATE, demo_metamodel, demo_metamodel_spec, demo_types, seed_namespace,
};
pub use objects::{Operation, Operator, OperatorSpec, Value, ValueSpec};
pub use state::{OperatorState, ValueState};
