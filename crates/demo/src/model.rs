//! The demo metamodel and its engine types.

use drover_core::{ObjectId, Result, TypeId};
use drover_metamodel::{ExternalTypeSpec, InternalTypeSpec, MetaModel, MetaModelSpec};
use drover_objectbase::{ObjectMeta, Objectbase};
use drover_processing::EngineTypes;
use tracing::info;

use crate::objects::{Operation, Operator, OperatorSpec, Value, ValueSpec};
use crate::state::{OperatorState, ValueState};

pub const NAMESPACE: &str = "Namespace";
pub const UPDATE_REQUEST: &str = "UpdateRequest";
pub const VALUE: &str = "Value";
pub const VALUE_STATE: &str = "ValueState";
pub const PROPAGATE: &str = "propagate";
pub const OPERATOR: &str = "Operator";
pub const OPERATOR_STATE: &str = "OperatorState";
pub const GATHER: &str = "gather";
pub const CALCULATE: &str = "calculate";

#[must_use]
pub fn demo_types() -> EngineTypes {
    EngineTypes::new()
        .with_namespace(NAMESPACE)
        .with_update_request(UPDATE_REQUEST)
        .with_internal::<ValueState>(VALUE_STATE)
        .with_internal::<OperatorState>(OPERATOR_STATE)
        .with_external::<Value>(VALUE)
        .with_external::<Operator>(OPERATOR)
}

#[must_use]
pub fn demo_metamodel_spec() -> MetaModelSpec {
    MetaModelSpec::new(NAMESPACE)
        .with_update_request_type(UPDATE_REQUEST)
        .with_internal(InternalTypeSpec::new(VALUE_STATE).phase(PROPAGATE, []))
        .with_internal(
            InternalTypeSpec::new(OPERATOR_STATE)
                .phase(GATHER, [TypeId::new(VALUE_STATE, PROPAGATE)])
                .phase(CALCULATE, [TypeId::new(OPERATOR_STATE, GATHER)]),
        )
        .with_external(ExternalTypeSpec::new(VALUE, TypeId::new(VALUE_STATE, PROPAGATE)))
        .with_external(ExternalTypeSpec::new(OPERATOR, TypeId::new(OPERATOR_STATE, GATHER)))
}

/// Compile the demo metamodel against the scheme of `types`.
///
/// # Errors
///
/// Returns `InvalidMetaModel` if the types do not cover the model.
pub fn demo_metamodel(types: &EngineTypes) -> Result<MetaModel> {
    MetaModel::new("demo", &demo_metamodel_spec(), types.scheme())
}

/// Write the sample objects `a = 5`, `b = 6` and `c = a + b` into `namespace`.
///
/// # Errors
///
/// Returns store errors, `Modified` if the objects already exist.
pub async fn seed_namespace(store: &dyn Objectbase, namespace: &str) -> Result<()> {
    for (name, value) in [("a", 5), ("b", 6)] {
        let mut object = Value {
            meta: ObjectMeta::new(ObjectId::new(VALUE, namespace, name)),
            spec: ValueSpec { value },
            ..Value::default()
        };
        store.set_object(&mut object).await?;
    }
    let mut operator = Operator {
        meta: ObjectMeta::new(ObjectId::new(OPERATOR, namespace, "c")),
        spec: OperatorSpec {
            operands: vec!["a".to_string(), "b".to_string()],
            operation: Operation::Add,
        },
        ..Operator::default()
    };
    store.set_object(&mut operator).await?;
    info!(namespace, "Seeded demo objects");
    Ok(())
}
