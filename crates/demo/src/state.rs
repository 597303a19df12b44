//! Internal objects of the demo: how values and operators are processed.

use async_trait::async_trait;
use serde_json::{Value as Json, json};
use tracing::debug;

use drover_core::{ElementId, Phase};
use drover_objectbase::{Object, ObjectMeta};
use drover_processing::{
    Acceptance, ExternalStates, InternalObject, InternalState, ProcessRequest, ProcessResult,
    TargetSpec,
};

use crate::model::{GATHER, OPERATOR, PROPAGATE, VALUE, VALUE_STATE};
use crate::objects::{OperatorSpec, ValueSpec};

macro_rules! internal {
    ($name:ident) => {
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            pub meta: ObjectMeta,
            pub state: InternalState,
        }

        impl Object for $name {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

internal!(ValueState);
internal!(OperatorState);

#[async_trait]
impl InternalObject for ValueState {
    fn internal_state(&self) -> &InternalState {
        &self.state
    }

    fn internal_state_mut(&mut self) -> &mut InternalState {
        &mut self.state
    }

    fn accept_external_state(&self, _phase: &Phase, externals: &ExternalStates) -> Acceptance {
        let Some(state) = externals.get(VALUE) else {
            return Acceptance::Invalid("no value object".to_string());
        };
        match serde_json::from_value::<ValueSpec>(state.clone()) {
            Ok(spec) => Acceptance::Accepted(TargetSpec::new(json!(spec.value))),
            Err(e) => Acceptance::Invalid(format!("malformed value: {e}")),
        }
    }

    async fn process(&self, request: ProcessRequest) -> ProcessResult {
        if request.deleting {
            return ProcessResult::Deleted;
        }
        debug!(element = %request.element, value = %request.spec, "Propagating value");
        ProcessResult::Completed(request.spec)
    }
}

fn operator_spec(externals: &ExternalStates) -> Result<OperatorSpec, String> {
    let state = externals
        .get(OPERATOR)
        .ok_or_else(|| "no operator object".to_string())?;
    let spec: OperatorSpec =
        serde_json::from_value(state.clone()).map_err(|e| format!("malformed operator: {e}"))?;
    if spec.operands.is_empty() && spec.operation.needs_operands() {
        return Err(format!("operation {:?} needs operands", spec.operation));
    }
    Ok(spec)
}

fn value_element(of: &ElementId, name: &str) -> ElementId {
    ElementId::of(VALUE_STATE, of.object().namespace(), name, PROPAGATE)
}

impl OperatorState {
    /// Operand values in the order the operator names them.
    fn gather(request: &ProcessRequest) -> ProcessResult {
        let operands: Vec<String> = match serde_json::from_value(request.spec.clone()) {
            Ok(operands) => operands,
            Err(e) => return ProcessResult::Invalid(format!("malformed operands: {e}")),
        };
        let mut values = Vec::with_capacity(operands.len());
        for name in &operands {
            let id = value_element(&request.element, name);
            match request.inputs.get(&id).and_then(Json::as_i64) {
                Some(value) => values.push(value),
                None => return ProcessResult::Failed(format!("operand {name} has no number")),
            }
        }
        ProcessResult::Completed(json!(values))
    }

    fn calculate(request: &ProcessRequest) -> ProcessResult {
        let spec: OperatorSpec = match serde_json::from_value(request.spec.clone()) {
            Ok(spec) => spec,
            Err(e) => return ProcessResult::Invalid(format!("malformed operator: {e}")),
        };
        let gathered = request.element.object().element(GATHER);
        let operands: Option<Vec<i64>> = request
            .inputs
            .get(&gathered)
            .and_then(Json::as_array)
            .map(|values| values.iter().filter_map(Json::as_i64).collect());
        let Some(operands) = operands else {
            return ProcessResult::Failed("gathered operands missing".to_string());
        };
        match spec.operation.apply(&operands) {
            Some(result) => {
                debug!(element = %request.element, ?operands, result, "Calculated");
                ProcessResult::Completed(json!(result))
            }
            None => ProcessResult::Failed(format!("{:?} of {operands:?} overflows", spec.operation)),
        }
    }
}

#[async_trait]
impl InternalObject for OperatorState {
    fn internal_state(&self) -> &InternalState {
        &self.state
    }

    fn internal_state_mut(&mut self) -> &mut InternalState {
        &mut self.state
    }

    fn accept_external_state(&self, phase: &Phase, externals: &ExternalStates) -> Acceptance {
        let spec = match operator_spec(externals) {
            Ok(spec) => spec,
            Err(message) => return Acceptance::Invalid(message),
        };
        if phase.as_str() == GATHER {
            let own = externals.object.element(GATHER);
            let links = spec.operands.iter().map(|name| value_element(&own, name));
            Acceptance::Accepted(TargetSpec::new(json!(spec.operands)).with_links(links))
        } else {
            let gathered = externals.object.element(GATHER);
            Acceptance::Accepted(TargetSpec::new(json!(spec)).with_links([gathered]))
        }
    }

    async fn process(&self, request: ProcessRequest) -> ProcessResult {
        if request.deleting {
            return ProcessResult::Deleted;
        }
        if request.element.phase().as_str() == GATHER {
            Self::gather(&request)
        } else {
            Self::calculate(&request)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::BTreeMap;

    use drover_core::{ObjectId, RunId};

    use super::*;
    use crate::model::{CALCULATE, OPERATOR_STATE};

    fn externals(spec: Json) -> ExternalStates {
        ExternalStates {
            object: ObjectId::new(OPERATOR_STATE, "ns", "c"),
            states: BTreeMap::from([(OPERATOR.to_string(), spec)]),
        }
    }

    fn request(phase: &str, spec: Json, inputs: BTreeMap<ElementId, Json>) -> ProcessRequest {
        ProcessRequest {
            element: ElementId::of(OPERATOR_STATE, "ns", "c", phase),
            run: RunId::from_string("run"),
            spec,
            inputs,
            deleting: false,
        }
    }

    #[test]
    fn test_gather_links_operands() {
        let externals = externals(json!({"operands": ["a", "b"]}));
        let Acceptance::Accepted(target) =
            OperatorState::default().accept_external_state(&Phase::new(GATHER), &externals)
        else {
            panic!("rejected");
        };
        assert_eq!(target.spec, json!(["a", "b"]));
        assert_eq!(
            target.links,
            vec![
                ElementId::of(VALUE_STATE, "ns", "a", PROPAGATE),
                ElementId::of(VALUE_STATE, "ns", "b", PROPAGATE),
            ]
        );
    }

    #[test]
    fn test_calculate_links_own_gather_phase() {
        let externals = externals(json!({"operands": ["a"], "operation": "mul"}));
        let Acceptance::Accepted(target) =
            OperatorState::default().accept_external_state(&Phase::new(CALCULATE), &externals)
        else {
            panic!("rejected");
        };
        assert_eq!(target.links, vec![ElementId::of(OPERATOR_STATE, "ns", "c", GATHER)]);
        assert_eq!(target.spec["operation"], json!("mul"));
    }

    #[test]
    fn test_operation_without_operands_is_invalid() {
        let externals = externals(json!({"operands": [], "operation": "sub"}));
        let acceptance =
            OperatorState::default().accept_external_state(&Phase::new(GATHER), &externals);
        assert!(matches!(acceptance, Acceptance::Invalid(m) if m.contains("needs operands")));
    }

    #[tokio::test]
    async fn test_gather_keeps_operand_order() {
        let inputs = BTreeMap::from([
            (ElementId::of(VALUE_STATE, "ns", "a", PROPAGATE), json!(5)),
            (ElementId::of(VALUE_STATE, "ns", "b", PROPAGATE), json!(6)),
        ]);
        let result = OperatorState::default()
            .process(request(GATHER, json!(["b", "a"]), inputs))
            .await;
        assert_eq!(result, ProcessResult::Completed(json!([6, 5])));
    }

    #[tokio::test]
    async fn test_calculate_folds_gathered_operands() {
        let inputs = BTreeMap::from([(
            ElementId::of(OPERATOR_STATE, "ns", "c", GATHER),
            json!([6, 5]),
        )]);
        let spec = json!({"operands": ["b", "a"], "operation": "sub"});
        let result = OperatorState::default()
            .process(request(CALCULATE, spec, inputs))
            .await;
        assert_eq!(result, ProcessResult::Completed(json!(1)));
    }

    #[tokio::test]
    async fn test_overflow_fails() {
        let inputs = BTreeMap::from([(
            ElementId::of(OPERATOR_STATE, "ns", "c", GATHER),
            json!([i64::MAX, 2]),
        )]);
        let spec = json!({"operands": ["a", "b"], "operation": "mul"});
        let result = OperatorState::default()
            .process(request(CALCULATE, spec, inputs))
            .await;
        assert!(matches!(result, ProcessResult::Failed(m) if m.contains("overflows")));
    }
}
