//! End to end scenarios over the Value/Operator metamodel.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as Json, json};

use drover_core::{ElementId, ObjectId};
use drover_demo::{
    CALCULATE, GATHER, OPERATOR, OPERATOR_STATE, Operation, Operator, PROPAGATE, VALUE,
    VALUE_STATE, Value, demo_metamodel, demo_types, seed_namespace,
};
use drover_objectbase::{InMemoryObjectbase, Object, Objectbase, get_typed, modify};
use drover_processing::{EngineConfig, PhaseState, ProcessingStatus, Processor};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Engine {
    store: Arc<InMemoryObjectbase>,
    processor: Processor,
}

impl Engine {
    async fn start() -> Self {
        let types = demo_types();
        let metamodel = Arc::new(demo_metamodel(&types).unwrap());
        let store = InMemoryObjectbase::new_arc(types.scheme().clone());
        let config = EngineConfig::default().workers(4).backoff(5, 50);
        let processor = Processor::new(
            Arc::clone(&store) as Arc<dyn Objectbase>,
            metamodel,
            types,
            config,
        )
        .unwrap();
        processor.start().await.unwrap();
        Self { store, processor }
    }

    async fn settled_with(&self, id: &ElementId, output: Json) -> PhaseState {
        self.processor
            .wait_for_element(
                id,
                |s| !s.is_locked() && s.status.is_final() && s.current.output == output,
                TIMEOUT,
            )
            .await
            .unwrap_or_else(|e| panic!("waiting for {id}: {e}"))
    }

    async fn edit<T: Object + Clone>(&self, id: ObjectId, mut edit: impl FnMut(&mut T) + Send) {
        let mut object = get_typed::<T>(self.store.as_ref(), &id).await.unwrap();
        modify(self.store.as_ref(), object.as_mut(), |o: &mut T| {
            edit(o);
            (true, ())
        })
        .await
        .unwrap();
    }
}

fn value(ns: &str, name: &str) -> ElementId {
    ElementId::of(VALUE_STATE, ns, name, PROPAGATE)
}

fn calculate(ns: &str) -> ElementId {
    ElementId::of(OPERATOR_STATE, ns, "c", CALCULATE)
}

fn gather(ns: &str) -> ElementId {
    ElementId::of(OPERATOR_STATE, ns, "c", GATHER)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_a_and_b_when_operator_adds_them_then_result_is_eleven() {
    let engine = Engine::start().await;
    seed_namespace(engine.store.as_ref(), "sum").await.unwrap();

    let state = engine.settled_with(&calculate("sum"), json!(11)).await;

    assert_eq!(state.status, ProcessingStatus::Completed);
    assert_eq!(state.current.links, vec![gather("sum")]);
    let gathered = engine.settled_with(&gather("sum"), json!([5, 6])).await;
    assert_eq!(gathered.current.links, vec![value("sum", "a"), value("sum", "b")]);
    engine.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_settled_operator_when_a_changes_then_result_converges_and_other_namespace_is_untouched() {
    let engine = Engine::start().await;
    seed_namespace(engine.store.as_ref(), "changed").await.unwrap();
    seed_namespace(engine.store.as_ref(), "quiet").await.unwrap();
    let before = engine.settled_with(&calculate("changed"), json!(11)).await;
    let quiet = engine.settled_with(&calculate("quiet"), json!(11)).await;

    engine
        .edit::<Value>(ObjectId::new(VALUE, "changed", "a"), |v| v.spec.value = 6)
        .await;

    let after = engine.settled_with(&calculate("changed"), json!(12)).await;
    assert_eq!(after.status, ProcessingStatus::Completed);
    assert_eq!(before.current.object_version, after.current.object_version);
    assert_ne!(before.current.input_version, after.current.input_version);
    let untouched = engine.processor.element_state(&calculate("quiet")).await.unwrap();
    assert_eq!(untouched.current, quiet.current);
    assert_eq!(
        engine
            .processor
            .element_state(&value("quiet", "a"))
            .await
            .unwrap()
            .current
            .output,
        json!(5)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_settled_operator_when_operation_changes_then_only_calculate_is_reprocessed() {
    let engine = Engine::start().await;
    seed_namespace(engine.store.as_ref(), "op").await.unwrap();
    engine.settled_with(&calculate("op"), json!(11)).await;
    let gathered = engine.settled_with(&gather("op"), json!([5, 6])).await;

    engine
        .edit::<Operator>(ObjectId::new(OPERATOR, "op", "c"), |o| {
            o.spec.operation = Operation::Mul;
        })
        .await;

    engine.settled_with(&calculate("op"), json!(30)).await;
    let regathered = engine.settled_with(&gather("op"), json!([5, 6])).await;
    assert_eq!(regathered.current.object_version, gathered.current.object_version);
    assert_eq!(regathered.current.input_version, gathered.current.input_version);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_operator_over_unknown_value_when_reconciled_then_blocked() {
    let engine = Engine::start().await;
    let mut operator = Operator {
        meta: drover_objectbase::ObjectMeta::new(ObjectId::new(OPERATOR, "lonely", "c")),
        ..Operator::default()
    };
    operator.spec.operands = vec!["missing".to_string()];
    engine.store.set_object(&mut operator).await.unwrap();

    let blocked = engine
        .processor
        .wait_for_element(
            &gather("lonely"),
            |s| s.status == ProcessingStatus::Blocked && !s.is_locked(),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert_eq!(blocked.blocked_on, vec![value("lonely", "missing")]);
}
