//! Integration tests for reactive cell evaluation.
//!
//! Each test mounts cells against a real session and observes what the
//! subscribers receive.

use std::sync::Arc;
use std::time::Duration;

use cellbox::prelude::*;
use cellbox::{CapturedLog, LogSink};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

type Delivered = std::result::Result<CellOutput, String>;

struct Harness {
    evaluator: CellEvaluator,
    document: Arc<Document>,
    log: CapturedLog,
}

async fn harness(content: Vec<Node>) -> Harness {
    let log = CapturedLog::new();
    let sink: Arc<dyn LogSink> = Arc::new(log.clone());
    let session = SandboxSession::with_sink(SandboxConfig::default(), sink)
        .await
        .unwrap();
    let document = Arc::new(Document::new(content));
    let evaluator = CellEvaluator::new(session, document.clone()).unwrap();
    Harness {
        evaluator,
        document,
        log,
    }
}

fn collect(evaluator: &CellEvaluator, id: &str) -> mpsc::UnboundedReceiver<Delivered> {
    let (tx, rx) = mpsc::unbounded_channel();
    evaluator
        .subscribe(&CellId::from(id), move |result| {
            let _ = tx.send(result.as_ref().map(Clone::clone).map_err(|e| e.to_string()));
        })
        .unwrap();
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delivered>) -> Delivered {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a result")
        .expect("subscription closed")
}

/// Asserts nothing else is delivered within `wait`.
async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Delivered>, wait: Duration) {
    sleep(wait).await;
    assert!(rx.try_recv().is_err(), "unexpected extra result");
}

/// Waits until `pending` evaluations are parked on a promise.
async fn wait_pending(session: &SandboxSession, pending: usize) {
    timeout(Duration::from_secs(5), async {
        while session.stats().await.unwrap().pending != pending {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("evaluation never became pending");
}

#[tokio::test]
async fn test_simple_expression() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");

    h.evaluator.mount(CellSpec::new("c1", "1+1")).unwrap();

    let out = assert_ok!(next(&mut results).await);
    assert_eq!(out.value(), Some(&json!(2)));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_throwing_cell_timer_never_fires() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c2");

    h.evaluator
        .mount(CellSpec::new(
            "c2",
            "setTimeout(() => console.log('fired', here().id), 100); throw new Error('boom')",
        ))
        .unwrap();

    let err = assert_err!(next(&mut results).await);
    assert!(err.contains("boom"), "got {err}");

    h.evaluator.unmount(&CellId::from("c2")).await.unwrap();
    let stats = h.evaluator.session().stats().await.unwrap();
    assert_eq!(stats.timers, 0);

    sleep(Duration::from_millis(250)).await;
    assert!(h.log.messages().iter().all(|m| !m.contains("fired")));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_superseded_evaluation_is_not_delivered() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");

    h.evaluator
        .mount(CellSpec::new(
            "c1",
            "new Promise(resolve => setTimeout(() => resolve('first'), 50))",
        ))
        .unwrap();
    h.evaluator.update_source(&id, "'second'").unwrap();

    let out = assert_ok!(next(&mut results).await);
    assert_eq!(out.value(), Some(&json!("second")));
    assert_quiet(&mut results, Duration::from_millis(200)).await;

    let stats = h.evaluator.session().stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.timers, 0);
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_in_flight_evaluation_is_superseded() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");

    h.evaluator
        .mount(CellSpec::new(
            "c1",
            "new Promise(resolve => setTimeout(() => { console.log('first fired'); resolve('first') }, 60))",
        ))
        .unwrap();
    wait_pending(h.evaluator.session(), 1).await;

    h.evaluator.update_source(&id, "'second'").unwrap();

    let out = assert_ok!(next(&mut results).await);
    assert_eq!(out.value(), Some(&json!("second")));
    assert_quiet(&mut results, Duration::from_millis(150)).await;
    assert!(h.log.is_empty(), "superseded timer fired: {:?}", h.log.messages());

    let stats = h.evaluator.session().stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.timers, 0);
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_implicit_globals_are_allowed() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");

    h.evaluator.mount(CellSpec::new("c1", "total = 5; total * 2")).unwrap();

    let out = assert_ok!(next(&mut results).await);
    assert_eq!(out.value(), Some(&json!(10)));
    let out = h.evaluator.session().eval_async("total + 1").await.unwrap();
    assert_eq!(out.value(), Some(&json!(6)));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_absent_cell_uses_last_known_location() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");

    h.evaluator.mount(CellSpec::new("c1", "here()").at(7, 3)).unwrap();

    let out = assert_ok!(next(&mut results).await);
    assert_eq!(
        out.value(),
        Some(&json!({"position": 7, "extent": 3, "id": "c1"}))
    );
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_present_cell_resolves_from_document() {
    let h = harness(vec![
        Node::element("paragraph", vec![Node::text("intro")]),
        Node::element("code_block", vec![Node::cell("c1", "here()")]),
    ])
    .await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");

    h.evaluator.mount(CellSpec::new("c1", "here()").at(0, 0)).unwrap();

    let out = assert_ok!(next(&mut results).await);
    assert_eq!(
        out.value(),
        Some(&json!({"position": 8, "extent": 6, "id": "c1"}))
    );
    assert_eq!(h.evaluator.location(&id), Some(Location::new(8, 6)));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_function_result_is_deferred() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");

    h.evaluator
        .mount(CellSpec::new("c1", "() => { console.log('side effect') }"))
        .unwrap();

    let out = assert_ok!(next(&mut results).await);
    let action = out.action().cloned().expect("expected a deferred action");
    assert_eq!(action.cell(), Some(&id));
    sleep(Duration::from_millis(20)).await;
    assert!(h.log.is_empty());

    assert_ok!(h.evaluator.invoke(&action).await);
    assert_eq!(h.log.messages_for(&id), vec!["side effect"]);

    // Re-running the cell releases the old action.
    h.evaluator.update_source(&id, "2").unwrap();
    assert_ok!(next(&mut results).await);
    let released = h.evaluator.invoke(&action).await;
    assert!(matches!(released, Err(SandboxError::ActionReleased)));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_throwing_action_is_contained() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");

    h.evaluator
        .mount(CellSpec::new("c1", "() => { throw new TypeError('bad click') }"))
        .unwrap();
    let out = assert_ok!(next(&mut results).await);
    let action = out.action().cloned().unwrap();

    let err = assert_err!(h.evaluator.invoke(&action).await);
    match err {
        SandboxError::EvaluationThrew { name, message, .. } => {
            assert_eq!(name, "TypeError");
            assert_eq!(message, "bad click");
        }
        other => panic!("Expected EvaluationThrew, got {:?}", other),
    }
    // The session is still usable.
    let out = h.evaluator.session().eval_async("3 * 3").await.unwrap();
    assert_eq!(out.value(), Some(&json!(9)));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_disposed_interval_never_fires() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");

    h.evaluator
        .mount(CellSpec::new(
            "c1",
            "setInterval(() => console.log('tick'), 20); 'started'",
        ))
        .unwrap();
    assert_ok!(next(&mut results).await);

    h.evaluator.unmount(&id).await.unwrap();
    h.log.clear();
    sleep(Duration::from_millis(120)).await;
    assert!(h.log.is_empty(), "interval fired after dispose: {:?}", h.log.messages());
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_rerun_releases_previous_interval() {
    let h = harness(Vec::new()).await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");

    h.evaluator
        .mount(CellSpec::new("c1", "setInterval(() => console.log('old'), 10); 1"))
        .unwrap();
    assert_ok!(next(&mut results).await);
    h.evaluator.update_source(&id, "2").unwrap();
    assert_ok!(next(&mut results).await);

    h.log.clear();
    sleep(Duration::from_millis(80)).await;
    assert!(h.log.is_empty());
    let stats = h.evaluator.session().stats().await.unwrap();
    assert_eq!(stats.timers, 0);
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_evaluation_is_deterministic() {
    let h = harness(Vec::new()).await;
    let mut ok = collect(&h.evaluator, "ok");
    let mut failing = collect(&h.evaluator, "failing");

    h.evaluator.mount(CellSpec::new("ok", "[1, 2, 3].map(x => x * 2)")).unwrap();
    h.evaluator.mount(CellSpec::new("failing", "throw new Error('x')")).unwrap();

    let first_ok = assert_ok!(next(&mut ok).await);
    let first_err = assert_err!(next(&mut failing).await);

    h.evaluator.trigger(&CellId::from("ok")).unwrap();
    h.evaluator.trigger(&CellId::from("failing")).unwrap();

    let second_ok = assert_ok!(next(&mut ok).await);
    let second_err = assert_err!(next(&mut failing).await);
    assert_eq!(first_ok.value(), second_ok.value());
    assert_eq!(first_err, second_err);
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_document_change_reruns_dependent_cells() {
    let h = harness(vec![Node::element(
        "code_block",
        vec![Node::cell("c1", "here().position")],
    )])
    .await;
    let mut dependent = collect(&h.evaluator, "c1");
    let mut independent = collect(&h.evaluator, "c2");
    h.evaluator.follow(h.document.subscribe());

    h.evaluator.mount(CellSpec::new("c1", "here().position")).unwrap();
    h.evaluator.mount(CellSpec::new("c2", "40 + 2")).unwrap();
    assert_eq!(assert_ok!(next(&mut dependent).await).value(), Some(&json!(1)));
    assert_ok!(next(&mut independent).await);

    // Appended after the cell: outside its range, but c1 read its location.
    h.document
        .insert(1, Node::element("paragraph", vec![Node::text("tail")]));
    assert_eq!(assert_ok!(next(&mut dependent).await).value(), Some(&json!(1)));
    assert_quiet(&mut independent, Duration::from_millis(100)).await;

    // Inserted before the cell: its position moves.
    h.document
        .insert(0, Node::element("paragraph", vec![Node::text("head")]));
    assert_eq!(assert_ok!(next(&mut dependent).await).value(), Some(&json!(7)));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_dependency_holds_while_rerun_is_in_flight() {
    let h = harness(vec![Node::element(
        "code_block",
        vec![Node::cell("c1", "here().position")],
    )])
    .await;
    let mut results = collect(&h.evaluator, "c1");
    let id = CellId::from("c1");
    h.evaluator.follow(h.document.subscribe());

    h.evaluator.mount(CellSpec::new("c1", "here().position")).unwrap();
    assert_eq!(assert_ok!(next(&mut results).await).value(), Some(&json!(1)));

    // The re-run does not read its location and stays pending for a while.
    h.evaluator
        .update_source(&id, "new Promise(resolve => setTimeout(() => resolve('late'), 150))")
        .unwrap();
    wait_pending(h.evaluator.session(), 1).await;
    let in_flight = h.evaluator.generation(&id).unwrap();

    // Outside the cell's range: only the earlier dependency re-runs it.
    h.document
        .insert(1, Node::element("paragraph", vec![Node::text("tail")]));
    sleep(Duration::from_millis(50)).await;
    assert!(h.evaluator.generation(&id).unwrap() > in_flight);

    assert_eq!(assert_ok!(next(&mut results).await).value(), Some(&json!("late")));
    assert_quiet(&mut results, Duration::from_millis(50)).await;

    // That generation settled without calling `here()`, so the edge is gone.
    let settled = h.evaluator.generation(&id).unwrap();
    h.document
        .insert(2, Node::element("paragraph", vec![Node::text("more")]));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.evaluator.generation(&id), Some(settled));
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let h = harness(Vec::new()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = h
        .evaluator
        .subscribe(&CellId::from("c1"), move |result| {
            let _ = tx.send(result.is_ok());
        })
        .unwrap();

    h.evaluator.mount(CellSpec::new("c1", "1")).unwrap();
    let delivered = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(delivered, Some(true));

    subscription.unsubscribe();
    h.evaluator.trigger(&CellId::from("c1")).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_console_output_is_attributed() {
    let h = harness(Vec::new()).await;
    let mut a = collect(&h.evaluator, "a");
    let mut b = collect(&h.evaluator, "b");

    h.evaluator
        .mount(CellSpec::new("a", "console.log('from', 'a', {n: 1}); 0"))
        .unwrap();
    h.evaluator
        .mount(CellSpec::new("b", "console.warn('from b'); 0"))
        .unwrap();
    assert_ok!(next(&mut a).await);
    assert_ok!(next(&mut b).await);

    assert_eq!(h.log.messages_for(&CellId::from("a")), vec![r#"from a {"n":1}"#]);
    assert_eq!(h.log.messages_for(&CellId::from("b")), vec!["from b"]);
    h.evaluator.dispose().await;
}

#[tokio::test]
async fn test_session_scope_timers_and_promises() {
    let log = CapturedLog::new();
    let session = SandboxSession::with_sink(SandboxConfig::default(), Arc::new(log.clone()))
        .await
        .unwrap();

    let out = session
        .eval_async("Promise.resolve(41).then(x => x + 1)")
        .await
        .unwrap();
    assert_eq!(out.value(), Some(&json!(42)));

    let err = session
        .eval_async("Promise.reject(new TypeError('nope'))")
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::EvaluationThrew { ref name, .. } if name == "TypeError"));

    session
        .eval_async("setTimeout((a, b) => console.log(a + b), 10, 'x', 'y')")
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(log.messages(), vec!["xy"]);

    let out = session
        .eval_async("_internals.formatDateTime('2024-03-05T12:00:00Z', 'en-US', {pattern: '%Y-%m-%d', timeZone: 'UTC'})")
        .await
        .unwrap();
    assert_eq!(out.value(), Some(&json!("2024-03-05")));
    session.dispose().await;
}
