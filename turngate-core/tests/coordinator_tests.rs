use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use turngate_core::{
    EventBus, EventPayload, PolicyAction, PolicyRule, RunCoordinator, RunOutcome, RunRegistry,
    RunStatus, SendPolicy, SessionStore, SqliteTranscript, TurnEngine, TurnRequest,
};
use turngate_engine::testing::MockEngine;
use turngate_engine::{EventSender, LifecyclePhase, TurnResult};

fn request(message: &str) -> TurnRequest {
    TurnRequest {
        session_key: String::new(),
        session_id: String::new(),
        message: message.to_string(),
        thinking_level: None,
        model: None,
        deliver: None,
        attachments: Vec::new(),
        timeout_ms: None,
    }
}

struct Harness {
    coordinator: Arc<RunCoordinator>,
    bus: Arc<EventBus>,
    _dir: tempfile::TempDir,
}

fn harness(engine: Arc<dyn TurnEngine>, policy: SendPolicy) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::open(dir.path().join("state.db")).unwrap());
    let transcript = Arc::new(SqliteTranscript::new(sessions.db_connection()).unwrap());
    let bus = Arc::new(EventBus::default());
    let registry = Arc::new(RunRegistry::new());
    let coordinator = RunCoordinator::new(
        engine,
        Arc::clone(&bus),
        registry,
        sessions,
        transcript,
        policy,
    );
    Harness {
        coordinator,
        bus,
        _dir: dir,
    }
}

async fn recv_lifecycle(
    rx: &mut tokio::sync::broadcast::Receiver<turngate_engine::AgentEvent>,
) -> (String, LifecyclePhase) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .unwrap();
        if let EventPayload::Lifecycle { phase, .. } = event.payload {
            return (event.run_id, phase);
        }
    }
}

#[tokio::test]
async fn test_same_pair_replays_without_restarting() {
    let engine = MockEngine::new()
        .on_prompt("hello")
        .delay_ms(100)
        .respond_text("done")
        .into_shared();
    let h = harness(engine, SendPolicy::default());

    let first = h
        .coordinator
        .admit("test:dm:a", "k1", request("hello"))
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Started);
    assert_eq!(first.run_id, "k1");

    // Give the drain task a moment to begin the invocation.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = h
        .coordinator
        .admit("test:dm:a", "k1", request("hello"))
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::InFlight);

    let finished = h
        .coordinator
        .wait("k1", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Ok);

    // Any further retry replays the identical cached result.
    let replay_a = h
        .coordinator
        .admit("test:dm:a", "k1", request("hello"))
        .await
        .unwrap();
    let replay_b = h
        .coordinator
        .admit("test:dm:a", "k1", request("hello"))
        .await
        .unwrap();
    assert_eq!(replay_a.status, RunStatus::Ok);
    assert_eq!(replay_a, replay_b);
    match replay_a.result {
        Some(RunOutcome::Ok(result)) => assert_eq!(result.text, "done"),
        other => panic!("expected cached ok result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_sends_complete_in_submission_order() {
    // The first turn is slow, the second fast; finals must still land in
    // submission order.
    let engine = MockEngine::new()
        .on_prompt("first")
        .delay_ms(120)
        .respond_text("r1")
        .on_prompt("second")
        .respond_text("r2")
        .into_shared();
    let h = harness(engine, SendPolicy::default());
    let mut rx = h.bus.subscribe();

    h.coordinator
        .admit("test:dm:a", "k1", request("first"))
        .await
        .unwrap();
    h.coordinator
        .admit("test:dm:a", "k2", request("second"))
        .await
        .unwrap();

    let mut ends = Vec::new();
    while ends.len() < 2 {
        let (run_id, phase) = recv_lifecycle(&mut rx).await;
        if phase == LifecyclePhase::End {
            ends.push(run_id);
        }
    }
    assert_eq!(ends, vec!["k1".to_string(), "k2".to_string()]);
}

#[tokio::test]
async fn test_abort_in_flight_emits_exactly_one_aborted() {
    let engine = MockEngine::new()
        .on_prompt("stuck")
        .emit_delta("partial")
        .hang_until_cancel()
        .into_shared();
    let h = harness(engine, SendPolicy::default());
    let mut rx = h.bus.subscribe();

    h.coordinator
        .admit("test:dm:a", "k1", request("stuck"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = h.coordinator.abort("test:dm:a", Some("k1")).await.unwrap();
    assert!(outcome.aborted);

    let finished = h
        .coordinator
        .wait("k1", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Aborted);

    // Exactly one aborted lifecycle event, and nothing after it for this run.
    let mut aborted = 0;
    let mut trailing = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
    {
        if event.run_id != "k1" {
            continue;
        }
        match event.payload {
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Aborted,
                ..
            } => {
                aborted += 1;
                trailing = 0;
            }
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Start,
                ..
            }
            | EventPayload::Assistant { .. } => {}
            _ => trailing += 1,
        }
    }
    assert_eq!(aborted, 1);
    assert_eq!(trailing, 0, "no events may follow the aborted lifecycle");

    // A second abort of the now-terminal run is an idempotent no-op.
    let again = h.coordinator.abort("test:dm:a", Some("k1")).await.unwrap();
    assert!(!again.aborted);
}

#[tokio::test]
async fn test_abort_with_wrong_session_is_invalid_request() {
    let engine = MockEngine::new()
        .on_prompt("stuck")
        .hang_until_cancel()
        .into_shared();
    let h = harness(engine, SendPolicy::default());

    h.coordinator
        .admit("test:dm:owner", "k1", request("stuck"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = h
        .coordinator
        .abort("test:dm:intruder", Some("k1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, turngate_core::ErrorCode::InvalidRequest);

    // The real owner's run is untouched and still abortable.
    let snapshot = h.coordinator.registry().get_by_run_id("k1").unwrap();
    assert!(!snapshot.status.is_terminal());
    let outcome = h
        .coordinator
        .abort("test:dm:owner", Some("k1"))
        .await
        .unwrap();
    assert!(outcome.aborted);
}

#[tokio::test]
async fn test_abort_unknown_run_is_noop() {
    let engine = MockEngine::new().into_shared();
    let h = harness(engine, SendPolicy::default());

    let outcome = h
        .coordinator
        .abort("test:dm:a", Some("nope"))
        .await
        .unwrap();
    assert!(!outcome.aborted);
    assert!(outcome.run_ids.is_empty());
}

#[tokio::test]
async fn test_abort_all_covers_in_flight_and_queued() {
    let engine = MockEngine::new()
        .on_prompt("stuck")
        .hang_until_cancel()
        .on_prompt("queued")
        .respond_text("never runs")
        .into_shared();
    let h = harness(engine, SendPolicy::default());

    h.coordinator
        .admit("test:dm:a", "k1", request("stuck"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.coordinator
        .admit("test:dm:a", "k2", request("queued"))
        .await
        .unwrap();

    let outcome = h.coordinator.abort("test:dm:a", None).await.unwrap();
    assert!(outcome.aborted);
    let mut ids = outcome.run_ids.clone();
    ids.sort();
    assert_eq!(ids, vec!["k1".to_string(), "k2".to_string()]);

    let k1 = h.coordinator.wait("k1", Duration::from_secs(2)).await.unwrap();
    assert_eq!(k1.status, RunStatus::Aborted);
    let k2 = h.coordinator.registry().get_by_run_id("k2").unwrap();
    assert_eq!(k2.status, RunStatus::Aborted);
}

#[tokio::test]
async fn test_policy_deny_creates_no_record() {
    let engine = MockEngine::new().into_shared();
    let policy = SendPolicy::new(vec![PolicyRule {
        action: PolicyAction::Deny,
        provider: Some("discord".to_string()),
        chat_type: Some("group".to_string()),
        key_prefix: None,
    }]);
    let h = harness(engine, policy);

    let err = h
        .coordinator
        .admit("discord:group:general", "k1", request("hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code, turngate_core::ErrorCode::SendBlocked);
    assert!(err.message.contains("send blocked"));
    assert!(h.coordinator.registry().get("discord:group:general", "k1").is_none());
}

#[tokio::test]
async fn test_engine_failure_stored_and_replayed() {
    let engine = MockEngine::new()
        .on_prompt("boom")
        .fail("backend exploded")
        .into_shared();
    let h = harness(engine, SendPolicy::default());

    h.coordinator
        .admit("test:dm:a", "k1", request("boom"))
        .await
        .unwrap();
    let finished = h
        .coordinator
        .wait("k1", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Error);

    let replay = h
        .coordinator
        .admit("test:dm:a", "k1", request("boom"))
        .await
        .unwrap();
    assert_eq!(replay.status, RunStatus::Error);
    match replay.result {
        Some(RunOutcome::Error(err)) => assert!(err.message.contains("backend exploded")),
        other => panic!("expected stored error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_times_out_with_agent_timeout() {
    let engine = MockEngine::new()
        .on_prompt("stuck")
        .hang_until_cancel()
        .into_shared();
    let h = harness(engine, SendPolicy::default());

    h.coordinator
        .admit("test:dm:a", "k1", request("stuck"))
        .await
        .unwrap();

    let err = h
        .coordinator
        .wait("k1", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.code, turngate_core::ErrorCode::AgentTimeout);
    assert_eq!(err.retryable, Some(true));

    h.coordinator.abort("test:dm:a", None).await.unwrap();
}

#[tokio::test]
async fn test_stop_message_detection() {
    assert!(RunCoordinator::is_stop_message("/stop"));
    assert!(RunCoordinator::is_stop_message("  /STOP  "));
    assert!(!RunCoordinator::is_stop_message("please /stop"));
    assert!(!RunCoordinator::is_stop_message("stop"));
}

/// Engine that records the requests it receives.
struct CapturingEngine {
    seen: Arc<Mutex<Vec<TurnRequest>>>,
}

#[async_trait::async_trait]
impl TurnEngine for CapturingEngine {
    async fn run_turn(
        &self,
        request: TurnRequest,
        _events: EventSender,
        _cancel: CancellationToken,
    ) -> anyhow::Result<TurnResult> {
        self.seen.lock().unwrap().push(request);
        Ok(TurnResult {
            text: "ok".to_string(),
            model: None,
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "capturing"
    }
}

#[tokio::test]
async fn test_admission_resolves_session_fields_for_engine() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = Arc::new(CapturingEngine {
        seen: Arc::clone(&seen),
    });
    let h = harness(engine, SendPolicy::default());

    let mut req = request("hi");
    req.attachments = vec![turngate_engine::Attachment {
        kind: "image".to_string(),
        mime_type: "image/png".to_string(),
        file_name: None,
        bytes: b"png-bytes".to_vec(),
    }];
    h.coordinator.admit("test:dm:a", "k1", req).await.unwrap();
    h.coordinator
        .wait("k1", Duration::from_secs(2))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].session_key, "test:dm:a");
    assert!(!seen[0].session_id.is_empty());
    assert_eq!(seen[0].attachments[0].bytes, b"png-bytes");
    assert_eq!(seen[0].attachments[0].mime_type, "image/png");
}
