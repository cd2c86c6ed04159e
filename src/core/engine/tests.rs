use super::*;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use pretty_assertions::assert_eq;
use tempfile::{TempDir, tempdir};

use crate::approval::{ApprovalDecision, ApprovalMode, HumanApproval, ToolCategory};
use crate::core::tool_parser::render_tool_call;
use crate::llm_client::StreamEventBox;
use crate::models::ModelInputItem;
use crate::tools::ToolContext;

// === Test doubles ===

#[derive(Clone)]
enum Script {
    Events(Vec<StreamEvent>),
    Fail(LlmError),
    Hang,
}

/// Replays canned responses and counts requests.
struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    /// Replayed forever once `scripts` runs out.
    repeat: Option<Script>,
    requests: AtomicUsize,
}

impl ScriptedModel {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            requests: AtomicUsize::new(0),
        })
    }

    fn repeating(script: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            repeat: Some(script),
            requests: AtomicUsize::new(0),
        })
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn send(
        &self,
        _input: &[ModelInputItem],
        _system: &str,
        _options: &RequestOptions,
    ) -> Result<StreamEventBox, LlmError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let next = self.scripts.lock().unwrap().pop_front();
        let script = next
            .or_else(|| self.repeat.clone())
            .expect("model called more times than scripted");
        match script {
            Script::Events(events) => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)))),
            Script::Fail(err) => Err(err),
            Script::Hang => Ok(Box::pin(stream::pending())),
        }
    }
}

/// Answers approval requests from a queue and records what was asked.
struct ScriptedApprover {
    decisions: Mutex<VecDeque<ApprovalDecision>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedApprover {
    fn new(decisions: Vec<ApprovalDecision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            asked: Mutex::new(Vec::new()),
        })
    }

    fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanApproval for ScriptedApprover {
    async fn request_approval(
        &self,
        tool_use: &ToolUse,
        _category: ToolCategory,
    ) -> anyhow::Result<ApprovalDecision> {
        self.asked.lock().unwrap().push(tool_use.name.clone());
        let decision = self.decisions.lock().unwrap().pop_front();
        decision.ok_or_else(|| anyhow::anyhow!("no scripted decision left"))
    }
}

struct StubSummarizer(Option<&'static str>);

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, _transcript: &[&NormalizedMessage]) -> anyhow::Result<String> {
        match self.0 {
            Some(summary) => Ok(summary.to_string()),
            None => anyhow::bail!("summarizer offline"),
        }
    }
}

// === Helpers ===

fn text(chunks: &[&str]) -> Script {
    let mut events: Vec<StreamEvent> = chunks
        .iter()
        .map(|chunk| StreamEvent::TextDelta((*chunk).to_string()))
        .collect();
    events.push(StreamEvent::Finish(Usage::new(100, 20)));
    Script::Events(events)
}

fn call(prose: &str, name: &str, args: Value) -> Script {
    text(&[prose, &render_tool_call(name, &args)])
}

struct Harness {
    workspace: TempDir,
    model: Arc<ScriptedModel>,
    approver: Arc<ScriptedApprover>,
    engine: Engine,
}

fn harness(
    model: Arc<ScriptedModel>,
    decisions: Vec<ApprovalDecision>,
    config: EngineConfig,
) -> Harness {
    let workspace = tempdir().expect("tempdir");
    let tools = ToolRegistry::with_defaults(ToolContext::new(workspace.path()));
    let approver = ScriptedApprover::new(decisions);
    let gate = ApprovalGate::new(ApprovalMode::Default, false, approver.clone());
    let engine = Engine::new(
        model.clone(),
        tools,
        gate,
        Arc::new(StubSummarizer(Some("we were fixing the parser"))),
        config,
    );
    Harness {
        workspace,
        model,
        approver,
        engine,
    }
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn roles(history: &[NormalizedMessage]) -> Vec<&'static str> {
    history.iter().map(|m| m.message.role()).collect()
}

// === Turn loop ===

#[tokio::test]
async fn plain_answer_finishes_in_one_turn() {
    let h = harness(
        ScriptedModel::new(vec![text(&["Hello", " there."])]),
        vec![],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let success = h
        .engine
        .run(&mut session, "hi", &CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(success.final_text, "Hello there.");
    assert_eq!(success.turns, 1);
    assert_eq!(success.usage, Usage::new(100, 20));
    assert_eq!(roles(&success.history), vec!["user", "assistant"]);
    assert_eq!(session.policy().prompt_history, vec!["hi".to_string()]);
    assert_eq!(h.model.requests(), 1);
}

#[tokio::test]
async fn only_the_first_tool_call_is_honored() {
    let first = render_tool_call("list_dir", &json!({}));
    let second = render_tool_call("write_file", &json!({"path": "x", "content": "y"}));
    let h = harness(
        ScriptedModel::new(vec![
            text(&["Looking.", &first, " and also ", &second]),
            text(&["Done."]),
        ]),
        vec![],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let success = h
        .engine
        .run(&mut session, "look around", &CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(
        roles(&success.history),
        vec!["user", "assistant", "tool", "assistant"]
    );
    let Message::Assistant { rendered_text, .. } = &success.history[1].message else {
        panic!("expected assistant message");
    };
    assert_eq!(rendered_text, &format!("Looking.{first}"));
    assert!(!rendered_text.contains("write_file"));

    assert_eq!(success.tool_calls.len(), 1);
    assert_eq!(success.tool_calls[0].name, "list_dir");
    assert!(success.tool_calls[0].approved);
    assert!(!h.workspace.path().join("x").exists());
    assert!(h.approver.asked().is_empty());
}

#[tokio::test]
async fn streamed_text_never_shows_call_markup() {
    let (tx, mut rx) = mpsc::channel(256);
    let h = harness(
        ScriptedModel::new(vec![
            text(&[
                "Let me check. <us",
                "e_tool><tool_name>list_dir</tool_name><arguments>{}</arg",
                "uments></use_tool> trailing",
            ]),
            text(&["a < b, <use not a call"]),
        ]),
        vec![],
        EngineConfig::default(),
    );
    let engine = h.engine.with_events(tx);
    let mut session = Session::ephemeral();

    engine
        .run(&mut session, "check", &CancellationToken::new())
        .await
        .expect("run succeeds");

    let shown: String = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            Event::TextDelta { content } => Some(content),
            _ => None,
        })
        .collect();
    assert_eq!(shown, "Let me check. a < b, <use not a call");
}

#[tokio::test]
async fn denied_call_ends_the_run_with_an_error_result() {
    let h = harness(
        ScriptedModel::new(vec![call(
            "Writing.",
            "write_file",
            json!({"path": "out.txt", "content": "data"}),
        )]),
        vec![ApprovalDecision::Deny],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let failure = h
        .engine
        .run(&mut session, "write it", &CancellationToken::new())
        .await
        .expect_err("run is denied");

    assert_eq!(failure.kind, RunFailureKind::ToolDenied);
    assert_eq!(h.approver.asked(), vec!["write_file".to_string()]);
    assert!(!h.workspace.path().join("out.txt").exists());

    let last = session.history().active_path().last().map(|m| (*m).clone());
    let Some(NormalizedMessage {
        message: Message::ToolResult { entries },
        ..
    }) = last
    else {
        panic!("expected a tool result at the end of history");
    };
    assert!(entries[0].is_error);
    assert_eq!(entries[0].tool_name, "write_file");
    assert_eq!(failure.tool_calls.len(), 1);
    assert!(!failure.tool_calls[0].approved);
}

#[tokio::test]
async fn shell_commands_that_write_files_go_to_the_human() {
    let h = harness(
        ScriptedModel::new(vec![call(
            "Comparing.",
            "exec_shell",
            json!({"command": "git diff --no-index --output=pwned.txt a.txt b.txt"}),
        )]),
        vec![ApprovalDecision::Deny],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let failure = h
        .engine
        .run(&mut session, "compare the files", &CancellationToken::new())
        .await
        .expect_err("run is denied");

    assert_eq!(failure.kind, RunFailureKind::ToolDenied);
    assert_eq!(h.approver.asked(), vec!["exec_shell".to_string()]);
    assert!(!h.workspace.path().join("pwned.txt").exists());
}

#[tokio::test]
async fn session_edit_approval_is_asked_once() {
    let h = harness(
        ScriptedModel::new(vec![
            call("", "write_file", json!({"path": "a.txt", "content": "a"})),
            call("", "write_file", json!({"path": "b.txt", "content": "b"})),
            text(&["Both written."]),
        ]),
        vec![ApprovalDecision::ApproveSessionEdits],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let success = h
        .engine
        .run(&mut session, "write two files", &CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(h.approver.asked().len(), 1);
    assert_eq!(session.policy().approval_mode, ApprovalMode::AutoEdit);
    assert_eq!(success.tool_calls.len(), 2);
    assert!(h.workspace.path().join("a.txt").exists());
    assert!(h.workspace.path().join("b.txt").exists());
}

#[tokio::test]
async fn max_turns_stops_after_exactly_that_many_requests() {
    let h = harness(
        ScriptedModel::repeating(call("Again.", "list_dir", json!({}))),
        vec![],
        EngineConfig {
            max_turns: 3,
            ..EngineConfig::default()
        },
    );
    let mut session = Session::ephemeral();

    let failure = h
        .engine
        .run(&mut session, "loop forever", &CancellationToken::new())
        .await
        .expect_err("run hits the turn limit");

    assert_eq!(failure.kind, RunFailureKind::MaxTurnsExceeded);
    assert_eq!(failure.turns, 3);
    assert_eq!(h.model.requests(), 3);
    assert_eq!(failure.tool_calls.len(), 3);
    // user + 3 x (assistant, tool)
    assert_eq!(session.history().active_path().len(), 7);
}

#[tokio::test]
async fn cancellation_before_the_turn_skips_the_request() {
    let h = harness(
        ScriptedModel::new(vec![text(&["never"])]),
        vec![],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = h
        .engine
        .run(&mut session, "hi", &cancel)
        .await
        .expect_err("run is canceled");

    assert_eq!(failure.kind, RunFailureKind::Canceled);
    assert_eq!(failure.turns, 0);
    assert_eq!(h.model.requests(), 0);
}

#[tokio::test]
async fn cancellation_mid_stream_keeps_partial_text_out_of_history() {
    let h = harness(ScriptedModel::new(vec![Script::Hang]), vec![], EngineConfig::default());
    let mut session = Session::ephemeral();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let failure = h
        .engine
        .run(&mut session, "hi", &cancel)
        .await
        .expect_err("run is canceled");

    assert_eq!(failure.kind, RunFailureKind::Canceled);
    assert_eq!(failure.turns, 1);
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn provider_failures_become_api_errors_with_status() {
    let h = harness(
        ScriptedModel::new(vec![
            call("", "list_dir", json!({})),
            Script::Fail(LlmError::ServerError {
                status: 503,
                message: "overloaded".to_string(),
            }),
        ]),
        vec![],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let failure = h
        .engine
        .run(&mut session, "hi", &CancellationToken::new())
        .await
        .expect_err("run fails");

    assert_eq!(failure.kind, RunFailureKind::ApiError);
    let details = failure.details.expect("details");
    assert_eq!(details["status"], json!(503));
    assert_eq!(details["code"], json!("llm_server_503"));
    // Earlier turns stay in history.
    assert_eq!(session.history().active_path().len(), 3);
}

#[tokio::test]
async fn mid_stream_errors_are_api_errors() {
    let h = harness(
        ScriptedModel::new(vec![]),
        vec![],
        EngineConfig::default(),
    );
    // Replace the model with one whose stream fails after a delta.
    struct BrokenStream;
    #[async_trait]
    impl LlmClient for BrokenStream {
        fn model_id(&self) -> &str {
            "broken"
        }
        async fn send(
            &self,
            _input: &[ModelInputItem],
            _system: &str,
            _options: &RequestOptions,
        ) -> Result<StreamEventBox, LlmError> {
            Ok(Box::pin(stream::iter(vec![
                Ok(StreamEvent::TextDelta("partial".to_string())),
                Err(LlmError::StreamError("connection reset".to_string())),
            ])))
        }
    }
    let engine = Engine::new(
        Arc::new(BrokenStream),
        h.engine.tools().clone(),
        ApprovalGate::new(ApprovalMode::Yolo, false, h.approver.clone()),
        Arc::new(StubSummarizer(None)),
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let failure = engine
        .run(&mut session, "hi", &CancellationToken::new())
        .await
        .expect_err("run fails");
    assert_eq!(failure.kind, RunFailureKind::ApiError);
    assert!(failure.message.contains("connection reset"));
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn unknown_tools_report_their_error_to_the_model() {
    let h = harness(
        ScriptedModel::new(vec![
            call("", "teleport", json!({"to": "mars"})),
            text(&["That tool does not exist."]),
        ]),
        vec![],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();

    let success = h
        .engine
        .run(&mut session, "go", &CancellationToken::new())
        .await
        .expect("run succeeds");

    assert!(h.approver.asked().is_empty());
    let record = &success.tool_calls[0];
    assert!(record.approved);
    assert!(record.is_error);
    assert!(record.output.contains("is not available"));
}

#[tokio::test]
async fn compaction_failure_does_not_stop_the_run() {
    let (tx, mut rx) = mpsc::channel(256);
    let mut big_turn = match call("", "list_dir", json!({})) {
        Script::Events(events) => events,
        _ => unreachable!(),
    };
    big_turn.pop();
    big_turn.push(StreamEvent::Finish(Usage::new(9_500, 100)));

    let workspace = tempdir().expect("tempdir");
    let model = ScriptedModel::new(vec![Script::Events(big_turn), text(&["ok"])]);
    let engine = Engine::new(
        model,
        ToolRegistry::with_defaults(ToolContext::new(workspace.path())),
        ApprovalGate::new(ApprovalMode::Default, false, ScriptedApprover::new(vec![])),
        Arc::new(StubSummarizer(None)),
        EngineConfig {
            limits: ModelLimits {
                context: 10_000,
                output: 1_000,
            },
            ..EngineConfig::default()
        },
    )
    .with_events(tx);
    let mut session = Session::ephemeral();

    let success = engine
        .run(&mut session, "hi", &CancellationToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(success.final_text, "ok");
    assert_eq!(roles(&success.history)[0], "user");
    assert_eq!(success.history.len(), 4);
    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::CompactionFailed { .. }))
    );
}

#[tokio::test]
async fn compaction_replaces_history_with_a_summary_root() {
    let mut big_turn = match text(&["Long answer."]) {
        Script::Events(events) => events,
        _ => unreachable!(),
    };
    big_turn.pop();
    big_turn.push(StreamEvent::Finish(Usage::new(9_500, 100)));

    let h = harness(
        ScriptedModel::new(vec![Script::Events(big_turn), text(&["Short answer."])]),
        vec![],
        EngineConfig {
            limits: ModelLimits {
                context: 10_000,
                output: 1_000,
            },
            ..EngineConfig::default()
        },
    );
    let mut session = Session::ephemeral();
    h.engine
        .run(&mut session, "first", &CancellationToken::new())
        .await
        .expect("first run");

    let success = h
        .engine
        .run(&mut session, "second", &CancellationToken::new())
        .await
        .expect("second run");

    let root = &success.history[0];
    assert!(root.is_root());
    assert!(root.message.text().contains("we were fixing the parser"));
    assert_eq!(roles(&success.history), vec!["user", "user", "assistant"]);
    assert_eq!(
        session.policy().summary.as_deref(),
        Some("we were fixing the parser")
    );
}

#[tokio::test]
async fn run_finished_reports_the_failure_kind() {
    let (tx, mut rx) = mpsc::channel(64);
    let h = harness(ScriptedModel::new(vec![]), vec![], EngineConfig::default());
    let engine = h.engine.with_events(tx);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut session = Session::ephemeral();

    let _ = engine.run(&mut session, "hi", &cancel).await;

    let finished = drain(&mut rx).into_iter().find_map(|event| match event {
        Event::RunFinished { failure, .. } => Some(failure),
        _ => None,
    });
    assert_eq!(finished, Some(Some(RunFailureKind::Canceled)));
}

fn assert_extends(before: &[NormalizedMessage], session: &Session) {
    let after = session.history().messages();
    assert!(after.len() >= before.len(), "history shrank");
    assert_eq!(&after[..before.len()], before);
    for (old, new) in before.iter().zip(after) {
        assert_eq!(
            serde_json::to_string(old).unwrap(),
            serde_json::to_string(new).unwrap()
        );
    }
}

#[tokio::test]
async fn failed_runs_only_ever_append() {
    let h = harness(
        ScriptedModel::new(vec![
            call("", "write_file", json!({"path": "x.txt", "content": "x"})),
            Script::Fail(LlmError::ServerError {
                status: 500,
                message: "boom".to_string(),
            }),
            Script::Hang,
            text(&["Finally."]),
        ]),
        vec![ApprovalDecision::Deny],
        EngineConfig::default(),
    );
    let mut session = Session::ephemeral();
    session.append(Message::user("earlier question")).unwrap();
    session
        .append(Message::Assistant {
            parts: vec![AssistantPart::Text {
                text: "earlier answer".to_string(),
            }],
            rendered_text: "earlier answer".to_string(),
            model_id: "scripted-model".to_string(),
            usage: Usage::new(50, 5),
        })
        .unwrap();

    let before = session.history().messages().to_vec();
    let denied = h
        .engine
        .run(&mut session, "write x", &CancellationToken::new())
        .await
        .expect_err("denied");
    assert_eq!(denied.kind, RunFailureKind::ToolDenied);
    assert_extends(&before, &session);

    let before = session.history().messages().to_vec();
    let api = h
        .engine
        .run(&mut session, "try again", &CancellationToken::new())
        .await
        .expect_err("api error");
    assert_eq!(api.kind, RunFailureKind::ApiError);
    assert_extends(&before, &session);

    let before = session.history().messages().to_vec();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let canceled = h
        .engine
        .run(&mut session, "once more", &cancel)
        .await
        .expect_err("canceled");
    assert_eq!(canceled.kind, RunFailureKind::Canceled);
    assert_extends(&before, &session);

    let before = session.history().messages().to_vec();
    h.engine
        .run(&mut session, "last try", &CancellationToken::new())
        .await
        .expect("run succeeds");
    assert_extends(&before, &session);
    assert_eq!(session.history().messages()[0].message.text(), "earlier question");
}

// === Tool result shaping ===

#[test]
fn large_tool_output_is_compacted() {
    let output = ToolResult::success("x".repeat(TOOL_RESULT_CONTEXT_HARD_LIMIT_CHARS + 10));
    let compacted = compact_tool_result_for_context("read_file", &output);
    assert!(compacted.starts_with("[read_file output compacted to protect context]"));
    assert!(compacted.contains("(Original: 12010 chars"));

    let small = ToolResult::success("  short  ");
    assert_eq!(compact_tool_result_for_context("read_file", &small), "short");
}

#[test]
fn noisy_tools_use_the_soft_limit_and_metadata_summary() {
    let output = ToolResult::success("line\n".repeat(600))
        .with_metadata(json!({"summary": "600 lines of output"}));
    let compacted = compact_tool_result_for_context("exec_shell", &output);
    assert!(compacted.contains("Summary: 600 lines of output"));

    let quiet = compact_tool_result_for_context("read_file", &output);
    assert!(!quiet.contains("compacted"));
}

#[test]
fn tool_errors_are_phrased_for_the_model() {
    assert_eq!(
        format_tool_error(&ToolError::missing_field("path"), "read_file"),
        "Tool 'read_file' is missing required field 'path'"
    );
    assert!(
        format_tool_error(&ToolError::Timeout { seconds: 5 }, "exec_shell")
            .contains("timed out after 5s")
    );
}
