//! The engine driven end to end: HTTP model, real tools, broker approvals,
//! and an on-disk session.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use turnwise::approval::{ApprovalBroker, ApprovalDecision, ApprovalGate, ApprovalMode};
use turnwise::client::ChatClient;
use turnwise::compaction::ModelSummarizer;
use turnwise::config::RetryPolicy;
use turnwise::core::tool_parser::render_tool_call;
use turnwise::core::{
    Engine, EngineConfig, Event, RunFailureKind, SessionKey, SessionRegistry,
};
use turnwise::llm_client::LlmClient;
use turnwise::prompts::{BASE_PROMPT, build_system_prompt};
use turnwise::session_store::SessionStore;
use turnwise::tools::{ToolContext, ToolRegistry};

fn sse(contents: &[&str]) -> String {
    let mut body = String::new();
    for content in contents {
        let chunk = json!({"choices": [{"delta": {"content": content}}]});
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    let usage = json!({"choices": [], "usage": {"prompt_tokens": 120, "completion_tokens": 30}});
    body.push_str(&format!("data: {usage}\n\ndata: [DONE]\n\n"));
    body
}

fn engine_for(
    server: &MockServer,
    workspace: &std::path::Path,
    broker: Arc<ApprovalBroker>,
    tx_event: mpsc::Sender<Event>,
) -> Engine {
    let client: Arc<dyn LlmClient> = Arc::new(
        ChatClient::with_base_url("test-key", server.uri(), "test-model", RetryPolicy::disabled())
            .expect("client"),
    );
    let tools = ToolRegistry::with_defaults(ToolContext::new(workspace));
    let config = EngineConfig {
        system_prompt: build_system_prompt(BASE_PROMPT, &tools, workspace),
        ..EngineConfig::default()
    };
    let gate = ApprovalGate::new(ApprovalMode::Default, false, broker);
    let summarizer = Arc::new(ModelSummarizer::new(Arc::clone(&client)));
    Engine::new(client, tools, gate, summarizer, config).with_events(tx_event)
}

/// Answer every approval with `decision`; return streamed text and asked tools.
fn spawn_listener(
    mut rx: mpsc::Receiver<Event>,
    broker: Arc<ApprovalBroker>,
    decision: ApprovalDecision,
) -> tokio::task::JoinHandle<(String, Vec<String>)> {
    tokio::spawn(async move {
        let mut text = String::new();
        let mut asked = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                Event::TextDelta { content } => text.push_str(&content),
                Event::ApprovalRequired { id, tool_name, .. } => {
                    asked.push(tool_name);
                    broker.resolve(&id, decision);
                }
                Event::RunFinished { .. } => break,
                _ => {}
            }
        }
        (text, asked)
    })
}

#[tokio::test]
async fn write_is_approved_for_the_session_and_persisted() {
    let server = MockServer::start().await;
    let markup = render_tool_call(
        "write_file",
        &json!({"path": "notes.txt", "content": "remember the milk"}),
    );
    let (head, tail) = markup.split_at(markup.len() / 2);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse(&["I'll write it down. ", head, tail]), "text/event-stream"),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse(&["Saved to ", "notes.txt."]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let workspace = tempdir().expect("workspace");
    let root = tempdir().expect("sessions root");
    let store = SessionStore::new(root.path(), workspace.path());
    let mut session = store.create().expect("session");

    let (tx, rx) = mpsc::channel(64);
    let broker = Arc::new(ApprovalBroker::new(tx.clone()));
    let engine = engine_for(&server, workspace.path(), Arc::clone(&broker), tx);
    let listener = spawn_listener(rx, broker, ApprovalDecision::ApproveSessionEdits);

    let success = engine
        .run(&mut session, "jot down: remember the milk", &CancellationToken::new())
        .await
        .expect("run succeeds");
    let (streamed, asked) = listener.await.expect("listener");

    assert_eq!(success.final_text, "Saved to notes.txt.");
    assert_eq!(success.turns, 2);
    assert_eq!(success.usage.prompt_tokens, 240);
    assert_eq!(asked, vec!["write_file".to_string()]);
    assert!(!streamed.contains('<'), "markup leaked: {streamed}");
    assert!(streamed.starts_with("I'll write it down. "));
    assert_eq!(
        std::fs::read_to_string(workspace.path().join("notes.txt")).expect("file written"),
        "remember the milk"
    );

    let resumed = store.resume(session.id()).expect("resume");
    assert_eq!(resumed.policy().approval_mode, ApprovalMode::AutoEdit);
    let roles: Vec<&str> = resumed
        .history()
        .active_path()
        .into_iter()
        .map(|m| m.message.role())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);

    let requests = server.received_requests().await.expect("recorded requests");
    assert_eq!(requests.len(), 2);
    let second: Value = serde_json::from_slice(&requests[1].body).expect("json body");
    let messages = second["messages"].as_array().expect("messages");
    assert_eq!(messages[0]["role"], json!("system"));
    assert!(
        messages[1..]
            .iter()
            .any(|m| m["content"].as_str().is_some_and(|c| c.contains("notes.txt")))
    );
}

#[tokio::test]
async fn denied_command_ends_the_run() {
    let server = MockServer::start().await;
    let markup = render_tool_call("exec_shell", &json!({"command": "rm -rf build"}));
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["Cleaning up. ", markup.as_str()]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let workspace = tempdir().expect("workspace");
    let (tx, rx) = mpsc::channel(64);
    let broker = Arc::new(ApprovalBroker::new(tx.clone()));
    let engine = engine_for(&server, workspace.path(), Arc::clone(&broker), tx);
    let listener = spawn_listener(rx, broker, ApprovalDecision::Deny);

    let mut session = turnwise::session_store::Session::ephemeral();
    let failure = engine
        .run(&mut session, "clean the build", &CancellationToken::new())
        .await
        .expect_err("run is denied");
    let (_, asked) = listener.await.expect("listener");

    assert_eq!(failure.kind, RunFailureKind::ToolDenied);
    assert_eq!(asked, vec!["exec_shell".to_string()]);
    let last = session.history().active_path().last().map(|m| m.message.role());
    assert_eq!(last, Some("tool"));
}

#[tokio::test]
async fn registry_cancel_stops_a_stalled_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse(&["too late"]), "text/event-stream")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let workspace = tempdir().expect("workspace");
    let (tx, rx) = mpsc::channel(64);
    let broker = Arc::new(ApprovalBroker::new(tx.clone()));
    let engine = engine_for(&server, workspace.path(), Arc::clone(&broker), tx);
    let listener = spawn_listener(rx, broker, ApprovalDecision::Deny);

    let registry = SessionRegistry::new();
    let mut session = turnwise::session_store::Session::ephemeral();
    let key = SessionKey::new(workspace.path(), session.id());
    let lease = registry.open(key.clone()).expect("lease");
    let cancel = lease.cancel_token().clone();

    let canceller = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry.cancel(&key.workdir, &key.session_id)
        })
    };

    let failure = engine
        .run(&mut session, "hello?", &cancel)
        .await
        .expect_err("run is canceled");
    assert!(canceller.await.expect("canceller"));
    let _ = listener.await;

    assert_eq!(failure.kind, RunFailureKind::Canceled);
    let roles: Vec<&str> = session
        .history()
        .active_path()
        .into_iter()
        .map(|m| m.message.role())
        .collect();
    assert_eq!(roles, vec!["user"]);
}
