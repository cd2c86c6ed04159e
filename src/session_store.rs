//! Durable JSONL session logs.
//!
//! One file per session under `<root>/projects/<sanitized cwd>/<id>.jsonl`.
//! Each line is either a message or the session policy. Messages are appended;
//! a policy change rewrites the file with the single config line first.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalMode;
use crate::compaction::{CompactionError, CompressOutcome, Summarizer};
use crate::history::History;
use crate::logging;
use crate::models::{Message, ModelLimits, NormalizedMessage};
use crate::utils::{ensure_dir, sanitize_path_component, short_id, summarize_text};

pub const DEFAULT_LIST_LIMIT: usize = 50;
const SUMMARY_MAX_CHARS: usize = 80;
const SESSION_EXTENSION: &str = "jsonl";

/// Mutable per-session settings, persisted on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPolicy {
    pub approval_mode: ApprovalMode,
    pub approved_tool_names: BTreeSet<String>,
    pub prompt_history: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One line of a session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogLine {
    Message(NormalizedMessage),
    Config { config: SessionPolicy },
}

/// Listing entry for `turnwise sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub modified: DateTime<Utc>,
    pub message_count: usize,
    pub summary: String,
}

// === Session ===

/// A loaded session: its history, its policy, and where they live on disk.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    path: Option<PathBuf>,
    history: History,
    policy: SessionPolicy,
}

impl Session {
    /// A session that is never written to disk.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            id: short_id(),
            path: None,
            history: History::new(),
            policy: SessionPolicy::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    #[must_use]
    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Append to the in-memory history only.
    pub fn record(&mut self, message: Message) -> NormalizedMessage {
        self.history.append(message)
    }

    /// Append one message line to the log file.
    pub fn persist_message(&self, message: &NormalizedMessage) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let line = serde_json::to_string(&LogLine::Message(message.clone()))
            .context("Failed to serialize session message")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open session log {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to append to session log {}", path.display()))?;
        Ok(())
    }

    /// Record and persist in one step.
    pub fn append(&mut self, message: Message) -> Result<NormalizedMessage> {
        let normalized = self.record(message);
        self.persist_message(&normalized)?;
        Ok(normalized)
    }

    /// Mutate the policy, then rewrite the log with the new config line first.
    ///
    /// The in-memory policy keeps the change even when the write fails.
    pub fn update_policy(&mut self, update: impl FnOnce(&mut SessionPolicy)) -> Result<()> {
        update(&mut self.policy);
        self.write_policy()
    }

    /// Remember a prompt in the policy's prompt history.
    pub fn record_prompt(&mut self, prompt: &str) -> Result<()> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(());
        }
        let prompt = prompt.to_string();
        self.update_policy(move |policy| policy.prompt_history.push(prompt))
    }

    fn write_policy(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let dir = path
            .parent()
            .with_context(|| format!("Session log has no parent: {}", path.display()))?;

        let mut lines = Vec::new();
        if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("Failed to open session log {}", path.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line
                    .with_context(|| format!("Failed to read session log {}", path.display()))?;
                if line.trim().is_empty() || is_config_line(&line) {
                    continue;
                }
                lines.push(line);
            }
        }

        let config = serde_json::to_string(&LogLine::Config {
            config: self.policy.clone(),
        })
        .context("Failed to serialize session policy")?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        writeln!(tmp, "{config}")?;
        for line in &lines {
            writeln!(tmp, "{line}")?;
        }
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace session log {}", path.display()))?;
        Ok(())
    }

    /// Compact the history and log the new synthetic root.
    pub async fn compress(
        &mut self,
        limits: &ModelLimits,
        summarizer: &dyn Summarizer,
    ) -> Result<CompressOutcome, CompactionError> {
        let outcome = self.history.compress(limits, summarizer).await?;
        if outcome.compacted {
            if let Some(root) = self.history.active_path().first().map(|m| (*m).clone())
                && let Err(err) = self.persist_message(&root)
            {
                logging::warn(format!("Failed to persist compacted history: {err:#}"));
            }
            if let Some(summary) = outcome.summary.as_deref() {
                let summary = summarize_text(summary, SUMMARY_MAX_CHARS);
                if let Err(err) = self.update_policy(|policy| policy.summary = Some(summary)) {
                    logging::warn(format!("Failed to persist session summary: {err:#}"));
                }
            }
        }
        Ok(outcome)
    }
}

fn is_config_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(|t| t == "config"))
        .unwrap_or(false)
}

/// Parse a log file into its messages and the last config line.
fn load_log(path: &Path) -> Result<(Vec<NormalizedMessage>, SessionPolicy)> {
    let file =
        File::open(path).with_context(|| format!("Failed to open session log {}", path.display()))?;
    let mut messages = Vec::new();
    let mut policy = SessionPolicy::default();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line =
            line.with_context(|| format!("Failed to read session log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogLine = serde_json::from_str(&line).with_context(|| {
            format!("Malformed line {} in session log {}", idx + 1, path.display())
        })?;
        match entry {
            LogLine::Message(message) => messages.push(message),
            LogLine::Config { config } => policy = config,
        }
    }
    Ok((messages, policy))
}

// === Session Store ===

/// Locates, creates, and loads session logs for one working directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Store for `cwd` under `root` (usually `~/.turnwise`).
    pub fn new(root: &Path, cwd: &Path) -> Self {
        let project = sanitize_path_component(&cwd.to_string_lossy());
        Self {
            dir: root.join("projects").join(project),
        }
    }

    /// `~/.turnwise`, if a home directory exists.
    #[must_use]
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".turnwise"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{SESSION_EXTENSION}"))
    }

    /// Start a fresh session. The file appears with the first write.
    pub fn create(&self) -> Result<Session> {
        ensure_dir(&self.dir)?;
        let mut id = short_id();
        while self.session_path(&id).exists() {
            id = short_id();
        }
        logging::info(format!("Created session {id}"));
        Ok(Session {
            path: Some(self.session_path(&id)),
            id,
            history: History::new(),
            policy: SessionPolicy::default(),
        })
    }

    /// Load a session by id or unique id prefix.
    pub fn resume(&self, id: &str) -> Result<Session> {
        let id = self.resolve_id(id)?;
        let path = self.session_path(&id);
        let (messages, policy) = load_log(&path)?;
        let history = History::from_log(messages)
            .with_context(|| format!("Corrupt session history in {}", path.display()))?;
        logging::info(format!(
            "Resumed session {id} ({} messages)",
            history.len()
        ));
        Ok(Session {
            id,
            path: Some(path),
            history,
            policy,
        })
    }

    /// Load the most recently modified session, if any.
    pub fn latest(&self) -> Result<Option<Session>> {
        let newest = session_files(&self.dir)?
            .into_iter()
            .max_by_key(|(_, _, modified)| *modified);
        match newest {
            Some((id, _, _)) => self.resume(&id).map(Some),
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        list_sessions(&self.dir, limit)
    }

    fn resolve_id(&self, prefix: &str) -> Result<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            anyhow::bail!("Session id cannot be empty");
        }
        if self.session_path(prefix).exists() {
            return Ok(prefix.to_string());
        }
        let matches: Vec<String> = session_files(&self.dir)?
            .into_iter()
            .map(|(id, _, _)| id)
            .filter(|id| id.starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [] => anyhow::bail!("No session matches '{prefix}' in {}", self.dir.display()),
            [id] => Ok(id.clone()),
            _ => anyhow::bail!(
                "Session id '{prefix}' is ambiguous: {}",
                matches.join(", ")
            ),
        }
    }
}

fn session_files(dir: &Path) -> Result<Vec<(String, PathBuf, DateTime<Utc>)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read sessions dir {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_EXTENSION) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        files.push((id.to_string(), path, modified));
    }
    Ok(files)
}

/// Summaries of the sessions in `dir`, newest first, at most `limit`.
///
/// Unreadable logs are skipped with a warning so one bad file does not hide
/// the rest.
pub fn list_sessions(dir: &Path, limit: usize) -> Result<Vec<SessionSummary>> {
    let mut files = session_files(dir)?;
    files.sort_by(|a, b| b.2.cmp(&a.2));

    let mut summaries = Vec::new();
    for (id, path, modified) in files.into_iter().take(limit) {
        let (messages, policy) = match load_log(&path) {
            Ok(loaded) => loaded,
            Err(err) => {
                logging::warn(format!("Skipping unreadable session {id}: {err:#}"));
                continue;
            }
        };
        let message_count = messages.len();
        let summary = policy.summary.clone().unwrap_or_else(|| {
            History::from_log(messages)
                .ok()
                .and_then(|history| {
                    history
                        .active_path()
                        .into_iter()
                        .find(|m| matches!(m.message, Message::User { .. }))
                        .map(|m| summarize_text(&m.message.text(), SUMMARY_MAX_CHARS))
                })
                .unwrap_or_default()
        });
        summaries.push(SessionSummary {
            id,
            modified,
            message_count,
            summary,
        });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn store(root: &Path) -> SessionStore {
        SessionStore::new(root, Path::new("/work/my repo"))
    }

    #[test]
    fn path_is_derived_from_root_cwd_and_id() {
        let store = SessionStore::new(Path::new("/data"), Path::new("/work/my repo"));
        assert_eq!(
            store.session_path("abc12345"),
            PathBuf::from("/data/projects/-work-my-repo/abc12345.jsonl")
        );
    }

    #[test]
    fn policy_write_puts_single_config_line_first() -> Result<()> {
        let root = tempdir()?;
        let store = store(root.path());
        let mut session = store.create()?;
        session.append(Message::user("hello"))?;
        session.update_policy(|p| p.approval_mode = ApprovalMode::AutoEdit)?;
        session.append(Message::user("again"))?;
        session.update_policy(|p| {
            p.approved_tool_names.insert("exec_shell".to_string());
        })?;

        let path = session.path().unwrap().to_path_buf();
        let contents = fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(is_config_line(lines[0]));
        assert!(!is_config_line(lines[1]));
        assert!(lines[0].contains("\"approvalMode\":\"autoEdit\""));
        assert!(lines[0].contains("exec_shell"));
        assert!(lines[1].contains("hello"));
        assert!(lines[2].contains("again"));
        Ok(())
    }

    #[test]
    fn resume_restores_history_and_policy() -> Result<()> {
        let root = tempdir()?;
        let store = store(root.path());
        let mut session = store.create()?;
        session.append(Message::user("one"))?;
        session.append(Message::user("two"))?;
        session.record_prompt("one")?;

        let resumed = store.resume(session.id())?;
        let original: Vec<_> = session.history().active_path().into_iter().cloned().collect();
        let restored: Vec<_> = resumed.history().active_path().into_iter().cloned().collect();
        assert_eq!(restored, original);
        assert_eq!(resumed.policy(), session.policy());
        assert_eq!(resumed.policy().prompt_history, vec!["one".to_string()]);
        Ok(())
    }

    #[test]
    fn resume_accepts_unique_prefix_only() -> Result<()> {
        let root = tempdir()?;
        let store = store(root.path());
        let mut session = store.create()?;
        session.append(Message::user("hi"))?;

        let prefix = &session.id()[..4];
        assert_eq!(store.resume(prefix)?.id(), session.id());
        assert!(store.resume("zzzzzzzzz").is_err());

        // Two files sharing a prefix make it ambiguous.
        fs::write(store.session_path("aaaa1111"), "")?;
        fs::write(store.session_path("aaaa2222"), "")?;
        let err = store.resume("aaaa").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        Ok(())
    }

    #[test]
    fn malformed_lines_fail_the_load() -> Result<()> {
        let root = tempdir()?;
        let store = store(root.path());
        ensure_dir(store.dir())?;
        fs::write(store.session_path("broken01"), "{not json}\n")?;
        let err = store.resume("broken01").unwrap_err();
        assert!(format!("{err:#}").contains("Malformed line 1"));
        Ok(())
    }

    #[test]
    fn listing_is_newest_first_with_summaries() -> Result<()> {
        let root = tempdir()?;
        let store = store(root.path());

        let mut first = store.create()?;
        first.append(Message::user("first task\nwith details"))?;
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut second = store.create()?;
        second.append(Message::user("second task"))?;
        second.update_policy(|p| p.summary = Some("named session".to_string()))?;

        let listed = store.list_sessions(DEFAULT_LIST_LIMIT)?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id());
        assert_eq!(listed[0].summary, "named session");
        assert_eq!(listed[1].summary, "first task");
        assert_eq!(listed[1].message_count, 1);

        assert_eq!(store.list_sessions(1)?.len(), 1);
        assert_eq!(store.latest()?.map(|s| s.id().to_string()), Some(second.id().to_string()));
        Ok(())
    }

    #[test]
    fn empty_store_has_no_latest() -> Result<()> {
        let root = tempdir()?;
        let store = store(root.path());
        assert!(store.latest()?.is_none());
        assert!(store.list_sessions(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn ephemeral_sessions_never_touch_disk() -> Result<()> {
        let mut session = Session::ephemeral();
        session.append(Message::user("x"))?;
        session.update_policy(|p| p.approval_mode = ApprovalMode::Yolo)?;
        assert!(session.path().is_none());
        assert_eq!(session.history().len(), 1);
        Ok(())
    }
}
