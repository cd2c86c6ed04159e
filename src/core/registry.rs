//! Process-wide map of open sessions.
//!
//! Each `(working directory, session id)` pair may be driven by at most one
//! run at a time. The registry hands out a [`SessionLease`] per open session;
//! dropping the lease tears the entry down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::logging;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub workdir: PathBuf,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(workdir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            session_id: session_id.into(),
        }
    }
}

/// Immutable per-session state shared with out-of-band callers.
#[derive(Debug)]
pub struct SessionContext {
    pub key: SessionKey,
    pub cancel: CancellationToken,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {session_id} is already open in {}", workdir.display())]
    SessionBusy {
        workdir: PathBuf,
        session_id: String,
    },
}

type Entries = HashMap<SessionKey, Arc<SessionContext>>;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: Mutex<Entries>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim a session. Fails if it is already open.
    pub fn open(self: &Arc<Self>, key: SessionKey) -> Result<SessionLease, RegistryError> {
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(RegistryError::SessionBusy {
                workdir: key.workdir,
                session_id: key.session_id,
            });
        }
        let context = Arc::new(SessionContext {
            key: key.clone(),
            cancel: CancellationToken::new(),
            opened_at: Utc::now(),
        });
        entries.insert(key, context.clone());
        Ok(SessionLease {
            registry: Arc::clone(self),
            context,
        })
    }

    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionContext>> {
        self.entries().get(key).cloned()
    }

    /// Signal cancellation for an open session. Returns false if not open.
    pub fn cancel(&self, workdir: &Path, session_id: &str) -> bool {
        let key = SessionKey::new(workdir, session_id);
        match self.get(&key) {
            Some(context) => {
                context.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove an entry and cancel anything still running under it.
    pub fn teardown(&self, key: &SessionKey) -> bool {
        let removed = self.entries().remove(key);
        match removed {
            Some(context) => {
                context.cancel.cancel();
                logging::info(format!("Closed session {}", key.session_id));
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive claim on an open session.
#[derive(Debug)]
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    context: Arc<SessionContext>,
}

impl SessionLease {
    #[must_use]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.context.cancel
    }

    /// Swap in a fresh token after a canceled run so the next one can proceed.
    pub fn renew(&mut self) -> &CancellationToken {
        let context = Arc::new(SessionContext {
            key: self.context.key.clone(),
            cancel: CancellationToken::new(),
            opened_at: self.context.opened_at,
        });
        let mut entries = self.registry.entries();
        if let Some(slot) = entries.get_mut(&context.key)
            && Arc::ptr_eq(slot, &self.context)
        {
            *slot = context.clone();
        }
        drop(entries);
        self.context = context;
        &self.context.cancel
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let key = &self.context.key;
        let ours = self
            .registry
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(&current, &self.context));
        if ours {
            self.registry.teardown(key);
        }
    }
}
