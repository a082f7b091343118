//! Correlated response handles and the bounded multi-wait.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use babel_id::CorrelationId;
use babel_protocol::CommandResult;
use futures_util::future::join_all;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::FleetError;

/// Replies awaited on one control channel, keyed by correlation id.
pub(crate) type PendingReplies = Mutex<HashMap<CorrelationId, oneshot::Sender<CommandResult>>>;

enum HandleState {
    Waiting {
        rx: oneshot::Receiver<CommandResult>,
        pending: Weak<PendingReplies>,
    },
    Ready(CommandResult),
}

/// The eventual reply of one node to one request.
pub struct ResponseHandle {
    lang: String,
    id: CorrelationId,
    state: HandleState,
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("lang", &self.lang)
            .field("id", &self.id)
            .finish()
    }
}

impl ResponseHandle {
    pub(crate) fn waiting(
        lang: impl Into<String>,
        id: CorrelationId,
        rx: oneshot::Receiver<CommandResult>,
        pending: &Arc<PendingReplies>,
    ) -> Self {
        Self {
            lang: lang.into(),
            id,
            state: HandleState::Waiting {
                rx,
                pending: Arc::downgrade(pending),
            },
        }
    }

    /// A handle that is already resolved, e.g. because the send failed.
    pub fn resolved(lang: impl Into<String>, result: CommandResult) -> Self {
        Self {
            lang: lang.into(),
            id: CorrelationId::new(),
            state: HandleState::Ready(result),
        }
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait until `deadline` at the latest.
    ///
    /// A closed channel or an elapsed deadline both yield `NodeDidNotRespond`.
    pub async fn wait_until(self, deadline: Instant) -> (String, CommandResult) {
        let Self { lang, id, state } = self;
        let result = match state {
            HandleState::Ready(result) => result,
            HandleState::Waiting { rx, pending } => {
                match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => no_response(&lang, "channel closed"),
                    Err(_) => {
                        if let Some(pending) = pending.upgrade() {
                            pending
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .remove(&id);
                        }
                        no_response(&lang, "timed out")
                    }
                }
            }
        };
        (lang, result)
    }
}

fn no_response(lang: &str, why: &str) -> CommandResult {
    let err = FleetError::NodeDidNotRespond {
        lang: lang.to_string(),
        reason: why.to_string(),
    };
    CommandResult::failure(err.to_string())
}

/// Wait for every handle, bounded by one shared deadline.
///
/// Returns one entry per handle's language regardless of how many never
/// resolve.
pub async fn wait_for_all(
    handles: Vec<ResponseHandle>,
    timeout: Duration,
) -> BTreeMap<String, CommandResult> {
    let deadline = Instant::now() + timeout;
    join_all(handles.into_iter().map(|h| h.wait_until(deadline)))
        .await
        .into_iter()
        .collect()
}
