//! Request correlation scope.
//!
//! IDs are carried in a tokio task-local so that any log record emitted
//! while handling a request picks them up without plumbing parameters.
//! The scope is set once around each request (or long-lived streaming
//! session) and cannot leak across tasks.

use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static SCOPE: CorrelationScope;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationScope {
    pub request_id: String,
    pub correlation_id: String,
    pub session_id: Option<String>,
}

impl CorrelationScope {
    /// Scope for one HTTP request. Missing IDs are freshly generated.
    pub fn for_request(request_id: Option<String>, correlation_id: Option<String>) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(new_id),
            correlation_id: correlation_id.unwrap_or_else(new_id),
            session_id: None,
        }
    }

    /// Scope for a long-lived streaming connection.
    pub fn for_streaming_session() -> Self {
        Self {
            request_id: new_id(),
            correlation_id: new_id(),
            session_id: Some(new_id()),
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Run `fut` with `scope` installed as the task-local correlation scope.
pub async fn with_scope<F>(scope: CorrelationScope, fut: F) -> F::Output
where
    F: Future,
{
    SCOPE.scope(scope, fut).await
}

/// The correlation scope of the current task, if one is installed.
pub fn current() -> Option<CorrelationScope> {
    SCOPE.try_with(|s| s.clone()).ok()
}

/// Generate a `(session_id, correlation_id)` pair for streaming connections
/// whose scope is managed by the caller.
pub fn streaming_session_ids() -> (String, String) {
    (new_id(), new_id())
}
