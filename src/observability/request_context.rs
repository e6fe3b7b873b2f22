//! Correlation IDs for HTTP requests.
//!
//! The HTTP layer scopes a [`RequestContext`] over each handler. Anything
//! running inside that task can read the ID back with [`current_request_id`]
//! to tag its logs.

use std::future::Future;
use uuid::Uuid;

/// Header used to carry the correlation ID in and out of the service.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied ID that is accepted.
const MAX_REQUEST_ID_LEN: usize = 128;

tokio::task_local! {
    static REQUEST_ID: RequestContext;
}

/// Correlation data for one request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: String,
}

impl RequestContext {
    /// Creates a context with a fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Adopts the client's header value, or generates an ID when it is
    /// absent, empty, or longer than 128 bytes.
    #[must_use]
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
            .map_or_else(Self::new, |id| Self {
                request_id: id.to_string(),
            })
    }

    /// Returns the request ID.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `fut` with `context` as the current request.
pub async fn scope_request_context<F, T>(context: RequestContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    REQUEST_ID.scope(context, fut).await
}

/// Returns the ID of the request being served by this task, if any.
#[must_use]
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|ctx| ctx.request_id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scoped_id_survives_await() {
        let observed = scope_request_context(RequestContext::from_header(Some("abc-1")), async {
            tokio::task::yield_now().await;
            current_request_id()
        })
        .await;
        assert_eq!(observed.as_deref(), Some("abc-1"));
        assert_eq!(current_request_id(), None);
    }

    #[test]
    fn test_header_value_is_adopted_when_reasonable() {
        assert_eq!(RequestContext::from_header(Some("req-7")).request_id(), "req-7");

        let generated = RequestContext::from_header(None);
        assert!(Uuid::parse_str(generated.request_id()).is_ok());

        let empty = RequestContext::from_header(Some(""));
        assert!(!empty.request_id().is_empty());

        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        assert_ne!(RequestContext::from_header(Some(&long)).request_id(), long);
    }
}
