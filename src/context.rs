//! Per-request metadata passed from transports down to the business layer.

use tokio_util::sync::CancellationToken;

/// Identity and correlation data of the request being served.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Authenticated user id, empty for anonymous calls.
    pub user_id: String,
    pub username: String,
    pub request_id: String,
    /// Raw bearer token as presented by the caller.
    pub token: String,
    /// Cancelled when the caller goes away or the server shuts down.
    pub cancellation: CancellationToken,
}

impl RequestContext {
    /// Create an anonymous context.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// Attach an authenticated user.
    pub fn with_user(
        mut self,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        self.user_id = user_id.into();
        self.username = username.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Derive the cancellation from a parent token.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancellation = parent.child_token();
        self
    }
}
