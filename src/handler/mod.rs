//! Steps shared by the gRPC service and the HTTP routes.

pub mod grpc;

use chrono::Utc;
use uuid::Uuid;

use crate::AppState;
use crate::context::RequestContext;
use crate::errno;
use crate::error::Result;
use crate::proto::{HealthzResponse, ServiceStatus};
use crate::store::{Scope, Where};

/// Caller-provided request id, or a fresh one.
pub fn request_id(provided: Option<&str>) -> String {
    match provided.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Resolve a bearer token into the context of its user.
///
/// The user must still exist: a token outliving its account is rejected.
pub async fn authenticate(
    state: &AppState,
    token: &str,
    ctx: RequestContext,
) -> Result<RequestContext> {
    let user_id = state.tokens.parse(token)?;

    let user = state
        .store
        .user()
        .get(Scope::All, Where::new().filter("user_id", &user_id))
        .await
        .map_err(|err| {
            if err.is(&errno::ERR_USER_NOT_FOUND) {
                errno::ERR_UNAUTHENTICATED.with_message("user of the token no longer exists")
            } else {
                err
            }
        })?;

    Ok(ctx.with_user(user.user_id, user.username).with_token(token))
}

pub fn healthz() -> HealthzResponse {
    HealthzResponse {
        status: ServiceStatus::Healthy as i32,
        timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        message: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id() {
        assert_eq!(request_id(Some("abc")), "abc");
        assert_eq!(request_id(Some(" ")).len(), 36);
        assert_ne!(request_id(None), request_id(None));
    }
}
