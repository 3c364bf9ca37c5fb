//! Token issuance.

use axum::extract::State;
use axum::{Extension, Json};

use super::{Valid, checked, reply};
use crate::AppState;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::proto::{LoginRequest, LoginResponse, RefreshTokenRequest, RefreshTokenResponse};

pub async fn login(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Valid(rq): Valid<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    reply(&ctx, state.biz.user().login(&ctx, rq).await)
}

/// Sign a fresh token for the authenticated user.
pub async fn refresh_token(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<RefreshTokenResponse>, ApiError> {
    let rq = checked(&ctx, RefreshTokenRequest {})?;
    reply(&ctx, state.biz.user().refresh_token(&ctx, rq).await)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};

    use crate::*;

    async fn body(response: axum::http::Response<axum::body::Body>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(state: &AppState, password: &str) -> axum::http::Response<axum::body::Body> {
        make_request(
            None,
            app(state.clone()),
            Method::POST,
            "/login",
            json!({"username": "bob", "password": password}).to_string(),
        )
        .await
    }

    #[tokio::test]
    async fn test_login_and_refresh() {
        let state = test_state().await;
        let response = make_request(
            None,
            app(state.clone()),
            Method::POST,
            "/v1/users",
            json!({
                "username": "bob",
                "password": "miniblog1234",
                "email": "bob@miniblog.dev",
                "phone": "13800000001",
            })
            .to_string(),
        )
        .await;
        let user_id = body(response).await["userID"].as_str().unwrap().to_owned();

        let response = login(&state, "wrong1234").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = login(&state, "miniblog1234").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body(response).await;
        let token = json["token"].as_str().unwrap().to_owned();
        assert!(json["expireAt"].is_string());
        assert_eq!(state.tokens.parse(&token).unwrap(), user_id);

        let response = make_request(
            Some(&token),
            app(state.clone()),
            Method::PUT,
            "/refresh-token",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let refreshed = body(response).await["token"].as_str().unwrap().to_owned();
        assert_eq!(state.tokens.parse(&refreshed).unwrap(), user_id);
    }

    #[tokio::test]
    async fn test_refresh_requires_token() {
        let state = test_state().await;
        let response = make_request(
            Some("not-a-jwt"),
            app(state),
            Method::PUT,
            "/refresh-token",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(response).await["reason"], "Unauthenticated.TokenInvalid");
    }

    #[tokio::test]
    async fn test_healthz_and_headers() {
        let state = test_state().await;
        let response = make_request(
            None,
            app(state),
            Method::GET,
            "/healthz",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(body(response).await["status"], "Healthy");
    }
}
