//! Middlewares for routes.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::handler;
use crate::known::X_REQUEST_ID;

/// Attach a [`RequestContext`] carrying the request id.
pub async fn context(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let request_id = handler::request_id(
        req.headers()
            .get(X_REQUEST_ID)
            .and_then(|value| value.to_str().ok()),
    );
    let ctx = RequestContext::new(request_id).with_cancellation(&state.shutdown);

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// Custom middleware for authentification.
pub async fn authn(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    let request_id = ctx.request_id.clone();

    let token = state
        .tokens
        .bearer(req.headers())
        .map_err(|err| err.with_request_id(&request_id))?
        .to_owned();
    let ctx = handler::authenticate(&state, &token, ctx)
        .await
        .map_err(|err| err.with_request_id(&request_id))?;

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

/// Check the subject against the method and path.
pub async fn authz(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    state
        .authz
        .check(&ctx.user_id, req.uri().path(), req.method().as_str())
        .await
        .map_err(|err| err.with_request_id(&ctx.request_id))?;

    Ok(next.run(req).await)
}

/// No-cache and security headers.
pub async fn headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate, value"),
    );
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );

    response
}
