//! HTTP routes forwarded to the gRPC server.
//!
//! `Authorization` and `x-request-id` travel as gRPC metadata. A failed call
//! comes back as the same JSON error the native routes produce.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use super::{bind, bind_query};
use crate::config::Tls;
use crate::context::RequestContext;
use crate::errno;
use crate::error::{ApiError, Result};
use crate::known::X_REQUEST_ID;
use crate::proto::*;

/// Metadata copied from HTTP headers.
const FORWARDED: &[&str] = &["authorization", X_REQUEST_ID];

/// Client side of the gateway.
#[derive(Clone)]
pub struct Gateway {
    client: MiniBlogClient<Channel>,
}

impl Gateway {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: MiniBlogClient::new(channel),
        }
    }

    /// Channel to the gRPC listener at `addr`, opened on first use.
    pub fn connect_lazy(addr: SocketAddr, tls: &Tls) -> Result<Self> {
        let addr = if addr.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        } else {
            addr
        };
        let scheme = if tls.use_tls { "https" } else { "http" };

        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
            .map_err(|err| errno::ERR_INTERNAL.with_message(err.to_string()))?;

        if tls.use_tls {
            let pem = std::fs::read(&tls.cert).map_err(|err| {
                errno::ERR_INTERNAL.with_message(format!("cannot read tls.cert: {err}"))
            })?;
            endpoint = endpoint
                .tls_config(
                    ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(pem))
                        .domain_name("localhost"),
                )
                .map_err(|err| errno::ERR_INTERNAL.with_message(err.to_string()))?;
        }

        Ok(Self::new(endpoint.connect_lazy()))
    }

    async fn forward<Rq, Rs, F, Fut>(
        &self,
        headers: &HeaderMap,
        rq: Rq,
        call: F,
    ) -> std::result::Result<Json<Rs>, ApiError>
    where
        F: FnOnce(MiniBlogClient<Channel>, tonic::Request<Rq>) -> Fut,
        Fut: Future<Output = std::result::Result<tonic::Response<Rs>, tonic::Status>>,
    {
        let mut request = tonic::Request::new(rq);
        for &key in FORWARDED {
            let value = headers
                .get(key)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| MetadataValue::try_from(value).ok());
            if let Some(value) = value {
                request.metadata_mut().insert(key, value);
            }
        }

        match call(self.client.clone(), request).await {
            Ok(response) => Ok(Json(response.into_inner())),
            Err(status) => {
                tracing::debug!(code = ?status.code(), message = status.message(), "grpc call failed");
                Err(ApiError::from_status(&status))
            },
        }
    }
}

fn context(headers: &HeaderMap) -> RequestContext {
    RequestContext::new(
        headers
            .get(X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default(),
    )
}

async fn healthz(
    State(gw): State<Gateway>,
    headers: HeaderMap,
) -> std::result::Result<Json<HealthzResponse>, ApiError> {
    gw.forward(&headers, HealthzRequest {}, |mut client, rq| async move {
        client.healthz(rq).await
    })
    .await
}

async fn login(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    body: std::result::Result<Json<LoginRequest>, JsonRejection>,
) -> std::result::Result<Json<LoginResponse>, ApiError> {
    let rq = bind(&context(&headers), body)?;
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.login(rq).await
    })
    .await
}

async fn refresh_token(
    State(gw): State<Gateway>,
    headers: HeaderMap,
) -> std::result::Result<Json<RefreshTokenResponse>, ApiError> {
    gw.forward(&headers, RefreshTokenRequest {}, |mut client, rq| async move {
        client.refresh_token(rq).await
    })
    .await
}

async fn change_password(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    body: std::result::Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> std::result::Result<Json<ChangePasswordResponse>, ApiError> {
    let rq = ChangePasswordRequest {
        user_id,
        ..bind(&context(&headers), body)?
    };
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.change_password(rq).await
    })
    .await
}

async fn create_user(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    body: std::result::Result<Json<CreateUserRequest>, JsonRejection>,
) -> std::result::Result<Json<CreateUserResponse>, ApiError> {
    let rq = bind(&context(&headers), body)?;
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.create_user(rq).await
    })
    .await
}

async fn update_user(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    body: std::result::Result<Json<UpdateUserRequest>, JsonRejection>,
) -> std::result::Result<Json<UpdateUserResponse>, ApiError> {
    let rq = UpdateUserRequest {
        user_id,
        ..bind(&context(&headers), body)?
    };
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.update_user(rq).await
    })
    .await
}

async fn delete_user(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> std::result::Result<Json<DeleteUserResponse>, ApiError> {
    gw.forward(&headers, DeleteUserRequest { user_id }, |mut client, rq| async move {
        client.delete_user(rq).await
    })
    .await
}

async fn get_user(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> std::result::Result<Json<GetUserResponse>, ApiError> {
    gw.forward(&headers, GetUserRequest { user_id }, |mut client, rq| async move {
        client.get_user(rq).await
    })
    .await
}

async fn list_user(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    query: std::result::Result<Query<ListUserRequest>, QueryRejection>,
) -> std::result::Result<Json<ListUserResponse>, ApiError> {
    let rq = bind_query(&context(&headers), query)?;
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.list_user(rq).await
    })
    .await
}

async fn create_post(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    body: std::result::Result<Json<CreatePostRequest>, JsonRejection>,
) -> std::result::Result<Json<CreatePostResponse>, ApiError> {
    let rq = bind(&context(&headers), body)?;
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.create_post(rq).await
    })
    .await
}

async fn update_post(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
    body: std::result::Result<Json<UpdatePostRequest>, JsonRejection>,
) -> std::result::Result<Json<UpdatePostResponse>, ApiError> {
    let rq = UpdatePostRequest {
        post_id,
        ..bind(&context(&headers), body)?
    };
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.update_post(rq).await
    })
    .await
}

async fn delete_post(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    body: std::result::Result<Json<DeletePostRequest>, JsonRejection>,
) -> std::result::Result<Json<DeletePostResponse>, ApiError> {
    let rq = bind(&context(&headers), body)?;
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.delete_post(rq).await
    })
    .await
}

async fn get_post(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
) -> std::result::Result<Json<GetPostResponse>, ApiError> {
    gw.forward(&headers, GetPostRequest { post_id }, |mut client, rq| async move {
        client.get_post(rq).await
    })
    .await
}

async fn list_post(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    query: std::result::Result<Query<ListPostRequest>, QueryRejection>,
) -> std::result::Result<Json<ListPostResponse>, ApiError> {
    let rq = bind_query(&context(&headers), query)?;
    gw.forward(&headers, rq, |mut client, rq| async move {
        client.list_post(rq).await
    })
    .await
}

/// Same routes as [`super::routes`], served through `gateway`.
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/refresh-token", put(refresh_token))
        .route("/v1/users", post(create_user).get(list_user))
        .route(
            "/v1/users/{user_id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/v1/users/{user_id}/change-password", put(change_password))
        .route(
            "/v1/posts",
            post(create_post).get(list_post).delete(delete_post),
        )
        .route("/v1/posts/{post_id}", get(get_post).put(update_post))
        .layer(axum::middleware::from_fn(super::middleware::headers))
        .with_state(gateway)
}
