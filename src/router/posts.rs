//! Posts-related HTTP API.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};

use super::{Valid, bind, bind_query, checked, reply};
use crate::AppState;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::proto::{
    CreatePostRequest, CreatePostResponse, DeletePostRequest, DeletePostResponse, GetPostRequest,
    GetPostResponse, ListPostRequest, ListPostResponse, UpdatePostRequest, UpdatePostResponse,
};

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Valid(rq): Valid<CreatePostRequest>,
) -> Result<Json<CreatePostResponse>, ApiError> {
    reply(&ctx, state.biz.post().create(&ctx, rq).await)
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(post_id): Path<String>,
    body: Result<Json<UpdatePostRequest>, JsonRejection>,
) -> Result<Json<UpdatePostResponse>, ApiError> {
    let rq = UpdatePostRequest {
        post_id,
        ..bind(&ctx, body)?
    };
    let rq = checked(&ctx, rq)?;

    reply(&ctx, state.biz.post().update(&ctx, rq).await)
}

/// Ids come in the body: `{"postIDs": [...]}`.
pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Valid(rq): Valid<DeletePostRequest>,
) -> Result<Json<DeletePostResponse>, ApiError> {
    reply(&ctx, state.biz.post().delete(&ctx, rq).await)
}

pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(post_id): Path<String>,
) -> Result<Json<GetPostResponse>, ApiError> {
    let rq = checked(&ctx, GetPostRequest { post_id })?;
    reply(&ctx, state.biz.post().get(&ctx, rq).await)
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<ListPostRequest>, QueryRejection>,
) -> Result<Json<ListPostResponse>, ApiError> {
    let rq = checked(&ctx, bind_query(&ctx, query)?)?;
    reply(&ctx, state.biz.post().list(&ctx, rq).await)
}
