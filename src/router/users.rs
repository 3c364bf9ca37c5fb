//! Users-related HTTP API.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};

use super::{Valid, bind, bind_query, checked, reply};
use crate::AppState;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::proto::{
    ChangePasswordRequest, ChangePasswordResponse, CreateUserRequest, CreateUserResponse,
    DeleteUserRequest, DeleteUserResponse, GetUserRequest, GetUserResponse, ListUserRequest,
    ListUserResponse, UpdateUserRequest, UpdateUserResponse,
};

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Valid(rq): Valid<CreateUserRequest>,
) -> Result<Json<CreateUserResponse>, ApiError> {
    reply(&ctx, state.biz.user().create(&ctx, rq).await)
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<String>,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UpdateUserResponse>, ApiError> {
    let rq = UpdateUserRequest {
        user_id,
        ..bind(&ctx, body)?
    };
    let rq = checked(&ctx, rq)?;

    reply(&ctx, state.biz.user().update(&ctx, rq).await)
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<String>,
    body: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<ChangePasswordResponse>, ApiError> {
    let rq = ChangePasswordRequest {
        user_id,
        ..bind(&ctx, body)?
    };
    let rq = checked(&ctx, rq)?;

    reply(&ctx, state.biz.user().change_password(&ctx, rq).await)
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<String>,
) -> Result<Json<DeleteUserResponse>, ApiError> {
    let rq = checked(&ctx, DeleteUserRequest { user_id })?;
    reply(&ctx, state.biz.user().delete(&ctx, rq).await)
}

pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<String>,
) -> Result<Json<GetUserResponse>, ApiError> {
    let rq = checked(&ctx, GetUserRequest { user_id })?;
    reply(&ctx, state.biz.user().get(&ctx, rq).await)
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<ListUserRequest>, QueryRejection>,
) -> Result<Json<ListUserResponse>, ApiError> {
    let rq = checked(&ctx, bind_query(&ctx, query)?)?;
    reply(&ctx, state.biz.user().list(&ctx, rq).await)
}
