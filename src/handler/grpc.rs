//! gRPC surface of `v1.MiniBlog`.

use std::future::Future;
use std::time::Instant;

use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};

use crate::AppState;
use crate::authz::ACTION_CALL;
use crate::context::RequestContext;
use crate::error::Result;
use crate::known::X_REQUEST_ID;
use crate::proto::*;
use crate::telemetry;
use crate::validation::{Defaulter, Validate};

/// Implementation of the generated [`MiniBlog`] trait.
#[derive(Clone)]
pub struct Handler {
    state: AppState,
}

impl Handler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run the request pipeline then `call`.
    ///
    /// Public methods skip authentication and authorization.
    async fn serve<Rq, Rs, F, Fut>(
        &self,
        method: &'static str,
        public: bool,
        request: Request<Rq>,
        call: F,
    ) -> std::result::Result<Response<Rs>, Status>
    where
        Rq: Validate + Defaulter,
        F: FnOnce(RequestContext, Rq) -> Fut,
        Fut: Future<Output = Result<Rs>>,
    {
        let start = Instant::now();
        let request_id = super::request_id(
            request
                .metadata()
                .get(X_REQUEST_ID)
                .and_then(|value| value.to_str().ok()),
        );

        let outcome = self
            .pipeline(method, public, &request_id, request, call)
            .await;
        let result = match outcome {
            Ok(body) => {
                let mut response = Response::new(body);
                if let Ok(value) = MetadataValue::try_from(request_id.as_str()) {
                    response.metadata_mut().insert(X_REQUEST_ID, value);
                }
                Ok(response)
            },
            Err(err) => {
                if err.status_code().is_server_error() {
                    tracing::error!(method, %request_id, error = %err, "grpc call failed");
                } else {
                    tracing::debug!(method, %request_id, error = %err, "grpc call rejected");
                }
                Err(Status::from(err.with_request_id(&request_id)))
            },
        };

        let code = match &result {
            Ok(_) => tonic::Code::Ok,
            Err(status) => status.code(),
        };
        telemetry::track_grpc(method, code, start);

        result
    }

    async fn pipeline<Rq, Rs, F, Fut>(
        &self,
        method: &'static str,
        public: bool,
        request_id: &str,
        request: Request<Rq>,
        call: F,
    ) -> Result<Rs>
    where
        Rq: Validate + Defaulter,
        F: FnOnce(RequestContext, Rq) -> Fut,
        Fut: Future<Output = Result<Rs>>,
    {
        let mut ctx = RequestContext::new(request_id).with_cancellation(&self.state.shutdown);

        if !public {
            let token = self.state.tokens.bearer(request.metadata())?.to_owned();
            ctx = super::authenticate(&self.state, &token, ctx).await?;
            self.state
                .authz
                .check(&ctx.user_id, &format!("/{SERVICE_NAME}/{method}"), ACTION_CALL)
                .await?;
        }

        let mut rq = request.into_inner();
        rq.apply_defaults();
        rq.validate(&ctx)?;

        call(ctx, rq).await
    }
}

#[tonic::async_trait]
impl MiniBlog for Handler {
    async fn healthz(
        &self,
        _: Request<HealthzRequest>,
    ) -> std::result::Result<Response<HealthzResponse>, Status> {
        let start = Instant::now();
        let response = Response::new(super::healthz());
        telemetry::track_grpc("Healthz", tonic::Code::Ok, start);
        Ok(response)
    }

    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> std::result::Result<Response<LoginResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("Login", true, request, |ctx, rq| async move {
            biz.user().login(&ctx, rq).await
        })
        .await
    }

    async fn refresh_token(
        &self,
        request: Request<RefreshTokenRequest>,
    ) -> std::result::Result<Response<RefreshTokenResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("RefreshToken", false, request, |ctx, rq| async move {
            biz.user().refresh_token(&ctx, rq).await
        })
        .await
    }

    async fn change_password(
        &self,
        request: Request<ChangePasswordRequest>,
    ) -> std::result::Result<Response<ChangePasswordResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("ChangePassword", false, request, |ctx, rq| async move {
            biz.user().change_password(&ctx, rq).await
        })
        .await
    }

    async fn create_user(
        &self,
        request: Request<CreateUserRequest>,
    ) -> std::result::Result<Response<CreateUserResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("CreateUser", true, request, |ctx, rq| async move {
            biz.user().create(&ctx, rq).await
        })
        .await
    }

    async fn update_user(
        &self,
        request: Request<UpdateUserRequest>,
    ) -> std::result::Result<Response<UpdateUserResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("UpdateUser", false, request, |ctx, rq| async move {
            biz.user().update(&ctx, rq).await
        })
        .await
    }

    async fn delete_user(
        &self,
        request: Request<DeleteUserRequest>,
    ) -> std::result::Result<Response<DeleteUserResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("DeleteUser", false, request, |ctx, rq| async move {
            biz.user().delete(&ctx, rq).await
        })
        .await
    }

    async fn get_user(
        &self,
        request: Request<GetUserRequest>,
    ) -> std::result::Result<Response<GetUserResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("GetUser", false, request, |ctx, rq| async move {
            biz.user().get(&ctx, rq).await
        })
        .await
    }

    async fn list_user(
        &self,
        request: Request<ListUserRequest>,
    ) -> std::result::Result<Response<ListUserResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("ListUser", false, request, |ctx, rq| async move {
            biz.user().list(&ctx, rq).await
        })
        .await
    }

    async fn create_post(
        &self,
        request: Request<CreatePostRequest>,
    ) -> std::result::Result<Response<CreatePostResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("CreatePost", false, request, |ctx, rq| async move {
            biz.post().create(&ctx, rq).await
        })
        .await
    }

    async fn update_post(
        &self,
        request: Request<UpdatePostRequest>,
    ) -> std::result::Result<Response<UpdatePostResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("UpdatePost", false, request, |ctx, rq| async move {
            biz.post().update(&ctx, rq).await
        })
        .await
    }

    async fn delete_post(
        &self,
        request: Request<DeletePostRequest>,
    ) -> std::result::Result<Response<DeletePostResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("DeletePost", false, request, |ctx, rq| async move {
            biz.post().delete(&ctx, rq).await
        })
        .await
    }

    async fn get_post(
        &self,
        request: Request<GetPostRequest>,
    ) -> std::result::Result<Response<GetPostResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("GetPost", false, request, |ctx, rq| async move {
            biz.post().get(&ctx, rq).await
        })
        .await
    }

    async fn list_post(
        &self,
        request: Request<ListPostRequest>,
    ) -> std::result::Result<Response<ListPostResponse>, Status> {
        let biz = &self.state.biz;
        self.serve("ListPost", false, request, |ctx, rq| async move {
            biz.post().list(&ctx, rq).await
        })
        .await
    }
}
