use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{ApiError, Result};
use crate::model::PostM;
use crate::proto::{
    CreatePostRequest, CreatePostResponse, DeletePostRequest, DeletePostResponse, GetPostRequest,
    GetPostResponse, ListPostRequest, ListPostResponse, Post, UpdatePostRequest,
    UpdatePostResponse,
};
use crate::store::{IStore, Scope, Where, with_transaction};

/// Post operations. Every call is restricted to the posts of `ctx.user_id`.
#[async_trait]
pub trait PostBiz: Send + Sync {
    async fn create(&self, ctx: &RequestContext, rq: CreatePostRequest)
    -> Result<CreatePostResponse>;
    async fn update(&self, ctx: &RequestContext, rq: UpdatePostRequest)
    -> Result<UpdatePostResponse>;
    async fn delete(&self, ctx: &RequestContext, rq: DeletePostRequest)
    -> Result<DeletePostResponse>;
    async fn get(&self, ctx: &RequestContext, rq: GetPostRequest) -> Result<GetPostResponse>;
    async fn list(&self, ctx: &RequestContext, rq: ListPostRequest) -> Result<ListPostResponse>;
}

#[derive(Clone)]
pub struct PostService {
    store: Arc<dyn IStore>,
}

impl PostService {
    pub fn new(store: Arc<dyn IStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PostBiz for PostService {
    async fn create(
        &self,
        ctx: &RequestContext,
        rq: CreatePostRequest,
    ) -> Result<CreatePostResponse> {
        let post = PostM {
            user_id: ctx.user_id.clone(),
            title: rq.title,
            content: rq.content,
            ..Default::default()
        };
        let post = with_transaction(&self.store, move |tx| async move {
            let mut post = post;
            tx.post().create(&mut post).await?;
            Ok::<_, ApiError>(post)
        })
        .await?;

        tracing::debug!(post_id = %post.post_id, user_id = %ctx.user_id, "post created");
        Ok(CreatePostResponse {
            post_id: post.post_id,
        })
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        rq: UpdatePostRequest,
    ) -> Result<UpdatePostResponse> {
        let mut post = self
            .store
            .post()
            .get(
                Scope::Owner(&ctx.user_id),
                Where::new().filter("post_id", &rq.post_id),
            )
            .await?;

        if let Some(title) = rq.title {
            post.title = title;
        }
        if let Some(content) = rq.content {
            post.content = content;
        }
        self.store.post().update(&post).await?;

        Ok(UpdatePostResponse {})
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        rq: DeletePostRequest,
    ) -> Result<DeletePostResponse> {
        self.store
            .post()
            .delete(
                Scope::Owner(&ctx.user_id),
                Where::new().filter_in("post_id", rq.post_ids),
            )
            .await?;

        Ok(DeletePostResponse {})
    }

    async fn get(&self, ctx: &RequestContext, rq: GetPostRequest) -> Result<GetPostResponse> {
        let post = self
            .store
            .post()
            .get(
                Scope::Owner(&ctx.user_id),
                Where::new().filter("post_id", &rq.post_id),
            )
            .await?;

        Ok(GetPostResponse {
            post: Some(post.into()),
        })
    }

    async fn list(&self, ctx: &RequestContext, rq: ListPostRequest) -> Result<ListPostResponse> {
        let mut whr = Where::new().paginate(rq.offset, rq.limit);
        if let Some(title) = rq.title {
            whr = whr.contains("title", title);
        }

        let (total_count, posts) = self
            .store
            .post()
            .list(Scope::Owner(&ctx.user_id), whr)
            .await?;

        Ok(ListPostResponse {
            total_count,
            posts: posts.into_iter().map(Post::from).collect(),
        })
    }
}
