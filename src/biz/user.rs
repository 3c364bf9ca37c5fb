use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::authz::Authorizer;
use crate::context::RequestContext;
use crate::crypto::PasswordManager;
use crate::errno;
use crate::error::{ApiError, Result};
use crate::known::{ADMIN_USERNAME, MAX_CONCURRENCY, ROLE_ADMIN, ROLE_USER};
use crate::model::{PolicyRule, UserM};
use crate::proto::{
    ChangePasswordRequest, ChangePasswordResponse, CreateUserRequest, CreateUserResponse,
    DeleteUserRequest, DeleteUserResponse, GetUserRequest, GetUserResponse, ListUserRequest,
    ListUserResponse, LoginRequest, LoginResponse, RefreshTokenRequest, RefreshTokenResponse,
    UpdateUserRequest, UpdateUserResponse, User,
};
use crate::store::{IStore, Scope, Where, with_transaction};
use crate::token::TokenManager;

/// User operations.
#[async_trait]
pub trait UserBiz: Send + Sync {
    async fn login(&self, ctx: &RequestContext, rq: LoginRequest) -> Result<LoginResponse>;
    async fn refresh_token(
        &self,
        ctx: &RequestContext,
        rq: RefreshTokenRequest,
    ) -> Result<RefreshTokenResponse>;
    async fn change_password(
        &self,
        ctx: &RequestContext,
        rq: ChangePasswordRequest,
    ) -> Result<ChangePasswordResponse>;
    async fn create(&self, ctx: &RequestContext, rq: CreateUserRequest)
    -> Result<CreateUserResponse>;
    async fn update(&self, ctx: &RequestContext, rq: UpdateUserRequest)
    -> Result<UpdateUserResponse>;
    async fn delete(&self, ctx: &RequestContext, rq: DeleteUserRequest)
    -> Result<DeleteUserResponse>;
    async fn get(&self, ctx: &RequestContext, rq: GetUserRequest) -> Result<GetUserResponse>;
    /// List users with their post count. Counts are computed concurrently,
    /// at most [`MAX_CONCURRENCY`] at a time.
    async fn list(&self, ctx: &RequestContext, rq: ListUserRequest) -> Result<ListUserResponse>;
}

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn IStore>,
    tokens: TokenManager,
    authz: Arc<Authorizer>,
    passwords: PasswordManager,
}

async fn count_posts(store: &dyn IStore, user_id: &str) -> Result<i64> {
    let (count, _) = store
        .post()
        .list(Scope::Owner(user_id), Where::new().paginate(0, 1))
        .await?;
    Ok(count)
}

impl UserService {
    pub fn new(
        store: Arc<dyn IStore>,
        tokens: TokenManager,
        authz: Arc<Authorizer>,
        passwords: PasswordManager,
    ) -> Self {
        Self {
            store,
            tokens,
            authz,
            passwords,
        }
    }

    async fn is_admin(&self, ctx: &RequestContext) -> bool {
        ctx.username == ADMIN_USERNAME || self.authz.has_role(&ctx.user_id, ROLE_ADMIN).await
    }

    async fn page(&self, ctx: &RequestContext, rq: &ListUserRequest) -> Result<(i64, Vec<UserM>)> {
        let admin = self.is_admin(ctx).await;
        self.store
            .user()
            .list(
                Scope::of(&ctx.user_id, admin),
                Where::new().paginate(rq.offset, rq.limit),
            )
            .await
    }

    /// Same result as [`UserBiz::list`], counting posts one user at a time.
    pub async fn list_sequential(
        &self,
        ctx: &RequestContext,
        rq: ListUserRequest,
    ) -> Result<ListUserResponse> {
        let (total_count, users) = self.page(ctx, &rq).await?;

        let mut out = Vec::with_capacity(users.len());
        for user in users {
            let count = count_posts(self.store.as_ref(), &user.user_id).await?;
            out.push(user.into_proto(count));
        }

        Ok(ListUserResponse {
            total_count,
            users: out,
        })
    }
}

#[async_trait]
impl UserBiz for UserService {
    async fn login(&self, _: &RequestContext, rq: LoginRequest) -> Result<LoginResponse> {
        let user = self
            .store
            .user()
            .get(Scope::All, Where::new().filter("username", &rq.username))
            .await
            .map_err(|err| {
                tracing::debug!(error = %err, username = %rq.username, "login on unknown user");
                errno::ERR_USER_NOT_FOUND
            })?;

        self.passwords
            .verify_password(&rq.password, &user.password)
            .map_err(|_| errno::ERR_PASSWORD_INVALID)?;

        let (token, expire_at) = self.tokens.sign(&user.user_id)?;
        Ok(LoginResponse {
            token,
            expire_at: expire_at.to_rfc3339(),
        })
    }

    async fn refresh_token(
        &self,
        ctx: &RequestContext,
        _: RefreshTokenRequest,
    ) -> Result<RefreshTokenResponse> {
        let (token, expire_at) = self.tokens.sign(&ctx.user_id)?;
        Ok(RefreshTokenResponse {
            token,
            expire_at: expire_at.to_rfc3339(),
        })
    }

    async fn change_password(
        &self,
        ctx: &RequestContext,
        rq: ChangePasswordRequest,
    ) -> Result<ChangePasswordResponse> {
        let mut user = self
            .store
            .user()
            .get(
                Scope::Owner(&ctx.user_id),
                Where::new().filter("user_id", &rq.user_id),
            )
            .await?;

        self.passwords
            .verify_password(&rq.old_password, &user.password)
            .map_err(|_| errno::ERR_PASSWORD_INVALID)?;

        user.password = self.passwords.hash_password(&rq.new_password).map_err(|err| {
            tracing::error!(error = %err, "failed to hash password");
            errno::ERR_INTERNAL
        })?;
        self.store.user().update(&user).await?;

        Ok(ChangePasswordResponse {})
    }

    async fn create(
        &self,
        _: &RequestContext,
        rq: CreateUserRequest,
    ) -> Result<CreateUserResponse> {
        let password = self.passwords.hash_password(&rq.password).map_err(|err| {
            tracing::error!(error = %err, "failed to hash password");
            errno::ERR_INTERNAL
        })?;
        let role = if rq.username == ADMIN_USERNAME {
            ROLE_ADMIN
        } else {
            ROLE_USER
        };

        let user = UserM {
            username: rq.username,
            password,
            nickname: rq.nickname.unwrap_or_default(),
            email: rq.email,
            phone: rq.phone,
            ..Default::default()
        };
        let user = with_transaction(&self.store, move |tx| async move {
            let mut user = user;
            tx.user().create(&mut user).await?;
            tx.policy()
                .add(&PolicyRule::grouping(&user.user_id, role))
                .await?;
            Ok::<_, ApiError>(user)
        })
        .await?;

        self.authz.add_grouping(&user.user_id, role).await?;

        tracing::info!(user_id = %user.user_id, username = %user.username, role, "user created");
        Ok(CreateUserResponse {
            user_id: user.user_id,
        })
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        rq: UpdateUserRequest,
    ) -> Result<UpdateUserResponse> {
        let mut user = self
            .store
            .user()
            .get(
                Scope::Owner(&ctx.user_id),
                Where::new().filter("user_id", &rq.user_id),
            )
            .await?;

        if let Some(username) = rq.username {
            user.username = username;
        }
        if let Some(nickname) = rq.nickname {
            user.nickname = nickname;
        }
        if let Some(email) = rq.email {
            user.email = email;
        }
        if let Some(phone) = rq.phone {
            user.phone = phone;
        }
        self.store.user().update(&user).await?;

        Ok(UpdateUserResponse {})
    }

    // Unscoped: only subjects allowed to call DeleteUser get here.
    async fn delete(
        &self,
        _: &RequestContext,
        rq: DeleteUserRequest,
    ) -> Result<DeleteUserResponse> {
        let user_id = rq.user_id;
        with_transaction(&self.store, |tx| {
            let user_id = user_id.clone();
            async move {
                tx.user()
                    .delete(Scope::All, Where::new().filter("user_id", &user_id))
                    .await?;
                tx.policy().remove_subject(&user_id).await?;
                Ok::<_, ApiError>(())
            }
        })
        .await?;

        self.authz.remove_subject(&user_id).await?;

        Ok(DeleteUserResponse {})
    }

    async fn get(&self, ctx: &RequestContext, rq: GetUserRequest) -> Result<GetUserResponse> {
        let user = self
            .store
            .user()
            .get(
                Scope::Owner(&ctx.user_id),
                Where::new().filter("user_id", &rq.user_id),
            )
            .await?;
        let count = count_posts(self.store.as_ref(), &user.user_id).await?;

        Ok(GetUserResponse {
            user: Some(user.into_proto(count)),
        })
    }

    async fn list(&self, ctx: &RequestContext, rq: ListUserRequest) -> Result<ListUserResponse> {
        let (total_count, users) = self.page(ctx, &rq).await?;
        if users.is_empty() {
            return Ok(ListUserResponse {
                total_count,
                users: Vec::new(),
            });
        }

        let cancel = ctx.cancellation.child_token();
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENCY));
        let results: Arc<DashMap<i64, User>> = Arc::new(DashMap::with_capacity(users.len()));
        let mut tasks = JoinSet::new();

        for user in users.iter().cloned() {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| errno::ERR_INTERNAL)?;
                if cancel.is_cancelled() {
                    return Ok(());
                }

                let count = count_posts(store.as_ref(), &user.user_id).await?;
                results.insert(user.id, user.into_proto(count));
                Ok::<_, ApiError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|err| {
                    tracing::error!(error = %err, "post count task panicked");
                    errno::ERR_INTERNAL
                })
                .and_then(|outcome| outcome);

            if let Err(err) = outcome {
                cancel.cancel();
                tasks.abort_all();
                tracing::error!(error = %err, "failed to count posts of listed users");
                return Err(err);
            }
        }

        let mut out = Vec::with_capacity(users.len());
        for user in &users {
            match results.remove(&user.id) {
                Some((_, user)) => out.push(user),
                None => return Err(errno::ERR_REQUEST_CANCELED),
            }
        }

        Ok(ListUserResponse {
            total_count,
            users: out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Argon2;
    use crate::model::PostM;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::Recorder;

    async fn service() -> (Arc<dyn IStore>, UserService) {
        let memory = Arc::new(MemoryStore::with_default_policies());
        let authz = Arc::new(Authorizer::new(memory.clone()).await.unwrap());
        let passwords = PasswordManager::new(Some(Argon2 {
            memory_cost: 8,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap();

        let store: Arc<dyn IStore> = memory;
        let service = UserService::new(
            Arc::clone(&store),
            TokenManager::default(),
            authz,
            passwords,
        );
        (store, service)
    }

    fn create_request(username: &str, phone: &str) -> CreateUserRequest {
        CreateUserRequest {
            username: username.into(),
            password: "miniblog1234".into(),
            nickname: None,
            email: format!("{username}@miniblog.dev"),
            phone: phone.into(),
        }
    }

    fn ctx(user_id: &str, username: &str) -> RequestContext {
        RequestContext::new("rid").with_user(user_id, username)
    }

    async fn login(service: &UserService, username: &str, password: &str) -> Result<LoginResponse> {
        service
            .login(&RequestContext::default(), LoginRequest {
                username: username.into(),
                password: password.into(),
            })
            .await
    }

    // Rows are written straight to the store, skipping password hashing.
    async fn seed(store: &Arc<dyn IStore>, users: usize) -> Vec<UserM> {
        let mut seeded = Vec::with_capacity(users);
        for i in 0..users {
            let mut user = UserM {
                username: format!("user_{i}"),
                password: "hash".into(),
                phone: format!("138{i:08}"),
                ..Default::default()
            };
            store.user().create(&mut user).await.unwrap();

            for j in 0..(i % 4) {
                let mut post = PostM {
                    user_id: user.user_id.clone(),
                    title: format!("post {j}"),
                    ..Default::default()
                };
                store.post().create(&mut post).await.unwrap();
            }
            seeded.push(user);
        }
        seeded
    }

    #[tokio::test]
    async fn test_login_token_resolves_to_user() {
        let (_, service) = service().await;
        let created = service
            .create(&RequestContext::default(), create_request("bob", "13800000001"))
            .await
            .unwrap();

        let resp = login(&service, "bob", "miniblog1234").await.unwrap();
        assert_eq!(service.tokens.parse(&resp.token).unwrap(), created.user_id);

        let err = login(&service, "bob", "wrong1234").await.unwrap_err();
        assert!(err.is(&errno::ERR_PASSWORD_INVALID));

        let err = login(&service, "nobody", "miniblog1234").await.unwrap_err();
        assert!(err.is(&errno::ERR_USER_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_create_assigns_roles() {
        let (store, service) = service().await;
        let root = service
            .create(&RequestContext::default(), create_request("root", "13800000001"))
            .await
            .unwrap();
        let bob = service
            .create(&RequestContext::default(), create_request("bob", "13800000002"))
            .await
            .unwrap();

        assert!(service.authz.has_role(&root.user_id, ROLE_ADMIN).await);
        assert!(service.authz.has_role(&bob.user_id, ROLE_USER).await);
        assert!(!service.authz.has_role(&bob.user_id, ROLE_ADMIN).await);

        let rules = store.policy().load().await.unwrap();
        assert!(rules.contains(&PolicyRule::grouping(&bob.user_id, ROLE_USER)));
    }

    #[tokio::test]
    async fn test_duplicate_user_leaves_no_grouping() {
        let (store, service) = service().await;
        service
            .create(&RequestContext::default(), create_request("bob", "13800000001"))
            .await
            .unwrap();
        let before = store.policy().load().await.unwrap().len();

        let err = service
            .create(&RequestContext::default(), create_request("bob", "13800000002"))
            .await
            .unwrap_err();
        assert!(err.is(&errno::ERR_USER_ALREADY_EXISTS));
        assert_eq!(store.policy().load().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (store, service) = service().await;
        let bob = service
            .create(&RequestContext::default(), create_request("bob", "13800000001"))
            .await
            .unwrap();
        let bob_ctx = ctx(&bob.user_id, "bob");
        let stored_hash = |store: Arc<dyn IStore>, user_id: String| async move {
            store
                .user()
                .get(Scope::All, Where::new().filter("user_id", user_id))
                .await
                .unwrap()
                .password
        };
        let before = stored_hash(Arc::clone(&store), bob.user_id.clone()).await;

        let err = service
            .change_password(&bob_ctx, ChangePasswordRequest {
                user_id: bob.user_id.clone(),
                old_password: "not-the-password1".into(),
                new_password: "brandnew1234".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is(&errno::ERR_PASSWORD_INVALID));
        assert_eq!(stored_hash(Arc::clone(&store), bob.user_id.clone()).await, before);

        service
            .change_password(&bob_ctx, ChangePasswordRequest {
                user_id: bob.user_id.clone(),
                old_password: "miniblog1234".into(),
                new_password: "brandnew1234".into(),
            })
            .await
            .unwrap();

        assert!(login(&service, "bob", "miniblog1234").await.is_err());
        assert!(login(&service, "bob", "brandnew1234").await.is_ok());
    }

    #[tokio::test]
    async fn test_fan_out_matches_sequential() {
        for users in [0, 1, 15] {
            let (store, service) = service().await;
            seed(&store, users).await;

            let root = ctx("user-root", ADMIN_USERNAME);
            let rq = ListUserRequest {
                offset: 0,
                limit: 100,
            };
            let concurrent = service.list(&root, rq.clone()).await.unwrap();
            let sequential = service.list_sequential(&root, rq).await.unwrap();

            assert_eq!(concurrent.total_count, users as i64);
            assert_eq!(concurrent, sequential);
        }
    }

    #[tokio::test]
    async fn test_fan_out_counts_per_user() {
        let (store, service) = service().await;
        let seeded = seed(&store, 6).await;

        let resp = service
            .list(&ctx("user-root", ADMIN_USERNAME), ListUserRequest {
                offset: 0,
                limit: 100,
            })
            .await
            .unwrap();

        // Newest first.
        let expected: Vec<(String, i64)> = seeded
            .iter()
            .enumerate()
            .rev()
            .map(|(i, user)| (user.user_id.clone(), (i % 4) as i64))
            .collect();
        let got: Vec<(String, i64)> = resp
            .users
            .into_iter()
            .map(|user| (user.user_id, user.post_count))
            .collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_fan_out_fails_when_one_count_fails() {
        let (store, service) = service().await;
        let seeded = seed(&store, 8).await;

        let broken: Arc<dyn IStore> =
            Arc::new(Recorder::with_broken_owner(store, &seeded[5].user_id));
        let service = UserService::new(
            broken,
            service.tokens.clone(),
            Arc::clone(&service.authz),
            service.passwords.clone(),
        );

        let err = service
            .list(&ctx("user-root", ADMIN_USERNAME), ListUserRequest {
                offset: 0,
                limit: 100,
            })
            .await
            .unwrap_err();
        assert!(err.is(&errno::ERR_DB_READ));
    }

    #[tokio::test]
    async fn test_list_is_scoped_for_regular_users() {
        let (store, service) = service().await;
        let seeded = seed(&store, 3).await;
        let first = &seeded[0];

        let resp = service
            .list(&ctx(&first.user_id, &first.username), ListUserRequest {
                offset: 0,
                limit: 100,
            })
            .await
            .unwrap();
        assert_eq!(resp.total_count, 1);
        assert_eq!(resp.users[0].user_id, first.user_id);
    }

    #[tokio::test]
    async fn test_cancelled_fan_out() {
        let (store, service) = service().await;
        seed(&store, 3).await;

        let root = ctx("user-root", ADMIN_USERNAME);
        root.cancellation.cancel();
        let err = service
            .list(&root, ListUserRequest {
                offset: 0,
                limit: 100,
            })
            .await
            .unwrap_err();
        assert!(err.is(&errno::ERR_REQUEST_CANCELED));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, service) = service().await;
        let bob = service
            .create(&RequestContext::default(), create_request("bob", "13800000001"))
            .await
            .unwrap();
        let root = ctx("user-root", ADMIN_USERNAME);

        for _ in 0..2 {
            service
                .delete(&root, DeleteUserRequest {
                    user_id: bob.user_id.clone(),
                })
                .await
                .unwrap();
        }
        assert!(!service.authz.has_role(&bob.user_id, ROLE_USER).await);
        assert!(login(&service, "bob", "miniblog1234").await.is_err());
    }

    #[tokio::test]
    async fn test_get_and_update_are_scoped() {
        let (_, service) = service().await;
        let bob = service
            .create(&RequestContext::default(), create_request("bob", "13800000001"))
            .await
            .unwrap();
        let eve = service
            .create(&RequestContext::default(), create_request("eve", "13800000002"))
            .await
            .unwrap();
        let eve_ctx = ctx(&eve.user_id, "eve");

        let err = service
            .get(&eve_ctx, GetUserRequest {
                user_id: bob.user_id.clone(),
            })
            .await
            .unwrap_err();
        assert!(err.is(&errno::ERR_USER_NOT_FOUND));

        service
            .update(&eve_ctx, UpdateUserRequest {
                user_id: eve.user_id.clone(),
                nickname: Some("evie".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let user = service
            .get(&eve_ctx, GetUserRequest {
                user_id: eve.user_id.clone(),
            })
            .await
            .unwrap()
            .user
            .unwrap();
        assert_eq!(user.nickname, "evie");
        assert_eq!(user.post_count, 0);
    }
}
