//! Persistence layer.
//!
//! Every read, update and delete takes an explicit [`Scope`] so the
//! ownership boundary is visible at each call site.

pub mod memory;
pub mod mysql;
pub mod query;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{PolicyRule, PostM, UserM};
pub use query::{Scope, Where};

/// Entry point of the store, optionally bound to a transaction.
#[async_trait]
pub trait IStore: Send + Sync {
    fn user(&self) -> &dyn UserStore;
    fn post(&self) -> &dyn PostStore;
    fn policy(&self) -> &dyn PolicyStore;

    /// Open a transaction. Calling it on a transaction-bound store reuses the
    /// running transaction and returns a handle that cannot end it.
    async fn begin(&self) -> Result<Arc<dyn IStore>>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert `user` then fill its row id and derived `user_id`.
    async fn create(&self, user: &mut UserM) -> Result<()>;
    /// Save every column of `user`.
    async fn update(&self, user: &UserM) -> Result<()>;
    /// Missing rows are not an error.
    async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()>;
    async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<UserM>;
    /// Total ignores pagination. Rows come newest first.
    async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<UserM>)>;
}

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn create(&self, post: &mut PostM) -> Result<()>;
    async fn update(&self, post: &PostM) -> Result<()>;
    async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()>;
    async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<PostM>;
    async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<PostM>)>;
}

/// Rules read by the authorization engine.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn load(&self) -> Result<Vec<PolicyRule>>;
    async fn add(&self, rule: &PolicyRule) -> Result<()>;
    /// Remove every grouping rule of `subject`.
    async fn remove_subject(&self, subject: &str) -> Result<()>;
}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
///
/// Stores created through `f`'s argument share the transaction, so nested
/// calls see each other's writes.
pub async fn with_transaction<T, F, Fut>(store: &Arc<dyn IStore>, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn IStore>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tx = store.begin().await?;

    match f(Arc::clone(&tx)).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        },
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(error = %rollback, "failed to rollback transaction");
            }
            Err(err)
        },
    }
}

/// Store wrappers for business layer tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::errno;

    #[derive(Debug, Default)]
    pub struct Calls {
        pub begin: AtomicUsize,
        pub commit: AtomicUsize,
        pub rollback: AtomicUsize,
    }

    impl Calls {
        pub fn snapshot(&self) -> (usize, usize, usize) {
            (
                self.begin.load(Ordering::SeqCst),
                self.commit.load(Ordering::SeqCst),
                self.rollback.load(Ordering::SeqCst),
            )
        }
    }

    /// Delegates to `inner` and records transaction calls. Listing the posts
    /// of the broken owner fails with a read error.
    pub struct Recorder {
        inner: Arc<dyn IStore>,
        posts: Posts,
        pub calls: Arc<Calls>,
    }

    struct Posts {
        inner: Arc<dyn IStore>,
        broken_owner: Option<String>,
    }

    impl Recorder {
        pub fn new(inner: Arc<dyn IStore>) -> Self {
            Self::wrap(inner, None, Arc::default())
        }

        pub fn with_broken_owner(inner: Arc<dyn IStore>, user_id: &str) -> Self {
            Self::wrap(inner, Some(user_id.to_owned()), Arc::default())
        }

        fn wrap(inner: Arc<dyn IStore>, broken_owner: Option<String>, calls: Arc<Calls>) -> Self {
            Self {
                posts: Posts {
                    inner: Arc::clone(&inner),
                    broken_owner,
                },
                inner,
                calls,
            }
        }
    }

    #[async_trait]
    impl IStore for Recorder {
        fn user(&self) -> &dyn UserStore {
            self.inner.user()
        }

        fn post(&self) -> &dyn PostStore {
            &self.posts
        }

        fn policy(&self) -> &dyn PolicyStore {
            self.inner.policy()
        }

        async fn begin(&self) -> Result<Arc<dyn IStore>> {
            self.calls.begin.fetch_add(1, Ordering::SeqCst);
            let tx = self.inner.begin().await?;
            Ok(Arc::new(Self::wrap(
                tx,
                self.posts.broken_owner.clone(),
                Arc::clone(&self.calls),
            )))
        }

        async fn commit(&self) -> Result<()> {
            self.calls.commit.fetch_add(1, Ordering::SeqCst);
            self.inner.commit().await
        }

        async fn rollback(&self) -> Result<()> {
            self.calls.rollback.fetch_add(1, Ordering::SeqCst);
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl PostStore for Posts {
        async fn create(&self, post: &mut PostM) -> Result<()> {
            self.inner.post().create(post).await
        }

        async fn update(&self, post: &PostM) -> Result<()> {
            self.inner.post().update(post).await
        }

        async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()> {
            self.inner.post().delete(scope, whr).await
        }

        async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<PostM> {
            self.inner.post().get(scope, whr).await
        }

        async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<PostM>)> {
            if let Scope::Owner(owner) = scope {
                if self.broken_owner.as_deref() == Some(owner) {
                    return Err(errno::ERR_DB_READ);
                }
            }
            self.inner.post().list(scope, whr).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno;

    fn user(username: &str, phone: &str) -> UserM {
        UserM {
            username: username.into(),
            phone: phone.into(),
            password: "hash".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_commit_keeps_writes() {
        let store: Arc<dyn IStore> = Arc::new(memory::MemoryStore::new());

        let user_id = with_transaction(&store, |tx| async move {
            let mut bob = user("bob", "13800000001");
            tx.user().create(&mut bob).await?;
            Ok::<_, crate::error::ApiError>(bob.user_id)
        })
        .await
        .unwrap();

        let found = store
            .user()
            .get(Scope::All, Where::new().filter("user_id", user_id.as_str()))
            .await
            .unwrap();
        assert_eq!(found.username, "bob");
    }

    #[tokio::test]
    async fn test_error_rolls_back() {
        let store: Arc<dyn IStore> = Arc::new(memory::MemoryStore::new());

        let result: Result<()> = with_transaction(&store, |tx| async move {
            let mut bob = user("bob", "13800000001");
            tx.user().create(&mut bob).await?;
            Err(errno::ERR_INTERNAL)
        })
        .await;
        assert!(result.is_err());

        let (count, _) = store.user().list(Scope::All, Where::new()).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_nested_transaction_reuses_outer() {
        let store: Arc<dyn IStore> = Arc::new(memory::MemoryStore::new());

        let result: Result<()> = with_transaction(&store, |tx| async move {
            // Inner commit must not end the outer transaction.
            with_transaction(&tx, |inner| async move {
                let mut bob = user("bob", "13800000001");
                inner.user().create(&mut bob).await
            })
            .await?;
            // The outer transaction still owns the write.
            Err(errno::ERR_INTERNAL)
        })
        .await;
        assert!(result.is_err());

        let (count, _) = store.user().list(Scope::All, Where::new()).await.unwrap();
        assert_eq!(count, 0);
    }
}
