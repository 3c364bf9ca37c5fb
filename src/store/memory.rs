//! In-process store, used in development and tests.
//!
//! A transaction snapshots every table on `begin` and restores the snapshot
//! on `rollback`. It holds the writer lock until it ends, so writes made
//! outside of it wait instead of being lost on rollback. Reads never wait.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedMutexGuard};

use crate::authz::default_policies;
use crate::errno;
use crate::error::Result;
use crate::model::{PolicyRule, PostM, UserM};
use crate::rid;
use crate::store::query::Record;
use crate::store::{IStore, PolicyStore, PostStore, Scope, UserStore, Where};

#[derive(Clone, Debug, Default)]
struct Tables {
    users: Vec<UserM>,
    posts: Vec<PostM>,
    rules: Vec<PolicyRule>,
    user_sequence: i64,
    post_sequence: i64,
}

/// Running transaction: tables as they were on `begin`.
struct Pending {
    saved: Tables,
    _writer: OwnedMutexGuard<()>,
}

/// In-memory implementation of [`IStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    writer: Arc<AsyncMutex<()>>,
    tx: Option<Arc<Mutex<Option<Pending>>>>,
    owner: bool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the default authorization rules.
    pub fn with_default_policies() -> Self {
        let store = Self::new();
        if let Ok(mut tables) = store.tables.lock() {
            tables.rules = default_policies();
        }
        store
    }

    fn in_transaction(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| {
            tx.lock()
                .map(|pending| pending.is_some())
                .unwrap_or(false)
        })
    }

    /// Writer lock for a write issued outside of a running transaction.
    async fn exclusive(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        if self.in_transaction() {
            None
        } else {
            Some(self.writer.lock().await)
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| {
            tracing::error!("memory store mutex poisoned");
            errno::ERR_INTERNAL
        })
    }
}

fn sorted_page<T: Clone + Record>(rows: &[T], whr: &Where) -> (i64, Vec<T>) {
    let mut matched: Vec<T> = rows.iter().filter(|row| whr.matches(*row)).cloned().collect();
    matched.sort_by_key(|row| match row.column("id") {
        Some(crate::store::query::Value::Int(id)) => std::cmp::Reverse(id),
        _ => std::cmp::Reverse(0),
    });

    (matched.len() as i64, whr.page(matched))
}

#[async_trait]
impl IStore for MemoryStore {
    fn user(&self) -> &dyn UserStore {
        self
    }

    fn post(&self) -> &dyn PostStore {
        self
    }

    fn policy(&self) -> &dyn PolicyStore {
        self
    }

    async fn begin(&self) -> Result<Arc<dyn IStore>> {
        if self.tx.is_some() {
            return Ok(Arc::new(Self {
                owner: false,
                ..self.clone()
            }));
        }

        let writer = Arc::clone(&self.writer).lock_owned().await;
        let saved = self.lock()?.clone();
        Ok(Arc::new(Self {
            tables: Arc::clone(&self.tables),
            writer: Arc::clone(&self.writer),
            tx: Some(Arc::new(Mutex::new(Some(Pending {
                saved,
                _writer: writer,
            })))),
            owner: true,
        }))
    }

    async fn commit(&self) -> Result<()> {
        if let (true, Some(tx)) = (self.owner, &self.tx) {
            if let Ok(mut pending) = tx.lock() {
                pending.take();
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if let (true, Some(tx)) = (self.owner, &self.tx) {
            let pending = tx.lock().ok().and_then(|mut pending| pending.take());
            // The writer lock is released only once the tables are restored.
            if let Some(pending) = pending {
                *self.lock()? = pending.saved;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create(&self, user: &mut UserM) -> Result<()> {
        let _writer = self.exclusive().await;
        let mut tables = self.lock()?;
        if tables
            .users
            .iter()
            .any(|u| u.username == user.username || (!user.phone.is_empty() && u.phone == user.phone))
        {
            return Err(errno::ERR_USER_ALREADY_EXISTS);
        }

        tables.user_sequence += 1;
        let now = Utc::now().trunc_subsecs(0);
        user.id = tables.user_sequence;
        user.user_id = rid::USER.new(user.id as u64);
        user.created_at = now;
        user.updated_at = now;
        tables.users.push(user.clone());

        Ok(())
    }

    async fn update(&self, user: &UserM) -> Result<()> {
        let _writer = self.exclusive().await;
        let mut tables = self.lock()?;
        if tables.users.iter().any(|u| {
            u.id != user.id
                && (u.username == user.username || (!user.phone.is_empty() && u.phone == user.phone))
        }) {
            return Err(errno::ERR_USER_ALREADY_EXISTS);
        }

        if let Some(row) = tables.users.iter_mut().find(|u| u.id == user.id) {
            *row = UserM {
                updated_at: Utc::now().trunc_subsecs(0),
                ..user.clone()
            };
        }
        Ok(())
    }

    async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()> {
        let whr = whr.scoped(scope);
        let _writer = self.exclusive().await;
        self.lock()?.users.retain(|u| !whr.matches(u));
        Ok(())
    }

    async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<UserM> {
        let whr = whr.scoped(scope);
        self.lock()?
            .users
            .iter()
            .find(|u| whr.matches(*u))
            .cloned()
            .ok_or(errno::ERR_USER_NOT_FOUND)
    }

    async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<UserM>)> {
        let whr = whr.scoped(scope);
        Ok(sorted_page(&self.lock()?.users, &whr))
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn create(&self, post: &mut PostM) -> Result<()> {
        let _writer = self.exclusive().await;
        let mut tables = self.lock()?;

        tables.post_sequence += 1;
        let now = Utc::now().trunc_subsecs(0);
        post.id = tables.post_sequence;
        post.post_id = rid::POST.new(post.id as u64);
        post.created_at = now;
        post.updated_at = now;

        if tables.posts.iter().any(|p| p.post_id == post.post_id) {
            return Err(errno::ERR_POST_ALREADY_EXISTS);
        }
        tables.posts.push(post.clone());

        Ok(())
    }

    async fn update(&self, post: &PostM) -> Result<()> {
        let _writer = self.exclusive().await;
        let mut tables = self.lock()?;
        if let Some(row) = tables.posts.iter_mut().find(|p| p.id == post.id) {
            *row = PostM {
                updated_at: Utc::now().trunc_subsecs(0),
                ..post.clone()
            };
        }
        Ok(())
    }

    async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()> {
        let whr = whr.scoped(scope);
        let _writer = self.exclusive().await;
        self.lock()?.posts.retain(|p| !whr.matches(p));
        Ok(())
    }

    async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<PostM> {
        let whr = whr.scoped(scope);
        self.lock()?
            .posts
            .iter()
            .find(|p| whr.matches(*p))
            .cloned()
            .ok_or(errno::ERR_POST_NOT_FOUND)
    }

    async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<PostM>)> {
        let whr = whr.scoped(scope);
        Ok(sorted_page(&self.lock()?.posts, &whr))
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn load(&self) -> Result<Vec<PolicyRule>> {
        Ok(self.lock()?.rules.clone())
    }

    async fn add(&self, rule: &PolicyRule) -> Result<()> {
        let _writer = self.exclusive().await;
        let mut tables = self.lock()?;
        if !tables.rules.contains(rule) {
            tables.rules.push(rule.clone());
        }
        Ok(())
    }

    async fn remove_subject(&self, subject: &str) -> Result<()> {
        let _writer = self.exclusive().await;
        self.lock()?
            .rules
            .retain(|rule| !(rule.ptype == "g" && rule.v0 == subject));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(user_id: &str, title: &str) -> PostM {
        PostM {
            user_id: user_id.into(),
            title: title.into(),
            content: "content".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids() {
        let store = MemoryStore::new();
        let mut first = post("user-bob", "first");
        let mut second = post("user-bob", "second");
        PostStore::create(&store, &mut first).await.unwrap();
        PostStore::create(&store, &mut second).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(first.post_id.starts_with("post-"));
        assert_ne!(first.post_id, second.post_id);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_counts_everything() {
        let store = MemoryStore::new();
        for i in 0..5 {
            PostStore::create(&store, &mut post("user-bob", &format!("post {i}")))
                .await
                .unwrap();
        }
        PostStore::create(&store, &mut post("user-eve", "other")).await.unwrap();

        let (count, posts) = PostStore::list(
            &store,
            Scope::Owner("user-bob"),
            Where::new().paginate(0, 2),
        )
        .await
        .unwrap();
        assert_eq!(count, 5);
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].title, "post 4");
    }

    #[tokio::test]
    async fn test_get_other_owner_is_not_found() {
        let store = MemoryStore::new();
        let mut theirs = post("user-eve", "secret");
        PostStore::create(&store, &mut theirs).await.unwrap();

        let err = PostStore::get(
            &store,
            Scope::Owner("user-bob"),
            Where::new().filter("post_id", theirs.post_id.as_str()),
        )
        .await
        .unwrap_err();
        assert!(err.is(&errno::ERR_POST_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let store = MemoryStore::new();
        let mut bob = UserM {
            username: "bob".into(),
            ..Default::default()
        };
        UserStore::create(&store, &mut bob).await.unwrap();

        let mut again = UserM {
            username: "bob".into(),
            ..Default::default()
        };
        let err = UserStore::create(&store, &mut again).await.unwrap_err();
        assert!(err.is(&errno::ERR_USER_ALREADY_EXISTS));
    }

    #[tokio::test]
    async fn test_rollback_keeps_outside_writes() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();
        tx.post().create(&mut post("user-bob", "draft")).await.unwrap();

        let outside = store.clone();
        let writer = tokio::spawn(async move {
            PostStore::create(&outside, &mut post("user-eve", "published")).await
        });
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        tx.rollback().await.unwrap();
        writer.await.unwrap().unwrap();

        let (count, posts) = PostStore::list(&store, Scope::All, Where::new())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(posts[0].title, "published");
    }

    #[tokio::test]
    async fn test_nested_handle_cannot_end_transaction() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();
        let nested = tx.begin().await.unwrap();
        nested.post().create(&mut post("user-bob", "draft")).await.unwrap();
        nested.commit().await.unwrap();

        tx.rollback().await.unwrap();
        let (count, _) = PostStore::list(&store, Scope::All, Where::new())
            .await
            .unwrap();
        assert_eq!(count, 0);

        tx.commit().await.unwrap();
        PostStore::create(&store, &mut post("user-bob", "after")).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_subject() {
        let store = MemoryStore::with_default_policies();
        store.add(&PolicyRule::grouping("user-bob", "role::user")).await.unwrap();
        store.remove_subject("user-bob").await.unwrap();

        let rules = store.load().await.unwrap();
        assert!(!rules.iter().any(|r| r.v0 == "user-bob"));
        assert!(!rules.is_empty());
    }
}
