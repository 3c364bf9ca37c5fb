//! MySQL store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::mysql::{MySqlPoolOptions, MySqlQueryResult, MySqlRow};
use sqlx::{FromRow, MySql, MySqlPool, QueryBuilder, Transaction};
use tokio::sync::Mutex;

use crate::error::{ApiError, Result};
use crate::model::{PolicyRule, PostM, UserM};
use crate::rid;
use crate::store::query::{Condition, Value};
use crate::store::{IStore, PolicyStore, PostStore, Scope, UserStore, Where};
use crate::{errno, rid::ResourceId};

const USER_COLUMNS: &str = "id, COALESCE(user_id, '') AS user_id, username, password, \
     nickname, email, phone, created_at, updated_at";
const POST_COLUMNS: &str =
    "id, COALESCE(post_id, '') AS post_id, user_id, title, content, created_at, updated_at";
const RULE_COLUMNS: &str = "ptype, COALESCE(v0, '') AS v0, COALESCE(v1, '') AS v1, \
     COALESCE(v2, '') AS v2, COALESCE(v3, '') AS v3, COALESCE(v4, '') AS v4, \
     COALESCE(v5, '') AS v5";

/// Where queries run: the shared pool or a running transaction.
#[derive(Clone)]
enum Conn {
    Pool(MySqlPool),
    Tx(Arc<Mutex<Option<Transaction<'static, MySql>>>>),
}

/// MySQL implementation of [`IStore`].
#[derive(Clone)]
pub struct MysqlStore {
    conn: Conn,
    owner: bool,
}

/// Connection options of [`MysqlStore::connect`].
#[derive(Clone, Debug)]
pub struct MysqlOptions {
    pub address: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl MysqlStore {
    /// Connect a pool to MySQL.
    pub async fn connect(options: &MysqlOptions) -> std::result::Result<Self, sqlx::Error> {
        let pool = MySqlPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .max_lifetime(options.max_lifetime)
            .connect(&format!(
                "mysql://{}:{}@{}/{}",
                options.username, options.password, options.address, options.database
            ))
            .await?;

        tracing::info!(address = %options.address, database = %options.database, "mysql connected");

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self {
            conn: Conn::Pool(pool),
            owner: false,
        }
    }

    /// Pool behind this store, `None` inside a transaction.
    pub fn pool(&self) -> Option<&MySqlPool> {
        match &self.conn {
            Conn::Pool(pool) => Some(pool),
            Conn::Tx(_) => None,
        }
    }

    async fn execute(&self, mut qb: QueryBuilder<'_, MySql>) -> sqlx::Result<MySqlQueryResult> {
        let query = qb.build();
        match &self.conn {
            Conn::Pool(pool) => query.execute(pool).await,
            Conn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
                query.execute(&mut **tx).await
            },
        }
    }

    async fn fetch_all<T>(&self, mut qb: QueryBuilder<'_, MySql>) -> sqlx::Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
    {
        let query = qb.build_query_as::<T>();
        match &self.conn {
            Conn::Pool(pool) => query.fetch_all(pool).await,
            Conn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
                query.fetch_all(&mut **tx).await
            },
        }
    }

    async fn fetch_optional<T>(&self, mut qb: QueryBuilder<'_, MySql>) -> sqlx::Result<Option<T>>
    where
        T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
    {
        let query = qb.build_query_as::<T>();
        match &self.conn {
            Conn::Pool(pool) => query.fetch_optional(pool).await,
            Conn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
                query.fetch_optional(&mut **tx).await
            },
        }
    }

    async fn count(&self, mut qb: QueryBuilder<'_, MySql>) -> sqlx::Result<i64> {
        let query = qb.build_query_scalar::<i64>();
        match &self.conn {
            Conn::Pool(pool) => query.fetch_one(pool).await,
            Conn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
                query.fetch_one(&mut **tx).await
            },
        }
    }

    /// Insert, then write back the identifier derived from the row id.
    async fn insert_with_rid(
        &self,
        qb: QueryBuilder<'_, MySql>,
        table: &str,
        column: &str,
        resource: ResourceId,
    ) -> sqlx::Result<(i64, String)> {
        let id = self.execute(qb).await?.last_insert_id();
        let derived = resource.new(id);

        let mut update = QueryBuilder::new(format!("UPDATE `{table}` SET {column} = "));
        update.push_bind(derived.clone());
        update.push(" WHERE id = ");
        update.push_bind(id as i64);
        self.execute(update).await?;

        Ok((id as i64, derived))
    }
}

fn push_where(qb: &mut QueryBuilder<'_, MySql>, whr: &Where) {
    let conditions = whr.conditions();
    if conditions.is_empty() {
        return;
    }

    qb.push(" WHERE ");
    for (i, condition) in conditions.into_iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        match condition {
            Condition::Eq(column, value) => {
                qb.push(column).push(" = ");
                push_value(qb, value);
            },
            Condition::In(_, values) if values.is_empty() => {
                qb.push("1 = 0");
            },
            Condition::In(column, values) => {
                qb.push(column).push(" IN (");
                {
                    let mut separated = qb.separated(", ");
                    for value in values {
                        match value {
                            Value::Str(value) => separated.push_bind(value),
                            Value::Int(value) => separated.push_bind(value),
                        };
                    }
                }
                qb.push(")");
            },
            Condition::Contains(column, needle) => {
                qb.push(column).push(" LIKE ");
                qb.push_bind(format!("%{}%", escape_like(&needle)));
            },
        }
    }
}

fn push_value(qb: &mut QueryBuilder<'_, MySql>, value: Value) {
    match value {
        Value::Str(value) => qb.push_bind(value),
        Value::Int(value) => qb.push_bind(value),
    };
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_page(qb: &mut QueryBuilder<'_, MySql>, whr: &Where) {
    qb.push(" ORDER BY id DESC");
    if let Some(limit) = whr.limit() {
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(whr.offset());
    } else if whr.offset() > 0 {
        // MySQL needs a LIMIT to apply an OFFSET.
        qb.push(" LIMIT 18446744073709551615 OFFSET ").push_bind(whr.offset());
    }
}

fn select<'a>(columns: &str, table: &str, whr: &Where) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(format!("SELECT {columns} FROM `{table}`"));
    push_where(&mut qb, whr);
    qb
}

fn read_error(err: sqlx::Error) -> ApiError {
    tracing::error!(error = %err, "database read failed");
    errno::ERR_DB_READ
}

fn write_error(err: sqlx::Error, duplicate: ApiError) -> ApiError {
    if err
        .as_database_error()
        .is_some_and(|e| e.is_unique_violation())
    {
        return duplicate;
    }
    tracing::error!(error = %err, "database write failed");
    errno::ERR_DB_WRITE
}

#[async_trait]
impl IStore for MysqlStore {
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
        match &self.conn {
            Conn::Pool(pool) => {
                let tx = pool.begin().await.map_err(|err| {
                    tracing::error!(error = %err, "failed to begin transaction");
                    errno::ERR_DB_WRITE
                })?;
                Ok(Arc::new(Self {
                    conn: Conn::Tx(Arc::new(Mutex::new(Some(tx)))),
                    owner: true,
                }))
            },
            Conn::Tx(_) => Ok(Arc::new(Self {
                conn: self.conn.clone(),
                owner: false,
            })),
        }
    }

    async fn commit(&self) -> Result<()> {
        if let (true, Conn::Tx(tx)) = (self.owner, &self.conn) {
            if let Some(tx) = tx.lock().await.take() {
                tx.commit().await.map_err(|err| write_error(err, errno::ERR_DB_WRITE))?;
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if let (true, Conn::Tx(tx)) = (self.owner, &self.conn) {
            if let Some(tx) = tx.lock().await.take() {
                tx.rollback().await.map_err(|err| write_error(err, errno::ERR_DB_WRITE))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MysqlStore {
    async fn create(&self, user: &mut UserM) -> Result<()> {
        let now = Utc::now().trunc_subsecs(0);
        let mut qb = QueryBuilder::new(
            "INSERT INTO `user` (username, password, nickname, email, phone, created_at, updated_at) ",
        );
        qb.push_values([&*user], |mut row, user| {
            row.push_bind(user.username.clone())
                .push_bind(user.password.clone())
                .push_bind(user.nickname.clone())
                .push_bind(user.email.clone())
                .push_bind(user.phone.clone())
                .push_bind(now)
                .push_bind(now);
        });

        let (id, user_id) = self
            .insert_with_rid(qb, "user", "user_id", rid::USER)
            .await
            .map_err(|err| write_error(err, errno::ERR_USER_ALREADY_EXISTS))?;

        user.id = id;
        user.user_id = user_id;
        user.created_at = now;
        user.updated_at = now;
        Ok(())
    }

    async fn update(&self, user: &UserM) -> Result<()> {
        let mut qb = QueryBuilder::new("UPDATE `user` SET username = ");
        qb.push_bind(user.username.clone())
            .push(", password = ")
            .push_bind(user.password.clone())
            .push(", nickname = ")
            .push_bind(user.nickname.clone())
            .push(", email = ")
            .push_bind(user.email.clone())
            .push(", phone = ")
            .push_bind(user.phone.clone())
            .push(", updated_at = ")
            .push_bind(Utc::now().trunc_subsecs(0))
            .push(" WHERE id = ")
            .push_bind(user.id);

        self.execute(qb)
            .await
            .map_err(|err| write_error(err, errno::ERR_USER_ALREADY_EXISTS))?;
        Ok(())
    }

    async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()> {
        let mut qb = QueryBuilder::new("DELETE FROM `user`");
        push_where(&mut qb, &whr.scoped(scope));
        self.execute(qb)
            .await
            .map_err(|err| write_error(err, errno::ERR_DB_WRITE))?;
        Ok(())
    }

    async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<UserM> {
        let mut qb = select(USER_COLUMNS, "user", &whr.scoped(scope));
        qb.push(" LIMIT 1");
        self.fetch_optional::<UserM>(qb)
            .await
            .map_err(read_error)?
            .ok_or(errno::ERR_USER_NOT_FOUND)
    }

    async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<UserM>)> {
        let whr = whr.scoped(scope);
        let count = self
            .count(select("COUNT(*)", "user", &whr))
            .await
            .map_err(read_error)?;

        let mut qb = select(USER_COLUMNS, "user", &whr);
        push_page(&mut qb, &whr);
        let users = self.fetch_all::<UserM>(qb).await.map_err(read_error)?;

        Ok((count, users))
    }
}

#[async_trait]
impl PostStore for MysqlStore {
    async fn create(&self, post: &mut PostM) -> Result<()> {
        let now = Utc::now().trunc_subsecs(0);
        let mut qb = QueryBuilder::new(
            "INSERT INTO `post` (user_id, title, content, created_at, updated_at) ",
        );
        qb.push_values([&*post], |mut row, post| {
            row.push_bind(post.user_id.clone())
                .push_bind(post.title.clone())
                .push_bind(post.content.clone())
                .push_bind(now)
                .push_bind(now);
        });

        let (id, post_id) = self
            .insert_with_rid(qb, "post", "post_id", rid::POST)
            .await
            .map_err(|err| write_error(err, errno::ERR_POST_ALREADY_EXISTS))?;

        post.id = id;
        post.post_id = post_id;
        post.created_at = now;
        post.updated_at = now;
        Ok(())
    }

    async fn update(&self, post: &PostM) -> Result<()> {
        let mut qb = QueryBuilder::new("UPDATE `post` SET title = ");
        qb.push_bind(post.title.clone())
            .push(", content = ")
            .push_bind(post.content.clone())
            .push(", updated_at = ")
            .push_bind(Utc::now().trunc_subsecs(0))
            .push(" WHERE id = ")
            .push_bind(post.id);

        self.execute(qb)
            .await
            .map_err(|err| write_error(err, errno::ERR_POST_ALREADY_EXISTS))?;
        Ok(())
    }

    async fn delete(&self, scope: Scope<'_>, whr: Where) -> Result<()> {
        let mut qb = QueryBuilder::new("DELETE FROM `post`");
        push_where(&mut qb, &whr.scoped(scope));
        self.execute(qb)
            .await
            .map_err(|err| write_error(err, errno::ERR_DB_WRITE))?;
        Ok(())
    }

    async fn get(&self, scope: Scope<'_>, whr: Where) -> Result<PostM> {
        let mut qb = select(POST_COLUMNS, "post", &whr.scoped(scope));
        qb.push(" LIMIT 1");
        self.fetch_optional::<PostM>(qb)
            .await
            .map_err(read_error)?
            .ok_or(errno::ERR_POST_NOT_FOUND)
    }

    async fn list(&self, scope: Scope<'_>, whr: Where) -> Result<(i64, Vec<PostM>)> {
        let whr = whr.scoped(scope);
        let count = self
            .count(select("COUNT(*)", "post", &whr))
            .await
            .map_err(read_error)?;

        let mut qb = select(POST_COLUMNS, "post", &whr);
        push_page(&mut qb, &whr);
        let posts = self.fetch_all::<PostM>(qb).await.map_err(read_error)?;

        Ok((count, posts))
    }
}

#[async_trait]
impl PolicyStore for MysqlStore {
    async fn load(&self) -> Result<Vec<PolicyRule>> {
        let qb = QueryBuilder::new(format!("SELECT {RULE_COLUMNS} FROM `casbin_rule`"));
        self.fetch_all::<PolicyRule>(qb).await.map_err(read_error)
    }

    async fn add(&self, rule: &PolicyRule) -> Result<()> {
        let mut qb = QueryBuilder::new(
            "INSERT IGNORE INTO `casbin_rule` (ptype, v0, v1, v2, v3, v4, v5) ",
        );
        qb.push_values([rule], |mut row, rule| {
            row.push_bind(rule.ptype.clone())
                .push_bind(rule.v0.clone())
                .push_bind(rule.v1.clone())
                .push_bind(rule.v2.clone())
                .push_bind(rule.v3.clone())
                .push_bind(rule.v4.clone())
                .push_bind(rule.v5.clone());
        });

        self.execute(qb)
            .await
            .map_err(|err| write_error(err, errno::ERR_DB_WRITE))?;
        Ok(())
    }

    async fn remove_subject(&self, subject: &str) -> Result<()> {
        let mut qb = QueryBuilder::new("DELETE FROM `casbin_rule` WHERE ptype = 'g' AND v0 = ");
        qb.push_bind(subject.to_owned());
        self.execute(qb)
            .await
            .map_err(|err| write_error(err, errno::ERR_DB_WRITE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_renders_placeholders() {
        let whr = Where::new()
            .filter("post_id", "post-aaaaaa")
            .filter_in("post_id", ["a", "b"])
            .contains("title", "50%")
            .scoped(Scope::Owner("user-bob"));

        let mut qb = select(POST_COLUMNS, "post", &whr);
        push_page(&mut qb, &whr.clone().paginate(10, 5));

        let sql = qb.sql();
        assert!(sql.ends_with(
            "WHERE post_id = ? AND post_id IN (?, ?) AND title LIKE ? AND user_id = ? ORDER BY id DESC LIMIT ? OFFSET ?"
        ));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let whr = Where::new().filter_in("post_id", Vec::<String>::new());
        let qb = select("COUNT(*)", "post", &whr);
        assert!(qb.sql().ends_with("WHERE 1 = 0"));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    /// Needs a live server: skipped unless `DATABASE_URL` is set.
    #[tokio::test]
    async fn test_mysql_round_trip() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = MySqlPool::connect(&url).await.unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();
        let store: Arc<dyn IStore> = Arc::new(MysqlStore::from_pool(pool));

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut user = UserM {
            username: format!("mysql_{}", &suffix[..12]),
            password: "hash".into(),
            email: "mysql@miniblog.dev".into(),
            phone: suffix[..11].to_owned(),
            ..Default::default()
        };
        store.user().create(&mut user).await.unwrap();
        assert!(user.id > 0);
        assert!(user.user_id.starts_with("user-"));

        let found = store
            .user()
            .get(Scope::All, Where::new().filter("user_id", &user.user_id))
            .await
            .unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.username, user.username);

        let mut post = PostM {
            user_id: user.user_id.clone(),
            title: "hello mysql".into(),
            content: "content".into(),
            ..Default::default()
        };
        store.post().create(&mut post).await.unwrap();
        let (total, posts) = store
            .post()
            .list(Scope::Owner(&user.user_id), Where::new())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(posts[0].post_id, post.post_id);

        // Rolled back writes leave nothing behind.
        let tx = store.begin().await.unwrap();
        let mut ghost = PostM {
            user_id: user.user_id.clone(),
            title: "rolled back".into(),
            content: "content".into(),
            ..Default::default()
        };
        tx.post().create(&mut ghost).await.unwrap();
        tx.rollback().await.unwrap();
        let (total, _) = store
            .post()
            .list(Scope::Owner(&user.user_id), Where::new())
            .await
            .unwrap();
        assert_eq!(total, 1);

        store
            .post()
            .delete(Scope::Owner(&user.user_id), Where::new())
            .await
            .unwrap();
        store
            .user()
            .delete(Scope::All, Where::new().filter("user_id", &user.user_id))
            .await
            .unwrap();
    }
}
