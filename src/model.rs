//! Rows as saved on database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// User as saved on database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserM {
    pub id: i64,
    pub user_id: String,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub nickname: String,
    pub email: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Post as saved on database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostM {
    pub id: i64,
    pub post_id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `casbin_rule`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct PolicyRule {
    pub ptype: String,
    pub v0: String,
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub v4: String,
    pub v5: String,
}

impl PolicyRule {
    /// `p, subject, object, action, effect`.
    pub fn policy(subject: &str, object: &str, action: &str, effect: &str) -> Self {
        Self {
            ptype: "p".into(),
            v0: subject.into(),
            v1: object.into(),
            v2: action.into(),
            v3: effect.into(),
            ..Default::default()
        }
    }

    /// `g, user, role`.
    pub fn grouping(user: &str, role: &str) -> Self {
        Self {
            ptype: "g".into(),
            v0: user.into(),
            v1: role.into(),
            ..Default::default()
        }
    }
}

impl UserM {
    pub fn into_proto(self, post_count: i64) -> proto::User {
        proto::User {
            user_id: self.user_id,
            username: self.username,
            nickname: self.nickname,
            email: self.email,
            phone: self.phone,
            post_count,
            created_at: self.created_at.format(TIME_FORMAT).to_string(),
            updated_at: self.updated_at.format(TIME_FORMAT).to_string(),
        }
    }
}

impl From<PostM> for proto::Post {
    fn from(post: PostM) -> Self {
        Self {
            post_id: post.post_id,
            user_id: post.user_id,
            title: post.title,
            content: post.content,
            created_at: post.created_at.format(TIME_FORMAT).to_string(),
            updated_at: post.updated_at.format(TIME_FORMAT).to_string(),
        }
    }
}
