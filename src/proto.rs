//! `v1.MiniBlog` wire types.
//!
//! Messages double as the JSON bodies of the HTTP surface, hence the serde
//! derives next to prost's.

use serde::{Deserialize, Serialize};

/// Generated `MiniBlog` server and client.
pub mod mini_blog {
    include!(concat!(env!("OUT_DIR"), "/v1.MiniBlog.rs"));
}

pub use mini_blog::mini_blog_client::MiniBlogClient;
pub use mini_blog::mini_blog_server::{MiniBlog, MiniBlogServer};

/// gRPC service name, prefix of every full method name.
pub const SERVICE_NAME: &str = "v1.MiniBlog";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServiceStatus {
    Healthy = 0,
    Unhealthy = 1,
}

impl ServiceStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "Healthy",
            ServiceStatus::Unhealthy => "Unhealthy",
        }
    }
}

mod service_status {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ServiceStatus;

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        let status = ServiceStatus::try_from(*value).unwrap_or(ServiceStatus::Unhealthy);
        serializer.serialize_str(status.as_str_name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(match name.as_str() {
            "Healthy" => ServiceStatus::Healthy as i32,
            _ => ServiceStatus::Unhealthy as i32,
        })
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct HealthzRequest {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthzResponse {
    #[prost(enumeration = "ServiceStatus", tag = "1")]
    #[serde(with = "service_status")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub timestamp: String,
    #[prost(string, tag = "3")]
    pub message: String,
}

// Users.

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    #[prost(string, tag = "1")]
    #[serde(rename = "userID")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(string, tag = "3")]
    pub nickname: String,
    #[prost(string, tag = "4")]
    pub email: String,
    #[prost(string, tag = "5")]
    pub phone: String,
    #[prost(int64, tag = "6")]
    pub post_count: i64,
    #[prost(string, tag = "7")]
    pub created_at: String,
    #[prost(string, tag = "8")]
    pub updated_at: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginRequest {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginResponse {
    #[prost(string, tag = "1")]
    pub token: String,
    /// RFC 3339.
    #[prost(string, tag = "2")]
    pub expire_at: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct RefreshTokenRequest {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshTokenResponse {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub expire_at: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangePasswordRequest {
    #[prost(string, tag = "1")]
    #[serde(rename = "userID")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub old_password: String,
    #[prost(string, tag = "3")]
    pub new_password: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ChangePasswordResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateUserRequest {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
    #[prost(string, optional, tag = "3")]
    pub nickname: Option<String>,
    #[prost(string, tag = "4")]
    pub email: String,
    #[prost(string, tag = "5")]
    pub phone: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateUserResponse {
    #[prost(string, tag = "1")]
    #[serde(rename = "userID")]
    pub user_id: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateUserRequest {
    #[prost(string, tag = "1")]
    #[serde(rename = "userID")]
    pub user_id: String,
    #[prost(string, optional, tag = "2")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub nickname: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub email: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub phone: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct UpdateUserResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteUserRequest {
    #[prost(string, tag = "1")]
    #[serde(rename = "userID")]
    pub user_id: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct DeleteUserResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetUserRequest {
    #[prost(string, tag = "1")]
    #[serde(rename = "userID")]
    pub user_id: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetUserResponse {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListUserRequest {
    #[prost(int64, tag = "1")]
    pub offset: i64,
    #[prost(int64, tag = "2")]
    pub limit: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListUserResponse {
    #[prost(int64, tag = "1")]
    pub total_count: i64,
    #[prost(message, repeated, tag = "2")]
    pub users: Vec<User>,
}

// Posts.

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Post {
    #[prost(string, tag = "1")]
    #[serde(rename = "postID")]
    pub post_id: String,
    #[prost(string, tag = "2")]
    #[serde(rename = "userID")]
    pub user_id: String,
    #[prost(string, tag = "3")]
    pub title: String,
    #[prost(string, tag = "4")]
    pub content: String,
    #[prost(string, tag = "5")]
    pub created_at: String,
    #[prost(string, tag = "6")]
    pub updated_at: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreatePostRequest {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub content: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreatePostResponse {
    #[prost(string, tag = "1")]
    #[serde(rename = "postID")]
    pub post_id: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatePostRequest {
    #[prost(string, tag = "1")]
    #[serde(rename = "postID")]
    pub post_id: String,
    #[prost(string, optional, tag = "2")]
    pub title: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub content: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct UpdatePostResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeletePostRequest {
    #[prost(string, repeated, tag = "1")]
    #[serde(rename = "postIDs")]
    pub post_ids: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct DeletePostResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetPostRequest {
    #[prost(string, tag = "1")]
    #[serde(rename = "postID")]
    pub post_id: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetPostResponse {
    #[prost(message, optional, tag = "1")]
    pub post: Option<Post>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListPostRequest {
    #[prost(int64, tag = "1")]
    pub offset: i64,
    #[prost(int64, tag = "2")]
    pub limit: i64,
    #[prost(string, optional, tag = "3")]
    pub title: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListPostResponse {
    #[prost(int64, tag = "1")]
    pub total_count: i64,
    #[prost(message, repeated, tag = "2")]
    pub posts: Vec<Post>,
}
