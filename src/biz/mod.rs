//! Business logic, shared by every transport.

pub mod post;
pub mod user;

use std::sync::Arc;

use crate::authz::Authorizer;
use crate::crypto::PasswordManager;
use crate::store::IStore;
use crate::token::TokenManager;

pub use post::{PostBiz, PostService};
pub use user::{UserBiz, UserService};

/// Entry point of the business layer.
#[derive(Clone)]
pub struct Biz {
    user: UserService,
    post: PostService,
}

impl Biz {
    pub fn new(
        store: Arc<dyn IStore>,
        tokens: TokenManager,
        authz: Arc<Authorizer>,
        passwords: PasswordManager,
    ) -> Self {
        Self {
            user: UserService::new(Arc::clone(&store), tokens, authz, passwords),
            post: PostService::new(store),
        }
    }

    pub fn user(&self) -> &dyn UserBiz {
        &self.user
    }

    pub fn post(&self) -> &dyn PostBiz {
        &self.post
    }
}
