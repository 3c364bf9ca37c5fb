use std::collections::HashMap;

use super::{
    Defaulter, Field, Rules, Validate, ensure_same_user, impl_fields, is_valid_email,
    is_valid_password, is_valid_phone, is_valid_username, required, string, validate_all_fields,
    validate_selected_fields,
};
use crate::context::RequestContext;
use crate::errno;
use crate::error::Result;
use crate::known::DEFAULT_LIMIT;
use crate::proto::{
    ChangePasswordRequest, CreateUserRequest, DeleteUserRequest, GetUserRequest, ListUserRequest,
    LoginRequest, RefreshTokenRequest, UpdateUserRequest,
};

/// Rules of user-related fields.
pub fn user_rules() -> Rules {
    let mut rules: Rules = HashMap::new();
    rules.insert("password", string(is_valid_password));
    rules.insert("old_password", string(is_valid_password));
    rules.insert("new_password", string(is_valid_password));
    rules.insert("user_id", required("userID cannot be empty"));
    rules.insert(
        "username",
        string(|username| {
            if is_valid_username(username) {
                Ok(())
            } else {
                Err(errno::ERR_USERNAME_INVALID)
            }
        }),
    );
    rules.insert(
        "nickname",
        string(|nickname| {
            if nickname.chars().count() >= 30 {
                return Err(errno::ERR_INVALID_ARGUMENT
                    .with_message("nickname must be less than 30 characters"));
            }
            Ok(())
        }),
    );
    rules.insert("email", string(is_valid_email));
    rules.insert("phone", string(is_valid_phone));
    rules.insert(
        "limit",
        Box::new(|field: Field<'_>| match field {
            Field::Int(limit) if limit <= 0 => {
                Err(errno::ERR_INVALID_ARGUMENT.with_message("limit must be greater than 0"))
            },
            _ => Ok(()),
        }),
    );
    rules.insert("offset", Box::new(|_: Field<'_>| Ok(())));
    rules
}

impl_fields!(LoginRequest { "username" => username, "password" => password });
impl_fields!(ChangePasswordRequest {
    "user_id" => user_id,
    "old_password" => old_password,
    "new_password" => new_password,
});
impl_fields!(CreateUserRequest {
    "username" => username,
    "password" => password,
    "nickname" => nickname,
    "email" => email,
    "phone" => phone,
});
impl_fields!(UpdateUserRequest {
    "user_id" => user_id,
    "username" => username,
    "nickname" => nickname,
    "email" => email,
    "phone" => phone,
});
impl_fields!(DeleteUserRequest { "user_id" => user_id });
impl_fields!(GetUserRequest { "user_id" => user_id });
impl_fields!(ListUserRequest { "offset" => offset, "limit" => limit });

impl Validate for LoginRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &user_rules())
    }
}

impl Validate for RefreshTokenRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        Ok(())
    }
}

impl Validate for ChangePasswordRequest {
    fn validate(&self, ctx: &RequestContext) -> Result<()> {
        ensure_same_user(ctx, &self.user_id)?;
        validate_all_fields(self, &user_rules())
    }
}

impl Validate for CreateUserRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &user_rules())
    }
}

impl Validate for UpdateUserRequest {
    fn validate(&self, ctx: &RequestContext) -> Result<()> {
        ensure_same_user(ctx, &self.user_id)?;
        validate_selected_fields(self, &user_rules(), &["user_id"])
    }
}

impl Validate for DeleteUserRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &user_rules())
    }
}

impl Validate for GetUserRequest {
    fn validate(&self, ctx: &RequestContext) -> Result<()> {
        ensure_same_user(ctx, &self.user_id)?;
        validate_all_fields(self, &user_rules())
    }
}

impl Validate for ListUserRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &user_rules())
    }
}

impl Defaulter for LoginRequest {}
impl Defaulter for RefreshTokenRequest {}
impl Defaulter for ChangePasswordRequest {}
impl Defaulter for CreateUserRequest {}
impl Defaulter for UpdateUserRequest {}
impl Defaulter for DeleteUserRequest {}
impl Defaulter for GetUserRequest {}

impl Defaulter for ListUserRequest {
    fn apply_defaults(&mut self) {
        if self.limit == 0 {
            self.limit = DEFAULT_LIMIT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(user_id: &str) -> RequestContext {
        RequestContext::new("rid").with_user(user_id, "bob")
    }

    fn create() -> CreateUserRequest {
        CreateUserRequest {
            username: "bob_42".into(),
            password: "miniblog1234".into(),
            nickname: None,
            email: "bob@miniblog.dev".into(),
            phone: "13800000000".into(),
        }
    }

    #[test]
    fn test_create_user() {
        assert!(create().validate(&RequestContext::default()).is_ok());

        let err = CreateUserRequest {
            username: "b!".into(),
            ..create()
        }
        .validate(&RequestContext::default())
        .unwrap_err();
        assert!(err.is(&errno::ERR_USERNAME_INVALID));

        let err = CreateUserRequest {
            nickname: Some("n".repeat(30)),
            ..create()
        }
        .validate(&RequestContext::default())
        .unwrap_err();
        assert_eq!(err.message, "nickname must be less than 30 characters");
    }

    #[test]
    fn test_same_user_checks() {
        let rq = GetUserRequest {
            user_id: "user-eve".into(),
        };
        let err = rq.validate(&ctx("user-bob")).unwrap_err();
        assert!(err.is(&errno::ERR_PERMISSION_DENIED));
        assert_eq!(
            err.message,
            "The logged-in user `user-bob` does not match request user `user-eve`"
        );
        assert!(
            GetUserRequest {
                user_id: "user-bob".into()
            }
            .validate(&ctx("user-bob"))
            .is_ok()
        );
    }

    #[test]
    fn test_update_user_only_checks_user_id() {
        // An invalid email is not looked at on update.
        let rq = UpdateUserRequest {
            user_id: "user-bob".into(),
            email: Some("not-an-email".into()),
            ..Default::default()
        };
        assert!(rq.validate(&ctx("user-bob")).is_ok());
    }

    #[test]
    fn test_change_password_checks_new_password() {
        let rq = ChangePasswordRequest {
            user_id: "user-bob".into(),
            old_password: "miniblog1234".into(),
            new_password: "short".into(),
        };
        let err = rq.validate(&ctx("user-bob")).unwrap_err();
        assert!(err.is(&errno::ERR_INVALID_ARGUMENT));
    }

    #[test]
    fn test_list_defaults_and_limit() {
        let mut rq = ListUserRequest::default();
        rq.apply_defaults();
        assert_eq!(rq.limit, DEFAULT_LIMIT);
        assert!(rq.validate(&RequestContext::default()).is_ok());

        let rq = ListUserRequest {
            offset: 0,
            limit: -1,
        };
        assert!(rq.validate(&RequestContext::default()).is_err());
    }
}
