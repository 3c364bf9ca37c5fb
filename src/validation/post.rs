use std::collections::HashMap;

use super::{
    Defaulter, Field, Rules, Validate, impl_fields, required, validate_all_fields,
    validate_selected_fields,
};
use crate::context::RequestContext;
use crate::errno;
use crate::error::Result;
use crate::known::DEFAULT_LIMIT;
use crate::proto::{
    CreatePostRequest, DeletePostRequest, GetPostRequest, ListPostRequest, UpdatePostRequest,
};

/// Rules of post-related fields.
pub fn post_rules() -> Rules {
    let mut rules: Rules = HashMap::new();
    rules.insert("post_id", required("postID cannot be empty"));
    rules.insert("post_ids", required("postID cannot be empty"));
    rules.insert("title", required("title cannot be empty"));
    rules.insert("content", required("content cannot be empty"));
    rules.insert(
        "limit",
        Box::new(|field: Field<'_>| match field {
            Field::Int(limit) if limit <= 0 => {
                Err(errno::ERR_INVALID_ARGUMENT.with_message("limit must be greater than 0"))
            },
            _ => Ok(()),
        }),
    );
    rules.insert(
        "offset",
        Box::new(|field: Field<'_>| match field {
            Field::Int(offset) if offset < 0 => {
                Err(errno::ERR_INVALID_ARGUMENT.with_message("offset cannot be negative"))
            },
            _ => Ok(()),
        }),
    );
    rules
}

impl_fields!(CreatePostRequest { "title" => title, "content" => content });
impl_fields!(UpdatePostRequest {
    "post_id" => post_id,
    "title" => title,
    "content" => content,
});
impl_fields!(DeletePostRequest { "post_ids" => post_ids });
impl_fields!(GetPostRequest { "post_id" => post_id });
impl_fields!(ListPostRequest { "offset" => offset, "limit" => limit, "title" => title });

impl Validate for CreatePostRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &post_rules())
    }
}

impl Validate for UpdatePostRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &post_rules())
    }
}

impl Validate for DeletePostRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &post_rules())
    }
}

impl Validate for GetPostRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        validate_all_fields(self, &post_rules())
    }
}

impl Validate for ListPostRequest {
    fn validate(&self, _: &RequestContext) -> Result<()> {
        if let Some(title) = &self.title {
            let len = title.chars().count();
            if !(5..=100).contains(&len) {
                return Err(errno::ERR_INVALID_ARGUMENT
                    .with_message("title must be between 5 and 100 characters"));
            }
        }
        validate_selected_fields(self, &post_rules(), &["offset", "limit"])
    }
}

impl Defaulter for CreatePostRequest {}
impl Defaulter for UpdatePostRequest {}
impl Defaulter for DeletePostRequest {}
impl Defaulter for GetPostRequest {}

impl Defaulter for ListPostRequest {
    fn apply_defaults(&mut self) {
        if self.limit == 0 {
            self.limit = DEFAULT_LIMIT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_post() {
        let ctx = RequestContext::default();
        let rq = CreatePostRequest {
            title: "hello".into(),
            content: "world".into(),
        };
        assert!(rq.validate(&ctx).is_ok());

        let err = CreatePostRequest {
            title: String::new(),
            content: "world".into(),
        }
        .validate(&ctx)
        .unwrap_err();
        assert_eq!(err.message, "title cannot be empty");
    }

    #[test]
    fn test_update_post_with_empty_optional() {
        let ctx = RequestContext::default();
        let rq = UpdatePostRequest {
            post_id: "post-abc123".into(),
            title: None,
            content: Some(String::new()),
        };
        let err = rq.validate(&ctx).unwrap_err();
        assert_eq!(err.message, "content cannot be empty");

        let rq = UpdatePostRequest {
            post_id: "post-abc123".into(),
            title: None,
            content: None,
        };
        assert!(rq.validate(&ctx).is_ok());
    }

    #[test]
    fn test_delete_post_ids() {
        let ctx = RequestContext::default();
        assert!(DeletePostRequest { post_ids: vec![] }.validate(&ctx).is_err());
        assert!(
            DeletePostRequest {
                post_ids: vec!["post-a".into(), String::new()]
            }
            .validate(&ctx)
            .is_err()
        );
        assert!(
            DeletePostRequest {
                post_ids: vec!["post-a".into()]
            }
            .validate(&ctx)
            .is_ok()
        );
    }

    #[test]
    fn test_list_post_title_length() {
        let ctx = RequestContext::default();
        let mut rq = ListPostRequest {
            title: Some("abcd".into()),
            ..Default::default()
        };
        rq.apply_defaults();
        assert!(rq.validate(&ctx).is_err());

        rq.title = Some("abcde".into());
        assert!(rq.validate(&ctx).is_ok());

        rq.title = Some("a".repeat(101));
        assert!(rq.validate(&ctx).is_err());

        rq.title = None;
        assert!(rq.validate(&ctx).is_ok());
    }
}
