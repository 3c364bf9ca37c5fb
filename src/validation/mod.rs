//! Request validation.
//!
//! Each resource declares a rule per field name. A request exposes its
//! fields through [`Fields`]; [`validate_all_fields`] runs every rule that
//! has a value, [`validate_selected_fields`] only the named ones. Fields
//! without a rule, and optional fields left empty, are skipped.

mod post;
mod user;

use std::collections::HashMap;
use std::sync::LazyLock;

use regex_lite::Regex;
use validator::{ValidateEmail, ValidateLength};

use crate::context::RequestContext;
use crate::errno;
use crate::error::Result;

pub use post::post_rules;
pub use user::user_rules;

/// Value of one request field.
#[derive(Clone, Copy, Debug)]
pub enum Field<'a> {
    Str(&'a str),
    Int(i64),
    List(&'a [String]),
}

/// Conversion of a request member into a [`Field`]. `None` means "not set".
pub trait AsField {
    fn as_field(&self) -> Option<Field<'_>>;
}

impl AsField for String {
    fn as_field(&self) -> Option<Field<'_>> {
        Some(Field::Str(self))
    }
}

impl AsField for Option<String> {
    fn as_field(&self) -> Option<Field<'_>> {
        self.as_deref().map(Field::Str)
    }
}

impl AsField for i64 {
    fn as_field(&self) -> Option<Field<'_>> {
        Some(Field::Int(*self))
    }
}

impl AsField for Vec<String> {
    fn as_field(&self) -> Option<Field<'_>> {
        Some(Field::List(self))
    }
}

/// Requests whose members can be checked by name.
pub trait Fields {
    fn fields(&self) -> Vec<(&'static str, Field<'_>)>;
}

/// Implement [`Fields`] by listing `name => member`.
macro_rules! impl_fields {
    ($ty:ty { $($name:literal => $member:ident),* $(,)? }) => {
        impl $crate::validation::Fields for $ty {
            fn fields(&self) -> Vec<(&'static str, $crate::validation::Field<'_>)> {
                #[allow(unused_mut)]
                let mut fields = Vec::new();
                $(
                    if let Some(field) = $crate::validation::AsField::as_field(&self.$member) {
                        fields.push(($name, field));
                    }
                )*
                fields
            }
        }
    };
}
pub(crate) use impl_fields;

pub type Rule = Box<dyn Fn(Field<'_>) -> Result<()> + Send + Sync>;
pub type Rules = HashMap<&'static str, Rule>;

/// Validate every field having a rule.
pub fn validate_all_fields<T: Fields>(obj: &T, rules: &Rules) -> Result<()> {
    for (name, field) in obj.fields() {
        if let Some(rule) = rules.get(name) {
            rule(field)?;
        }
    }
    Ok(())
}

/// Validate only `names`.
pub fn validate_selected_fields<T: Fields>(obj: &T, rules: &Rules, names: &[&str]) -> Result<()> {
    for (name, field) in obj.fields() {
        if !names.contains(&name) {
            continue;
        }
        if let Some(rule) = rules.get(name) {
            rule(field)?;
        }
    }
    Ok(())
}

/// Request validation, run after authentication.
pub trait Validate {
    fn validate(&self, ctx: &RequestContext) -> Result<()>;
}

/// Fill unset request members with defaults.
pub trait Defaulter {
    fn apply_defaults(&mut self) {}
}

/// Cross-field check: path user must be the logged-in user.
pub(crate) fn ensure_same_user(ctx: &RequestContext, user_id: &str) -> Result<()> {
    if user_id != ctx.user_id {
        return Err(errno::ERR_PERMISSION_DENIED.with_message(format!(
            "The logged-in user `{}` does not match request user `{}`",
            ctx.user_id, user_id
        )));
    }
    Ok(())
}

static USERNAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());
static LETTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]").unwrap());
static DIGIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]").unwrap());
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^1[3-9][0-9]{9}$").unwrap());

pub(crate) fn is_valid_username(username: &str) -> bool {
    username.validate_length(Some(3), Some(20), None) && USERNAME.is_match(username)
}

pub(crate) fn is_valid_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(errno::ERR_INVALID_ARGUMENT.with_message("password cannot be empty"));
    }
    if password.len() < 6 {
        return Err(errno::ERR_INVALID_ARGUMENT
            .with_message("password must be at least 6 characters long"));
    }
    if !LETTER.is_match(password) {
        return Err(errno::ERR_INVALID_ARGUMENT
            .with_message("password must contain at least one letter"));
    }
    if !DIGIT.is_match(password) {
        return Err(errno::ERR_INVALID_ARGUMENT
            .with_message("password must contain at least one number"));
    }
    Ok(())
}

pub(crate) fn is_valid_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(errno::ERR_INVALID_ARGUMENT.with_message("email cannot be empty"));
    }
    if !EMAIL.is_match(email) || !email.validate_email() {
        return Err(errno::ERR_INVALID_ARGUMENT.with_message("invalid email format"));
    }
    Ok(())
}

pub(crate) fn is_valid_phone(phone: &str) -> Result<()> {
    if phone.is_empty() {
        return Err(errno::ERR_INVALID_ARGUMENT.with_message("phone cannot be empty"));
    }
    if !PHONE.is_match(phone) {
        return Err(errno::ERR_INVALID_ARGUMENT.with_message("invalid phone format"));
    }
    Ok(())
}

/// Rule requiring a non-empty string.
pub(crate) fn required(message: &'static str) -> Rule {
    Box::new(move |field: Field<'_>| match field {
        Field::Str(value) if value.is_empty() => {
            Err(errno::ERR_INVALID_ARGUMENT.with_message(message))
        },
        Field::List(values) if values.is_empty() || values.iter().any(String::is_empty) => {
            Err(errno::ERR_INVALID_ARGUMENT.with_message(message))
        },
        _ => Ok(()),
    })
}

/// Rule checking a string with `check`.
pub(crate) fn string(check: fn(&str) -> Result<()>) -> Rule {
    Box::new(move |field: Field<'_>| match field {
        Field::Str(value) => check(value),
        _ => Ok(()),
    })
}
