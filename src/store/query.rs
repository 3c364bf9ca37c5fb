//! Filter predicates shared by every store backend.

use crate::model::{PostM, UserM};

/// Column holding the owner of a row.
pub const TENANT_COLUMN: &str = "user_id";

/// Bound value of a condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Str(value.clone())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// `column = value`.
    Eq(&'static str, Value),
    /// `column IN (values)`. An empty list matches nothing.
    In(&'static str, Vec<Value>),
    /// `column LIKE %needle%`.
    Contains(&'static str, String),
}

/// Owner restriction applied to a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Only rows owned by this user id.
    Owner(&'a str),
    /// Every row. Reserved to administrative paths.
    All,
}

impl<'a> Scope<'a> {
    /// Build the scope of a caller: admins see everything.
    pub fn of(user_id: &'a str, admin: bool) -> Self {
        if admin { Scope::All } else { Scope::Owner(user_id) }
    }

    fn tenant(self) -> Option<&'a str> {
        match self {
            Scope::Owner(user_id) => Some(user_id),
            Scope::All => None,
        }
    }
}

/// Query conditions, ownership and pagination.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Where {
    conditions: Vec<Condition>,
    tenant: Option<String>,
    offset: i64,
    limit: i64,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `column = value`.
    pub fn filter(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column, value.into()));
        self
    }

    /// Add `column IN (values)`.
    pub fn filter_in<V: Into<Value>>(
        mut self,
        column: &'static str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(Condition::In(
            column,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Add a substring match.
    pub fn contains(mut self, column: &'static str, needle: impl Into<String>) -> Self {
        self.conditions.push(Condition::Contains(column, needle.into()));
        self
    }

    /// `limit <= 0` disables pagination, negative offsets are clamped to 0.
    pub fn paginate(mut self, offset: i64, limit: i64) -> Self {
        self.offset = offset.max(0);
        self.limit = limit;
        self
    }

    /// Restrict rows to those owned by `user_id`. `None` leaves the query
    /// unrestricted.
    pub fn with_tenant(mut self, user_id: Option<&str>) -> Self {
        self.tenant = user_id.map(ToOwned::to_owned);
        self
    }

    /// Apply the ownership of `scope`.
    pub fn scoped(self, scope: Scope<'_>) -> Self {
        self.with_tenant(scope.tenant())
    }

    /// Every condition, tenant included.
    pub fn conditions(&self) -> Vec<Condition> {
        let mut conditions = self.conditions.clone();
        if let Some(tenant) = &self.tenant {
            conditions.push(Condition::Eq(TENANT_COLUMN, Value::Str(tenant.clone())));
        }
        conditions
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// `None` when unlimited.
    pub fn limit(&self) -> Option<i64> {
        (self.limit > 0).then_some(self.limit)
    }

    /// Evaluate against an in-memory row.
    pub fn matches<R: Record>(&self, row: &R) -> bool {
        self.conditions().iter().all(|condition| match condition {
            Condition::Eq(column, value) => row.column(column).as_ref() == Some(value),
            Condition::In(column, values) => row
                .column(column)
                .is_some_and(|current| values.contains(&current)),
            Condition::Contains(column, needle) => matches!(
                row.column(column),
                Some(Value::Str(current)) if current.contains(needle.as_str())
            ),
        })
    }

    /// Slice an already ordered set of rows.
    pub fn page<T>(&self, rows: Vec<T>) -> Vec<T> {
        let rows = rows.into_iter().skip(self.offset as usize);
        match self.limit() {
            Some(limit) => rows.take(limit as usize).collect(),
            None => rows.collect(),
        }
    }
}

/// Row whose columns can be read by name.
pub trait Record {
    fn column(&self, name: &str) -> Option<Value>;
}

impl Record for UserM {
    fn column(&self, name: &str) -> Option<Value> {
        Some(match name {
            "id" => Value::Int(self.id),
            "user_id" => Value::from(&self.user_id),
            "username" => Value::from(&self.username),
            "nickname" => Value::from(&self.nickname),
            "email" => Value::from(&self.email),
            "phone" => Value::from(&self.phone),
            _ => return None,
        })
    }
}

impl Record for PostM {
    fn column(&self, name: &str) -> Option<Value> {
        Some(match name {
            "id" => Value::Int(self.id),
            "post_id" => Value::from(&self.post_id),
            "user_id" => Value::from(&self.user_id),
            "title" => Value::from(&self.title),
            "content" => Value::from(&self.content),
            _ => return None,
        })
    }
}
