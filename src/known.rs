//! Well-known names shared across layers.

/// Header carrying the request correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

pub const ROLE_USER: &str = "role::user";
pub const ROLE_ADMIN: &str = "role::admin";

/// Username that always acts as administrator.
pub const ADMIN_USERNAME: &str = "root";

/// Upper bound of concurrent tasks spawned by a single fan-out.
pub const MAX_CONCURRENCY: usize = 10;

/// Page size applied when a list request does not set one.
pub const DEFAULT_LIMIT: i64 = 20;
