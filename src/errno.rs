//! Predefined errors.

use crate::error::ApiError;

pub const ERR_INTERNAL: ApiError =
    ApiError::from_static(500, "InternalError", "Internal server error.");

pub const ERR_NOT_FOUND: ApiError =
    ApiError::from_static(404, "NotFound", "Resource not found.");

/// Request body could not be decoded.
pub const ERR_BIND: ApiError = ApiError::from_static(
    400,
    "BindError",
    "Error occurred while binding the request body to the struct.",
);

pub const ERR_INVALID_ARGUMENT: ApiError = ApiError::from_static(
    400,
    "InvalidArgument",
    "Argument verification failed.",
);

pub const ERR_UNAUTHENTICATED: ApiError =
    ApiError::from_static(401, "Unauthenticated", "Unauthenticated.");

pub const ERR_PERMISSION_DENIED: ApiError = ApiError::from_static(
    403,
    "PermissionDenied",
    "Permission denied. Access to the requested resource is forbidden.",
);

/// Authorization engine failed to evaluate a request.
pub const ERR_OPERATION_FAILED: ApiError =
    ApiError::from_static(409, "OperationFailed", "The requested operation has failed.");

pub const ERR_PAGE_NOT_FOUND: ApiError =
    ApiError::from_static(404, "NotFound.PageNotFound", "Page not found.");

pub const ERR_SIGN_TOKEN: ApiError = ApiError::from_static(
    500,
    "InternalError.SignToken",
    "Error occurred while signing the JSON web token.",
);

pub const ERR_TOKEN_INVALID: ApiError = ApiError::from_static(
    401,
    "Unauthenticated.TokenInvalid",
    "Token was invalid.",
);

pub const ERR_DB_READ: ApiError = ApiError::from_static(
    500,
    "InternalError.DBRead",
    "Database read failure.",
);

pub const ERR_DB_WRITE: ApiError = ApiError::from_static(
    500,
    "InternalError.DBWrite",
    "Database write failure.",
);

// Users.

pub const ERR_USERNAME_INVALID: ApiError = ApiError::from_static(
    400,
    "InvalidArgument.UsernameInvalid",
    "Invalid username: Username must consist of letters, digits, and underscores only, and its length must be between 3 and 20 characters.",
);

pub const ERR_PASSWORD_INVALID: ApiError = ApiError::from_static(
    401,
    "Unauthenticated.PasswordInvalid",
    "Password is incorrect.",
);

pub const ERR_USER_ALREADY_EXISTS: ApiError = ApiError::from_static(
    400,
    "AlreadyExist.UserAlreadyExists",
    "User already exists.",
);

pub const ERR_USER_NOT_FOUND: ApiError =
    ApiError::from_static(404, "NotFound.UserNotFound", "User not found.");

// Posts.

pub const ERR_POST_ALREADY_EXISTS: ApiError = ApiError::from_static(
    400,
    "AlreadyExist.PostAlreadyExists",
    "Post already exists.",
);

pub const ERR_POST_NOT_FOUND: ApiError =
    ApiError::from_static(404, "NotFound.PostNotFound", "Post not found.");

/// The request was cancelled before every result was produced.
pub const ERR_REQUEST_CANCELED: ApiError =
    ApiError::from_static(499, "Canceled", "Request canceled.");
