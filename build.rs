use tonic_build::manual::{Builder, Method, Service};

/// (rpc name, rust method, input type, output type).
const METHODS: &[(&str, &str, &str, &str)] = &[
    ("Healthz", "healthz", "HealthzRequest", "HealthzResponse"),
    ("Login", "login", "LoginRequest", "LoginResponse"),
    ("RefreshToken", "refresh_token", "RefreshTokenRequest", "RefreshTokenResponse"),
    ("ChangePassword", "change_password", "ChangePasswordRequest", "ChangePasswordResponse"),
    ("CreateUser", "create_user", "CreateUserRequest", "CreateUserResponse"),
    ("UpdateUser", "update_user", "UpdateUserRequest", "UpdateUserResponse"),
    ("DeleteUser", "delete_user", "DeleteUserRequest", "DeleteUserResponse"),
    ("GetUser", "get_user", "GetUserRequest", "GetUserResponse"),
    ("ListUser", "list_user", "ListUserRequest", "ListUserResponse"),
    ("CreatePost", "create_post", "CreatePostRequest", "CreatePostResponse"),
    ("UpdatePost", "update_post", "UpdatePostRequest", "UpdatePostResponse"),
    ("DeletePost", "delete_post", "DeletePostRequest", "DeletePostResponse"),
    ("GetPost", "get_post", "GetPostRequest", "GetPostResponse"),
    ("ListPost", "list_post", "ListPostRequest", "ListPostResponse"),
];

fn qualified(name: &str) -> String {
    format!("crate::proto::{name}")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=migrations");

    let service = METHODS.iter().fold(
        Service::builder().name("MiniBlog").package("v1"),
        |service, (route, name, input, output)| {
            service.method(
                Method::builder()
                    .name(name)
                    .route_name(route)
                    .input_type(qualified(input))
                    .output_type(qualified(output))
                    .codec_path("tonic::codec::ProstCodec")
                    .build(),
            )
        },
    );

    Builder::new().compile(&[service.build()]);

    Ok(())
}
