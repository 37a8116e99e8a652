use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PolicyError {
    #[error("Failed to read policy file `{path}`")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::load),
        help("Check that the file exists and is readable")
    )]
    PolicyRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list policy directory `{path}`")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::directory),
        help("Every entry in policy.directories must be an existing directory")
    )]
    PolicyDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("KDL parse error in `{path}`: {message}")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::kdl_parse),
        help("Check the policy file syntax — see https://kdl.dev for the specification")
    )]
    KdlParse { path: String, message: String },

    #[error("Invalid policy `{policy}`: {message}")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::invalid_policy),
        help("A policy is `policy \"name\" {{ default ... rule ... }}` with result/message on every rule")
    )]
    InvalidPolicy { policy: String, message: String },

    #[error("Duplicate policy name `{0}`")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::duplicate_policy),
        help("Policy names must be unique across all configured directories")
    )]
    DuplicatePolicy(String),

    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::invalid_condition),
        help("Supported: ==, !=, >, <, >=, <=, &&, ||, !, in, dns.a(...), dns.ptr(...); paths use dot notation")
    )]
    InvalidCondition(String),

    #[error("Meta-policy validation failed: {details}")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::meta_policy),
        help("Every policy must produce a result of allow, deny or skip and a non-empty message")
    )]
    MetaPolicyFailed { details: String },

    #[error("Built-in source is malformed: {0}")]
    #[diagnostic(code(docker_socket_authorizer::policy::builtin_source))]
    BuiltinSource(String),

    #[error("Query evaluation failed: {0}")]
    #[diagnostic(code(docker_socket_authorizer::policy::eval))]
    EvalFailed(String),

    #[error("Storage write failed: {0}")]
    #[diagnostic(code(docker_socket_authorizer::policy::storage_write))]
    StorageWrite(String),

    #[error("Policy watcher error: {0}")]
    #[diagnostic(
        code(docker_socket_authorizer::policy::watch),
        help("Check that every entry in policy.directories exists and is watchable")
    )]
    Watch(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(docker_socket_authorizer::policy::io))]
    Io(#[from] std::io::Error),
}

impl IntoResponse for PolicyError {
    fn into_response(self) -> Response {
        // Reload endpoints surface loader failures; everything here is a
        // server-side problem, never a client one.
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
