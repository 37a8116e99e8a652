//! The per-request input record handed to the evaluator: the candidate
//! request as the reverse proxy forwarded it, with lower-cased headers, the
//! `x-original-*` fields the proxy attaches, and forward-confirmed reverse
//! DNS names for both peer addresses.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::dns;

#[derive(Debug, Error, Diagnostic)]
pub enum InputError {
    #[error("Unable to read request body: {0}")]
    #[diagnostic(code(docker_socket_authorizer::input::body))]
    Body(#[from] axum::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Input {
    pub uri: String,
    pub method: String,
    pub remote_addr: String,
    pub remote_addr_names: Vec<String>,
    pub original_uri: String,
    pub original_method: String,
    pub original_ip: String,
    pub original_ip_names: Vec<String>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

impl Input {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Build the evaluator input from an incoming request. Consumes the request
/// (the body is read in full). DNS failures degrade to empty name sets; only
/// a failed body read is an input-construction failure.
pub async fn make_input(request: Request<Body>) -> Result<Input, InputError> {
    let (parts, body) = request.into_parts();

    // Only present on TCP listeners; unix peers have no address.
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let header_value = |name: &str| -> String {
        headers
            .get(name)
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or_default()
    };
    let original_uri = header_value("x-original-uri");
    let original_method = header_value("x-original-method");
    let original_ip = header_value("x-original-ip");

    let body = axum::body::to_bytes(body, usize::MAX).await?;

    let remote_ip = remote_addr
        .parse::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    let remote_addr_names = dns::forward_confirmed_names(&remote_ip).await;
    let original_ip_names = dns::forward_confirmed_names(&original_ip).await;

    Ok(Input {
        uri: parts.uri.to_string(),
        method: parts.method.to_string(),
        remote_addr,
        remote_addr_names,
        original_uri,
        original_method,
        original_ip,
        original_ip_names,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}
