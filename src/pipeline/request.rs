//! Request and response types flowing through the pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An inbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Request id, assigned by the request id stage
    #[serde(skip)]
    pub id: Option<Uuid>,
    /// Request method, e.g. `GET`
    #[serde(default)]
    pub method: String,
    /// Request path
    #[serde(default)]
    pub path: String,
    /// Request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Raw request body
    #[serde(default)]
    pub body: String,
    /// Address of the directly connected peer, if known
    #[serde(skip)]
    pub peer_addr: Option<SocketAddr>,
}

impl Request {
    /// Create a request with a method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the peer address.
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A response produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP-equivalent status code
    pub status: u16,
    /// JSON body
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Response {
    /// A 200 response with `body`.
    pub fn ok(body: serde_json::Value) -> Self {
        Self::with_status(200, body)
    }

    /// A response with an explicit status.
    pub fn with_status(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
