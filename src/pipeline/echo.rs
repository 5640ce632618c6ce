//! Echo handler.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use super::{Handler, Request, Response};
use crate::error::Result;

/// Responds with a description of the request it received.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[derive(Debug, Serialize)]
struct Echo<'a> {
    body: &'a str,
    sender: String,
    content_length: usize,
    headers: &'a HashMap<String, String>,
    method: &'a str,
    path: &'a str,
}

#[async_trait]
impl Handler for EchoHandler {
    async fn call(&self, request: Request) -> Result<Response> {
        let echo = Echo {
            body: &request.body,
            sender: request
                .peer_addr
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            content_length: request.body.len(),
            headers: &request.headers,
            method: &request.method,
            path: &request.path,
        };

        Ok(Response::ok(serde_json::to_value(&echo)?))
    }
}
