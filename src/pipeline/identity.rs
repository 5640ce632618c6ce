//! Request id assignment.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{BoxHandler, Handler, Request, Response, Stage};
use crate::error::Result;

/// Assigns a fresh UUID to every request and logs its arrival.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdStage;

impl Stage for RequestIdStage {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(RequestIdAssigning { next })
    }
}

struct RequestIdAssigning {
    next: BoxHandler,
}

#[async_trait]
impl Handler for RequestIdAssigning {
    async fn call(&self, mut request: Request) -> Result<Response> {
        let id = Uuid::new_v4();
        request.id = Some(id);

        info!(
            request_id = %id,
            method = %request.method,
            path = %request.path,
            peer = ?request.peer_addr,
            "Request received"
        );

        self.next.call(request).await
    }
}
