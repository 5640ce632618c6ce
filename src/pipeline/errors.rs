//! Error-to-response translation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{BoxHandler, Handler, Request, Response, Stage};
use crate::error::{Result, TurnstileError};

/// Turns every error from the wrapped handler into a JSON response.
///
/// The response status comes from [`TurnstileError::status`] and the body
/// is `{"error": "<message>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorStage;

impl Stage for ErrorStage {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(ErrorTranslating { next })
    }
}

/// Render an error as `{"error": "<message>"}` with the error's status.
pub(crate) fn error_response(error: &TurnstileError) -> Response {
    Response::with_status(error.status(), json!({ "error": error.to_string() }))
}

struct ErrorTranslating {
    next: BoxHandler,
}

#[async_trait]
impl Handler for ErrorTranslating {
    async fn call(&self, request: Request) -> Result<Response> {
        match self.next.call(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(status = e.status(), error = %e, "Translating handler error");
                Ok(error_response(&e))
            }
        }
    }
}
