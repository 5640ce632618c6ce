//! Panic recovery.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use super::{BoxHandler, Handler, Request, Response, Stage};
use crate::error::{Result, TurnstileError, STATUS_INTERNAL_ERROR};

/// Message returned to clients whose request panicked.
const FATAL_ERROR_MESSAGE: &str = "fatal server error";

/// Turns a panic in any inner handler into a 500 response.
///
/// The panic is logged with the request id; the connection and the rest
/// of the pipeline keep working.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicStage;

impl Stage for PanicStage {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(PanicRecovering { next })
    }
}

struct PanicRecovering {
    next: BoxHandler,
}

#[async_trait]
impl Handler for PanicRecovering {
    async fn call(&self, request: Request) -> Result<Response> {
        let request_id = request.id;

        match AssertUnwindSafe(self.next.call(request)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    request_id = ?request_id,
                    panic = %panic_message(payload.as_ref()),
                    "Request got fatal server error"
                );
                Ok(super::error_response(&TurnstileError::status_error(
                    STATUS_INTERNAL_ERROR,
                    FATAL_ERROR_MESSAGE,
                )))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handler_fn;
    use tokio_test::assert_ok;

    struct Exploding;

    #[async_trait]
    impl Handler for Exploding {
        async fn call(&self, request: Request) -> Result<Response> {
            panic!("handler blew up on {}", request.path);
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let handler = PanicStage.wrap(Arc::new(Exploding));

        let response = assert_ok!(handler.call(Request::new("GET", "/boom")).await);
        assert_eq!(response.status, 500);
        assert_eq!(response.body["error"], "fatal server error");

        // Still usable after a panic.
        let response = assert_ok!(handler.call(Request::new("GET", "/boom")).await);
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_results_pass_through() {
        let handler = PanicStage.wrap(handler_fn(|request: Request| async move {
            if request.path == "/fail" {
                Err(TurnstileError::RateExceeded)
            } else {
                Ok(Response::ok(serde_json::json!({ "path": request.path })))
            }
        }));

        let response = assert_ok!(handler.call(Request::new("GET", "/ok")).await);
        assert_eq!(response.status, 200);
        assert_eq!(response.body["path"], "/ok");

        let err = handler.call(Request::new("GET", "/fail")).await.unwrap_err();
        assert!(err.is_rate_exceeded());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
