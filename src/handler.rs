//! Generic JSON request adapter
//!
//! Every endpoint is a typed business function `f(ctx, Req) -> Result<Resp>`.
//! [`Adapter`] owns everything around it: reading and decoding the body,
//! validating the request, enforcing the deadline, mapping errors to
//! responses and encoding the result. It knows nothing about any particular
//! operation's fields.
use super::error::ApiError;
use super::validation::{Validate, Validator};
use anyhow::Context as _;
use axum::{
    Json,
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::future::{BoxFuture, FutureExt};
use http_body_util::LengthLimitError;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, error, info_span};
use uuid::Uuid;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Per-request data handed to business functions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub deadline: Instant,
}

#[derive(thiserror::Error, Debug)]
#[error("request deadline exceeded")]
pub struct DeadlineExceeded;

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Fails once the deadline has passed; call before starting work that
    /// cannot be interrupted halfway.
    pub fn ensure_live(&self) -> Result<(), DeadlineExceeded> {
        if Instant::now() >= self.deadline {
            return Err(DeadlineExceeded);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Adapter {
    validator: Validator,
    request_timeout: Duration,
    max_body_bytes: usize,
    check_responses: bool,
}

impl Adapter {
    pub fn new(validator: Validator) -> Self {
        Self {
            validator,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            check_responses: false,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Validate responses as well as requests. A response that fails its own
    /// rules is reported as an internal error.
    pub fn with_response_checks(mut self, enabled: bool) -> Self {
        self.check_responses = enabled;
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Wraps a typed business function into an axum handler.
    pub fn handler<Req, Resp, F, Fut>(
        &self,
        f: F,
    ) -> impl Fn(Request) -> BoxFuture<'static, Response> + Clone + Send + Sync + 'static
    where
        Req: DeserializeOwned + Validate + Send + 'static,
        Resp: Serialize + Validate + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let adapter = self.clone();
        move |request: Request| -> BoxFuture<'static, Response> {
            let adapter = adapter.clone();
            let f = f.clone();
            async move { adapter.handle(&f, request).await }.boxed()
        }
    }

    /// Runs the full pipeline for one request and produces exactly one response.
    pub async fn handle<Req, Resp, F, Fut>(&self, f: &F, request: Request) -> Response
    where
        Req: DeserializeOwned + Validate,
        Resp: Serialize + Validate,
        F: Fn(RequestContext, Req) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>>,
    {
        let ctx = RequestContext::new(self.request_timeout);
        let span = info_span!("request", request_id = %ctx.request_id);

        async move {
            // read the whole body before decoding anything
            let body = match axum::body::to_bytes(request.into_body(), self.max_body_bytes).await {
                Ok(body) => body,
                Err(err) if exceeds_length_limit(&err) => {
                    return ApiError::new(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        format!("Request body exceeds {} bytes.", self.max_body_bytes),
                    )
                    .into_response();
                }
                Err(err) => {
                    return error_response(anyhow::Error::new(err).context("reading request body"));
                }
            };

            let req: Req = match serde_json::from_slice(&body) {
                Ok(req) => req,
                Err(err) => {
                    return ApiError::bad_request(format!("Error unmarshaling request: {err}"))
                        .into_response();
                }
            };

            if let Err(err) = self.validator.validate(&req) {
                return ApiError::bad_request(format!("Invalid parameters: {err}")).into_response();
            }

            match self.call(f, ctx, req, self.check_responses).await {
                Ok(resp) => Json(resp).into_response(),
                Err(err) => error_response(err),
            }
        }
        .instrument(span)
        .await
    }

    /// Calls a business function the way a request would, minus the
    /// transport: validates the request, calls `f`, and always validates the
    /// response. Intended for exercising services directly in tests.
    pub async fn invoke<Req, Resp, F, Fut>(&self, f: &F, req: Req) -> anyhow::Result<Resp>
    where
        Req: Validate,
        Resp: Validate,
        F: Fn(RequestContext, Req) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>>,
    {
        if let Err(err) = self.validator.validate(&req) {
            return Err(ApiError::bad_request(format!("Invalid parameters: {err}")).into());
        }

        let ctx = RequestContext::new(self.request_timeout);
        self.call(f, ctx, req, true).await
    }

    async fn call<Req, Resp, F, Fut>(
        &self,
        f: &F,
        ctx: RequestContext,
        req: Req,
        check_response: bool,
    ) -> anyhow::Result<Resp>
    where
        Resp: Validate,
        F: Fn(RequestContext, Req) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>>,
    {
        let deadline = ctx.deadline;
        let resp = tokio::time::timeout_at(deadline, f(ctx, req))
            .await
            .map_err(|_| DeadlineExceeded)??;

        if check_response {
            self.validator
                .validate(&resp)
                .context("response failed validation")?;
        }

        Ok(resp)
    }
}

/// Maps a business error to a response. Errors the caller is meant to see
/// pass through; anything else is logged and replaced by a generic 500.
pub fn error_response(err: anyhow::Error) -> Response {
    match err.downcast::<ApiError>() {
        Ok(api_err) => api_err.into_response(),
        Err(err) => {
            error!("Internal error: {err:#}");
            ApiError::internal().into_response()
        }
    }
}

fn exceeds_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}
