//! Tower glue running a [`Pipeline`] in front of the routed services.

use super::{CallResult, Endpoint, Pipeline};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::Status;
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};
use tower::{BoxError, Layer, Service};

/// Wraps a service so every request passes through the pipeline first.
#[derive(Clone, Debug)]
pub struct PipelineLayer {
    pipeline: Arc<Pipeline>,
}

impl PipelineLayer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for PipelineLayer {
    type Service = PipelineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PipelineService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineService<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S> Service<Request<Body>> for PipelineService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Use the instance that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let pipeline = self.pipeline.clone();

        Box::pin(async move {
            let endpoint: Endpoint = Box::new(move |call| {
                let mut inner = inner;
                async move {
                    inner
                        .call(call)
                        .await
                        .map_err(|e| Status::from_error(e.into()))
                }
                .boxed()
            });

            Ok(into_response(pipeline.dispatch(request, endpoint).await))
        })
    }
}

/// Turns a short-circuited call into a trailers-only gRPC response.
pub(crate) fn into_response(result: CallResult) -> Response<Body> {
    result.unwrap_or_else(status_response)
}

pub(crate) fn status_response(status: Status) -> Response<Body> {
    let (parts, ()) = status.into_http::<()>().into_parts();
    Response::from_parts(parts, Body::empty())
}
