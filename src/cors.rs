use axum::{
    body::{boxed, BoxBody, Empty},
    http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode},
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

/// Reflects the request origin back when it is allowed.
/// An empty allow-list accepts every origin.
#[derive(Clone, Default)]
pub struct CorsLayer {
    allowed_origins: Arc<Vec<String>>,
}

impl CorsLayer {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self {
            allowed_origins: Arc::new(allowed_origins),
        }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsMiddleware {
            inner,
            allowed_origins: self.allowed_origins.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CorsMiddleware<S> {
    inner: S,
    allowed_origins: Arc<Vec<String>>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl<S, ReqBody> Service<Request<ReqBody>> for CorsMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // see https://github.com/tower-rs/tower/issues/547
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .filter(|origin| origin_allowed(&self.allowed_origins, origin))
            .map(str::to_owned);

        if matches!(req.method(), &Method::OPTIONS) {
            Box::pin(async move {
                let mut resp = Response::new(boxed(Empty::new()));
                *resp.status_mut() = StatusCode::NO_CONTENT;

                if let Some(origin) = &origin {
                    insert_headers(origin, resp.headers_mut());
                }

                Ok(resp)
            })
        } else {
            Box::pin(async move {
                let mut resp = inner.call(req).await?;
                if let Some(origin) = &origin {
                    insert_headers(origin, resp.headers_mut());
                }
                Ok(resp)
            })
        }
    }
}

pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    !origin.is_empty() && (allowed.is_empty() || allowed.iter().any(|o| o == origin))
}

fn insert_headers(origin: &str, headers: &mut HeaderMap) {
    let origin = match HeaderValue::from_str(origin) {
        Ok(origin) => origin,
        Err(_) => return,
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
}
