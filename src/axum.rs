//! Axum integration utilities.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::warn;

use crate::authorizer::PrivilegesFetcher;
use crate::engine::EnforcementEngine;
use crate::error::Error;
use crate::types::{Action, EntityId, Principal};

use ::axum::body::Body;
use ::axum::http::{Request, StatusCode};
use ::axum::response::{IntoResponse, Response};
use ::tower::{Layer, Service};

/// Authenticated caller, inserted as a request extension by the
/// authentication layer.
#[derive(Debug, Clone)]
pub struct EnforcementContext {
    /// Principal identifier.
    pub principal: Principal,
}

impl EnforcementContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }
}

/// Middleware layer that enforces one privilege using [`EnforcementEngine`].
#[derive(Debug)]
pub struct EnforceLayer<F> {
    engine: Arc<EnforcementEngine<F>>,
    entity: EntityId,
    action: Action,
}

impl<F> Clone for EnforceLayer<F> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            entity: self.entity.clone(),
            action: self.action,
        }
    }
}

impl<F> EnforceLayer<F> {
    /// Creates a layer requiring `action` on `entity`.
    pub fn new(engine: Arc<EnforcementEngine<F>>, entity: EntityId, action: Action) -> Self {
        Self {
            engine,
            entity,
            action,
        }
    }
}

impl<F, Inner> Layer<Inner> for EnforceLayer<F>
where
    F: PrivilegesFetcher + 'static,
{
    type Service = EnforceService<Inner, F>;

    fn layer(&self, inner: Inner) -> Self::Service {
        EnforceService {
            inner,
            engine: Arc::clone(&self.engine),
            entity: self.entity.clone(),
            action: self.action,
        }
    }
}

/// Middleware service that rejects requests lacking the privilege.
///
/// Missing context maps to 401, a denied privilege to 403 and an unreachable
/// backend to 503.
#[derive(Debug)]
pub struct EnforceService<Inner, F> {
    inner: Inner,
    engine: Arc<EnforcementEngine<F>>,
    entity: EntityId,
    action: Action,
}

impl<Inner: Clone, F> Clone for EnforceService<Inner, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: Arc::clone(&self.engine),
            entity: self.entity.clone(),
            action: self.action,
        }
    }
}

impl<Inner, F> Service<Request<Body>> for EnforceService<Inner, F>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    F: PrivilegesFetcher + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = Arc::clone(&self.engine);
        let entity = self.entity.clone();
        let action = self.action;

        Box::pin(async move {
            let context = req.extensions().get::<EnforcementContext>().cloned();
            let Some(context) = context else {
                return Ok((StatusCode::UNAUTHORIZED, "missing enforcement context").into_response());
            };

            match engine.enforce(&entity, &context.principal, action).await {
                Ok(()) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(Error::PermissionDenied { .. }) => {
                    Ok((StatusCode::FORBIDDEN, "forbidden").into_response())
                }
                Err(err) => {
                    warn!("enforcement failed for {}: {err}", context.principal);
                    Ok((StatusCode::SERVICE_UNAVAILABLE, "authorization unavailable")
                        .into_response())
                }
            }
        })
    }
}
