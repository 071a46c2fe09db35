use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::response::IntoResponse;
use serde_json::Value;

use crate::kernel::AppContext;

pub type Request = axum::extract::Request;
pub type Response = axum::response::Response;

/// Outcome of one handler in a route chain.
pub enum Flow {
    /// Hand the (possibly modified) request to the next handler.
    Continue(Request),
    /// Terminate the chain with a response.
    Done(Response),
}

impl Flow {
    /// Terminate the chain with anything convertible to a response.
    pub fn done(resp: impl IntoResponse) -> Flow {
        Flow::Done(resp.into_response())
    }
}

/// A request handler participating in a route chain: route actions,
/// before/after middleware and head/tail middleware all share this shape.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    async fn call(&self, req: Request) -> Flow;
}

pub type ArcHandler = Arc<dyn RouteHandler>;

struct FnRouteHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnRouteHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Flow> + Send + 'static,
{
    async fn call(&self, req: Request) -> Flow {
        (self.0)(req).await
    }
}

/// Wrap an async function as a chain handler.
pub fn handler_fn<F, Fut>(f: F) -> ArcHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Flow> + Send + 'static,
{
    Arc::new(FnRouteHandler(f))
}

/// A controller: one singleton instance per module and controller name,
/// resolving declared action names to handlers bound to itself.
pub trait Controller: Send + Sync + 'static {
    /// One-time initialization, invoked before the instance serves any
    /// route.
    fn init(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Resolve a named action to a handler bound to this instance.
    /// Only names ending in `Action` ever reach this method.
    fn action(self: Arc<Self>, name: &str) -> Option<ArcHandler>;
}

pub type ControllerFactory = Arc<dyn Fn() -> Arc<dyn Controller> + Send + Sync>;

/// A loadable plugin contributing side effects during bootstrap.
pub trait Extension: Send + Sync + 'static {
    /// Default configuration merged under `gantry:extension:<namespace>`.
    /// Application-provided values win over these defaults.
    fn default_config(&self) -> Option<(&'static str, Value)> {
        None
    }

    /// Entry point, invoked exactly once per content identity.
    fn load(&self, app: &mut AppContext) -> anyhow::Result<()>;
}

/// An object exposing named handlers bound to itself; middleware
/// declarations select one with their `method` field.
pub trait HandlerHost: Send + Sync + 'static {
    fn handler(self: Arc<Self>, method: &str) -> Option<ArcHandler>;
}

/// Factory producing a handler from declaration params (after `@config`
/// resolution). `Value::Null` when the declaration carries no params.
pub type MiddlewareFactory =
    Arc<dyn Fn(&AppContext, Value) -> anyhow::Result<ArcHandler> + Send + Sync>;

/// Predicate validating a raw route parameter value.
pub type ParamValidatorFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
