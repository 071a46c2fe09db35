use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::RawPathParams;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use regex::Regex;
use thiserror::Error;

use crate::contracts::{ArcHandler, Controller, Flow, ParamValidatorFn, Request, Response};
use crate::kernel::AppContext;
use crate::middleware::{instantiate_list, MiddlewareError};
use crate::module::{ModuleRecord, ParamRule};

/// HTTP methods recognized in controller references. `All` matches any
/// method the pattern does not route explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    All,
}

impl HttpMethod {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "put" => Some(Self::Put),
            "delete" => Some(Self::Delete),
            "patch" => Some(Self::Patch),
            "head" => Some(Self::Head),
            "options" => Some(Self::Options),
            "trace" => Some(Self::Trace),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// `None` for `All`, which installs as the method fallback.
    fn filter(self) -> Option<MethodFilter> {
        match self {
            Self::Get => Some(MethodFilter::GET),
            Self::Post => Some(MethodFilter::POST),
            Self::Put => Some(MethodFilter::PUT),
            Self::Delete => Some(MethodFilter::DELETE),
            Self::Patch => Some(MethodFilter::PATCH),
            Self::Head => Some(MethodFilter::HEAD),
            Self::Options => Some(MethodFilter::OPTIONS),
            Self::Trace => Some(MethodFilter::TRACE),
            Self::All => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("controller reference `{spec}` must follow `Name[.actionAction[.method,...]]`")]
    BadControllerSpec { spec: String },
    #[error(
        "action `{action}` is not routable: only methods ending in `Action` \
         may be exposed as routes"
    )]
    ActionSuffix { action: String },
    #[error("module `{module}`: route with controllers has no `pattern`")]
    EmptyPattern { module: String },
    #[error("no controller `{name}` registered for module `{module}`")]
    UnknownController { module: String, name: String },
    #[error("controller `{module}::{name}` has no action `{action}`")]
    UnknownAction {
        module: String,
        name: String,
        action: String,
    },
    #[error("initializing controller `{module}::{name}` failed")]
    Init {
        module: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("module `{module}`: param `{param}` pattern is not a valid regular expression")]
    BadParamPattern {
        module: String,
        param: String,
        #[source]
        source: regex::Error,
    },
    #[error("module `{module}`: param `{param}` references unregistered validator `{validator}`")]
    UnknownValidator {
        module: String,
        param: String,
        validator: String,
    },
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
}

/// Parsed `Controller.action.methods` reference.
#[derive(Debug)]
pub(crate) struct ControllerSpec {
    pub controller: String,
    pub action: String,
    pub methods: Vec<HttpMethod>,
}

/// Grammar: `Name[.action[.m1,m2,...]]`. Defaults: action `indexAction`,
/// method set `all`. Unrecognized methods are dropped; if none survive
/// the set falls back to `all`. Actions must end in `Action`; the
/// naming convention is what keeps internal controller methods
/// unreachable from routing.
pub(crate) fn parse_controller_spec(raw: &str) -> Result<ControllerSpec, RouteError> {
    let parts: Vec<&str> = raw.split('.').map(str::trim).collect();
    if parts[0].is_empty() {
        return Err(RouteError::BadControllerSpec {
            spec: raw.to_string(),
        });
    }

    let (action, methods) = match parts.len() {
        1 => ("indexAction".to_string(), vec![HttpMethod::All]),
        2 => (parts[1].to_string(), vec![HttpMethod::All]),
        3 => {
            let mut methods = Vec::new();
            for raw_method in parts[2].split(',') {
                if let Some(method) = HttpMethod::parse(raw_method.trim()) {
                    if !methods.contains(&method) {
                        methods.push(method);
                    }
                }
            }
            if methods.is_empty() {
                methods.push(HttpMethod::All);
            }
            (parts[1].to_string(), methods)
        }
        _ => {
            return Err(RouteError::BadControllerSpec {
                spec: raw.to_string(),
            })
        }
    };

    if !action.ends_with("Action") {
        return Err(RouteError::ActionSuffix { action });
    }

    Ok(ControllerSpec {
        controller: parts[0].to_string(),
        action,
        methods,
    })
}

/// Controller singleton for `module::name`, instantiated and initialized
/// on first reference.
pub(crate) fn controller_instance(
    ctx: &mut AppContext,
    module: &str,
    name: &str,
) -> Result<Arc<dyn Controller>, RouteError> {
    let key = format!("{module}::{name}");
    if let Some(existing) = ctx.controllers.get(&key) {
        return Ok(existing.clone());
    }

    let Some(factory) = ctx.library.controller_factory(module, name) else {
        return Err(RouteError::UnknownController {
            module: module.to_string(),
            name: name.to_string(),
        });
    };
    let instance = factory();
    instance.init(ctx).map_err(|source| RouteError::Init {
        module: module.to_string(),
        name: name.to_string(),
        source,
    })?;
    ctx.controllers.insert(key, instance.clone());
    tracing::info!(module, controller = name, "controller initialized");
    Ok(instance)
}

/// Guard attached to a route chain for one named path parameter.
#[derive(Clone)]
pub(crate) enum ParamGuard {
    Pattern(Arc<Regex>),
    Validator(ParamValidatorFn),
}

impl ParamGuard {
    fn check(&self, value: &str) -> bool {
        match self {
            ParamGuard::Pattern(re) => re.is_match(value),
            ParamGuard::Validator(f) => f(value),
        }
    }
}

pub(crate) fn compile_params(
    ctx: &AppContext,
    module: &str,
    rules: &BTreeMap<String, ParamRule>,
    out: &mut Vec<(String, ParamGuard)>,
) -> Result<(), RouteError> {
    for (param, rule) in rules {
        let guard = match rule {
            ParamRule::Pattern(pattern) => {
                let re = Regex::new(pattern).map_err(|source| RouteError::BadParamPattern {
                    module: module.to_string(),
                    param: param.clone(),
                    source,
                })?;
                ParamGuard::Pattern(Arc::new(re))
            }
            ParamRule::Validator { validator } => {
                let Some(f) = ctx.library.validator(validator) else {
                    return Err(RouteError::UnknownValidator {
                        module: module.to_string(),
                        param: param.clone(),
                        validator: validator.clone(),
                    });
                };
                ParamGuard::Validator(f)
            }
        };
        tracing::info!(module, param = %param, "param rule installed");
        out.push((param.clone(), guard));
    }
    Ok(())
}

/// One installed handler sequence: param guards, then before middleware,
/// the bound action, and after middleware.
#[derive(Clone)]
pub(crate) struct RouteChain {
    guards: Arc<[(String, ParamGuard)]>,
    handlers: Arc<[ArcHandler]>,
}

async fn run_chain(chain: RouteChain, params: Vec<(String, String)>, mut req: Request) -> Response {
    for (name, guard) in chain.guards.iter() {
        if let Some((_, value)) = params.iter().find(|(n, _)| n == name) {
            if !guard.check(value) {
                return StatusCode::NOT_FOUND.into_response();
            }
        }
    }
    for handler in chain.handlers.iter() {
        match handler.call(req).await {
            Flow::Continue(next) => req = next,
            Flow::Done(resp) => return resp,
        }
    }
    // Every handler passed the request on; nothing produced a response.
    StatusCode::NOT_FOUND.into_response()
}

fn chain_handler(
    chain: RouteChain,
) -> impl Fn(
    RawPathParams,
    Request,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone
       + Send
       + 'static {
    move |raw_params: RawPathParams, req: Request| {
        let chain = chain.clone();
        let params: Vec<(String, String)> = raw_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::pin(run_chain(chain, params, req))
    }
}

/// Build the routing subtree for one module. Skips disabled and
/// controller-less routes, enforces the controller grammar, assembles
/// middleware+action chains and registers them per method.
pub(crate) fn build_module_router(
    ctx: &mut AppContext,
    record: &ModuleRecord,
) -> Result<Router, RouteError> {
    let module = record.name.as_str();

    let mut module_guards = Vec::new();
    compile_params(ctx, module, &record.setup.params, &mut module_guards)?;

    // Pattern → chains, preserving declaration order.
    let mut per_pattern: Vec<(String, Vec<(Vec<HttpMethod>, RouteChain)>)> = Vec::new();

    for route in &record.setup.routes {
        if route.disabled {
            tracing::info!(module, pattern = %route.pattern, "route disabled, skipping");
            continue;
        }
        if route.controllers.is_empty() {
            // Legal: the module may exist only to pull in extensions.
            continue;
        }
        if route.pattern.trim().is_empty() {
            return Err(RouteError::EmptyPattern {
                module: module.to_string(),
            });
        }

        let mut guards = module_guards.clone();
        compile_params(ctx, module, &route.params, &mut guards)?;
        let guards: Arc<[(String, ParamGuard)]> = guards.into();

        let pattern = normalize_pattern(&route.pattern);

        for reference in &route.controllers {
            let spec = parse_controller_spec(reference)?;
            let controller = controller_instance(ctx, module, &spec.controller)?;
            let action = controller.clone().action(&spec.action).ok_or_else(|| {
                RouteError::UnknownAction {
                    module: module.to_string(),
                    name: spec.controller.clone(),
                    action: spec.action.clone(),
                }
            })?;

            let mut handlers = instantiate_list(ctx, module, &route.middleware.before)?;
            handlers.push(action);
            handlers.extend(instantiate_list(ctx, module, &route.middleware.after)?);

            let chain = RouteChain {
                guards: guards.clone(),
                handlers: handlers.into(),
            };

            tracing::info!(
                module,
                controller = %spec.controller,
                action = %spec.action,
                methods = ?spec.methods,
                pattern = %pattern,
                "route installed"
            );

            match per_pattern.iter_mut().find(|(p, _)| *p == pattern) {
                Some((_, chains)) => chains.push((spec.methods, chain)),
                None => per_pattern.push((pattern.clone(), vec![(spec.methods, chain)])),
            }
        }
    }

    let mut router = Router::new();
    for (pattern, chains) in per_pattern {
        let mut method_router = MethodRouter::new();
        let mut has_fallback = false;
        for (methods, chain) in chains {
            let handler = chain_handler(chain);
            for method in methods {
                match method.filter() {
                    Some(filter) => {
                        method_router = method_router.on(filter, handler.clone());
                    }
                    None => {
                        if has_fallback {
                            tracing::warn!(
                                module,
                                pattern = %pattern,
                                "pattern already has an `all` handler; replacing it"
                            );
                        }
                        method_router = method_router.fallback(handler.clone());
                        has_fallback = true;
                    }
                }
            }
        }
        router = router.route(&pattern, method_router);
    }

    Ok(router)
}

/// Ensure a leading slash; axum rejects bare patterns.
fn normalize_pattern(pattern: &str) -> String {
    let pattern = pattern.trim();
    if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("/{pattern}")
    }
}

/// Module prefixes: always one leading slash, no trailing slash except
/// for the root prefix itself.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// True when `path` lies under `prefix` with a path-segment boundary.
pub(crate) fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::handler_fn;
    use crate::kernel::AppContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bare_name_defaults_to_index_action_all_methods() {
        let spec = parse_controller_spec("IndexController").expect("parse");
        assert_eq!(spec.controller, "IndexController");
        assert_eq!(spec.action, "indexAction");
        assert_eq!(spec.methods, vec![HttpMethod::All]);
    }

    #[test]
    fn explicit_methods_are_parsed() {
        let spec = parse_controller_spec("UserController.createAction.post,put").expect("parse");
        assert_eq!(spec.action, "createAction");
        assert_eq!(spec.methods, vec![HttpMethod::Post, HttpMethod::Put]);
    }

    #[test]
    fn unrecognized_methods_fall_back_to_all() {
        let spec = parse_controller_spec("X.doAction.bogus1,bogus2").expect("parse");
        assert_eq!(spec.methods, vec![HttpMethod::All]);
    }

    #[test]
    fn duplicate_methods_collapse() {
        let spec = parse_controller_spec("X.doAction.get,GET,get").expect("parse");
        assert_eq!(spec.methods, vec![HttpMethod::Get]);
    }

    #[test]
    fn action_without_suffix_is_rejected() {
        match parse_controller_spec("X.compute") {
            Err(RouteError::ActionSuffix { action }) => assert_eq!(action, "compute"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_controller_name_is_rejected() {
        assert!(matches!(
            parse_controller_spec(".indexAction"),
            Err(RouteError::BadControllerSpec { .. })
        ));
    }

    #[test]
    fn four_segments_are_rejected() {
        assert!(matches!(
            parse_controller_spec("A.bAction.get.extra"),
            Err(RouteError::BadControllerSpec { .. })
        ));
    }

    struct CountingController {
        inits: Arc<AtomicUsize>,
    }

    impl Controller for CountingController {
        fn init(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn action(self: Arc<Self>, name: &str) -> Option<ArcHandler> {
            match name {
                "indexAction" => Some(handler_fn(|_req| async { Flow::done("index") })),
                _ => None,
            }
        }
    }

    #[test]
    fn controller_initializes_exactly_once() {
        let mut ctx = AppContext::new("production", std::env::temp_dir());
        let inits = Arc::new(AtomicUsize::new(0));
        let inits_for_factory = inits.clone();
        ctx.library
            .register_controller("Blog", "IndexController", move || CountingController {
                inits: inits_for_factory.clone(),
            });

        let a = controller_instance(&mut ctx, "Blog", "IndexController").expect("first");
        let b = controller_instance(&mut ctx, "Blog", "IndexController").expect("second");
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_controller_is_fatal() {
        let mut ctx = AppContext::new("production", std::env::temp_dir());
        assert!(matches!(
            controller_instance(&mut ctx, "Blog", "GhostController"),
            Err(RouteError::UnknownController { .. })
        ));
    }

    #[test]
    fn prefixes_normalize() {
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("blog"), "/blog");
        assert_eq!(normalize_prefix("/blog/"), "/blog");
    }

    #[test]
    fn prefix_matching_respects_segment_boundaries() {
        assert!(prefix_matches("/", "/anything"));
        assert!(prefix_matches("/blog", "/blog"));
        assert!(prefix_matches("/blog", "/blog/post/1"));
        assert!(!prefix_matches("/blog", "/blogroll"));
    }
}
