use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::ConfigStore;
use crate::contracts::ArcHandler;
use crate::kernel::AppContext;
use crate::library::MiddlewareSource;

/// Declaration of one middleware in a setup descriptor. `file` resolves
/// in the declaring module's middleware namespace, `package` globally.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiddlewareDecl {
    /// Display name for logs; falls back to the source key.
    pub name: Option<String>,
    pub file: Option<String>,
    pub package: Option<String>,
    /// Named bound handler on a registered handler host.
    pub method: Option<String>,
    /// Invoke the registered factory with `params` to produce the handler.
    pub construct: bool,
    /// Factory parameters; `"@path:to:config"` strings are resolved
    /// against the config store first.
    pub params: Option<Value>,
    pub disabled: bool,
}

impl MiddlewareDecl {
    /// Content identity (MUID). `params` and `construct` are deliberately
    /// excluded: declarations with the same source share one
    /// instantiation, the first one wins.
    pub(crate) fn id(&self, module: &str) -> MiddlewareId {
        MiddlewareId {
            file: self.file.as_ref().map(|f| format!("{module}/{f}")),
            package: self.package.clone(),
            method: self.method.clone(),
        }
    }

    pub(crate) fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.package.clone())
            .or_else(|| self.file.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

/// Middleware Unique ID: identity of a declaration's content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MiddlewareId {
    file: Option<String>,
    package: Option<String>,
    method: Option<String>,
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("middleware `{label}` in module `{module}` must declare `file` or `package`")]
    MissingSource { module: String, label: String },
    #[error("middleware `{label}` (key `{key}`) is not registered in the library")]
    NotRegistered { label: String, key: String },
    #[error("middleware `{label}` resolves to a handler host; a `method` is required")]
    MethodRequired { label: String, key: String },
    #[error("middleware `{label}` names method `{method}`, but `{key}` does not expose it")]
    UnknownMethod {
        label: String,
        key: String,
        method: String,
    },
    #[error("middleware `{label}` names a `method`, but `{key}` is not a handler host")]
    NotAHost { label: String, key: String },
    #[error("middleware `{label}` sets `construct`, but `{key}` is not registered as a factory")]
    NotConstructible { label: String, key: String },
    #[error("middleware `{label}` is registered as a factory and requires `construct`")]
    RequiresConstruct { label: String },
    #[error("middleware param `@{path}` does not resolve to any configuration value")]
    UnresolvedParam { path: String },
    #[error("constructing middleware `{label}` failed")]
    Construct {
        label: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Resolve a middleware list into installable handlers. Identical
/// declaration content yields the cached handler, so a configuration
/// referenced from many routes or modules instantiates once.
pub(crate) fn instantiate_list(
    ctx: &mut AppContext,
    module: &str,
    list: &[MiddlewareDecl],
) -> Result<Vec<ArcHandler>, MiddlewareError> {
    let mut handlers = Vec::with_capacity(list.len());
    for decl in list {
        if decl.disabled {
            tracing::info!(module, middleware = %decl.label(), "middleware disabled, skipping");
            continue;
        }
        let id = decl.id(module);
        if let Some(cached) = ctx.middleware.get(&id) {
            handlers.push(cached.clone());
            continue;
        }
        let handler = instantiate(ctx, module, decl)?;
        ctx.middleware.insert(id, handler.clone());
        tracing::info!(module, middleware = %decl.label(), "middleware loaded");
        handlers.push(handler);
    }
    Ok(handlers)
}

fn instantiate(
    ctx: &AppContext,
    module: &str,
    decl: &MiddlewareDecl,
) -> Result<ArcHandler, MiddlewareError> {
    let key = match (&decl.file, &decl.package) {
        (Some(file), _) => format!("{module}/{file}"),
        (None, Some(package)) => package.clone(),
        (None, None) => {
            return Err(MiddlewareError::MissingSource {
                module: module.to_string(),
                label: decl.label(),
            })
        }
    };

    let Some(source) = ctx.library.middleware(&key) else {
        return Err(MiddlewareError::NotRegistered {
            label: decl.label(),
            key,
        });
    };

    match source {
        MiddlewareSource::Direct(handler) => {
            if decl.method.is_some() {
                return Err(MiddlewareError::NotAHost {
                    label: decl.label(),
                    key,
                });
            }
            if decl.construct {
                return Err(MiddlewareError::NotConstructible {
                    label: decl.label(),
                    key,
                });
            }
            Ok(handler.clone())
        }
        MiddlewareSource::Host(host) => {
            if decl.construct {
                return Err(MiddlewareError::NotConstructible {
                    label: decl.label(),
                    key,
                });
            }
            let Some(method) = decl.method.as_deref() else {
                return Err(MiddlewareError::MethodRequired {
                    label: decl.label(),
                    key,
                });
            };
            host.clone()
                .handler(method)
                .ok_or_else(|| MiddlewareError::UnknownMethod {
                    label: decl.label(),
                    key,
                    method: method.to_string(),
                })
        }
        MiddlewareSource::Factory(factory) => {
            if !decl.construct {
                return Err(MiddlewareError::RequiresConstruct {
                    label: decl.label(),
                });
            }
            let params = resolve_params(&ctx.config, decl.params.clone().unwrap_or(Value::Null))?;
            factory(ctx, params).map_err(|source| MiddlewareError::Construct {
                label: decl.label(),
                source,
            })
        }
    }
}

/// Replace `"@path:to:value"` strings with their configuration values,
/// recursing through arrays and objects.
pub(crate) fn resolve_params(
    config: &ConfigStore,
    params: Value,
) -> Result<Value, MiddlewareError> {
    match params {
        Value::String(s) => match s.strip_prefix('@') {
            Some(path) => match config.get(path)? {
                Some(v) => Ok(v.clone()),
                None => Err(MiddlewareError::UnresolvedParam {
                    path: path.to_string(),
                }),
            },
            None => Ok(Value::String(s)),
        },
        Value::Array(items) => items
            .into_iter()
            .map(|item| resolve_params(config, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| Ok((k, resolve_params(config, v)?)))
            .collect::<Result<Map<String, Value>, MiddlewareError>>()
            .map(Value::Object),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{handler_fn, Flow, HandlerHost};
    use crate::kernel::AppContext;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> AppContext {
        AppContext::new("production", std::env::temp_dir())
    }

    fn ok_handler() -> ArcHandler {
        handler_fn(|_req| async { Flow::done(StatusCode::OK) })
    }

    #[test]
    fn identical_declarations_share_one_handler() {
        let mut ctx = ctx();
        let made = Arc::new(AtomicUsize::new(0));
        let made_in_factory = made.clone();
        ctx.library.register_middleware_factory("audit", move |_ctx: &AppContext, _params| {
            made_in_factory.fetch_add(1, Ordering::SeqCst);
            Ok(ok_handler())
        });

        let decl = MiddlewareDecl {
            package: Some("audit".to_string()),
            construct: true,
            params: Some(json!(["x"])),
            ..MiddlewareDecl::default()
        };
        let first = instantiate_list(&mut ctx, "Blog", std::slice::from_ref(&decl)).expect("first");
        let second = instantiate_list(&mut ctx, "Shop", &[decl]).expect("second");

        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }

    #[test]
    fn file_declarations_are_module_scoped() {
        let mut ctx = ctx();
        ctx.library
            .register_middleware_handler("Blog/auth", ok_handler());
        ctx.library
            .register_middleware_handler("Shop/auth", ok_handler());

        let decl = MiddlewareDecl {
            file: Some("auth".to_string()),
            ..MiddlewareDecl::default()
        };
        let blog = instantiate_list(&mut ctx, "Blog", std::slice::from_ref(&decl)).expect("blog");
        let shop = instantiate_list(&mut ctx, "Shop", &[decl]).expect("shop");
        assert!(!Arc::ptr_eq(&blog[0], &shop[0]));
    }

    #[test]
    fn disabled_declarations_are_skipped() {
        let mut ctx = ctx();
        let decl = MiddlewareDecl {
            package: Some("never-registered".to_string()),
            disabled: true,
            ..MiddlewareDecl::default()
        };
        let handlers = instantiate_list(&mut ctx, "Blog", &[decl]).expect("list");
        assert!(handlers.is_empty());
    }

    #[test]
    fn missing_source_is_fatal() {
        let mut ctx = ctx();
        let decl = MiddlewareDecl {
            name: Some("broken".to_string()),
            ..MiddlewareDecl::default()
        };
        match instantiate_list(&mut ctx, "Blog", &[decl]) {
            Err(MiddlewareError::MissingSource { module, label }) => {
                assert_eq!(module, "Blog");
                assert_eq!(label, "broken");
            }
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn unregistered_key_is_fatal() {
        let mut ctx = ctx();
        let decl = MiddlewareDecl {
            package: Some("ghost".to_string()),
            ..MiddlewareDecl::default()
        };
        match instantiate_list(&mut ctx, "Blog", &[decl]) {
            Err(MiddlewareError::NotRegistered { key, .. }) => assert_eq!(key, "ghost"),
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn factory_without_construct_is_fatal() {
        let mut ctx = ctx();
        ctx.library
            .register_middleware_factory("made", |_ctx: &AppContext, _params| Ok(ok_handler()));
        let decl = MiddlewareDecl {
            package: Some("made".to_string()),
            ..MiddlewareDecl::default()
        };
        assert!(matches!(
            instantiate_list(&mut ctx, "Blog", &[decl]),
            Err(MiddlewareError::RequiresConstruct { .. })
        ));
    }

    #[test]
    fn construct_on_direct_handler_is_fatal() {
        let mut ctx = ctx();
        ctx.library.register_middleware_handler("plain", ok_handler());
        let decl = MiddlewareDecl {
            package: Some("plain".to_string()),
            construct: true,
            ..MiddlewareDecl::default()
        };
        assert!(matches!(
            instantiate_list(&mut ctx, "Blog", &[decl]),
            Err(MiddlewareError::NotConstructible { .. })
        ));
    }

    struct AuthHost;

    impl HandlerHost for AuthHost {
        fn handler(self: Arc<Self>, method: &str) -> Option<ArcHandler> {
            match method {
                "check" => {
                    let me = self;
                    Some(handler_fn(move |req| {
                        let _ = &me;
                        async move { Flow::Continue(req) }
                    }))
                }
                _ => None,
            }
        }
    }

    #[test]
    fn host_method_resolution() {
        let mut ctx = ctx();
        ctx.library
            .register_middleware_host("auth", Arc::new(AuthHost));

        let good = MiddlewareDecl {
            package: Some("auth".to_string()),
            method: Some("check".to_string()),
            ..MiddlewareDecl::default()
        };
        assert_eq!(
            instantiate_list(&mut ctx, "Blog", &[good]).expect("good").len(),
            1
        );

        let bad = MiddlewareDecl {
            package: Some("auth".to_string()),
            method: Some("nope".to_string()),
            ..MiddlewareDecl::default()
        };
        assert!(matches!(
            instantiate_list(&mut ctx, "Blog", &[bad]),
            Err(MiddlewareError::UnknownMethod { .. })
        ));

        let missing = MiddlewareDecl {
            package: Some("auth".to_string()),
            ..MiddlewareDecl::default()
        };
        assert!(matches!(
            instantiate_list(&mut ctx, "Blog", &[missing]),
            Err(MiddlewareError::MethodRequired { .. })
        ));
    }

    #[test]
    fn config_params_are_injected() {
        let mut store = ConfigStore::new();
        store
            .set("gantry:options:limit", json!(42))
            .expect("set");
        let resolved = resolve_params(
            &store,
            json!(["@gantry:options:limit", {"nested": "@gantry:options:limit"}, "plain"]),
        )
        .expect("resolve");
        assert_eq!(resolved, json!([42, {"nested": 42}, "plain"]));
    }

    #[test]
    fn unresolvable_config_param_is_fatal() {
        let store = ConfigStore::new();
        match resolve_params(&store, json!("@gantry:missing")) {
            Err(MiddlewareError::UnresolvedParam { path }) => {
                assert_eq!(path, "gantry:missing");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn factory_receives_resolved_params() {
        let mut ctx = ctx();
        ctx.config
            .set("gantry:options:header", json!("X-Demo"))
            .expect("set");
        ctx.library
            .register_middleware_factory("with-params", |_ctx: &AppContext, params| {
                assert_eq!(params, json!(["X-Demo"]));
                Ok(handler_fn(|_req| async { Flow::done(StatusCode::OK) }))
            });
        let decl = MiddlewareDecl {
            package: Some("with-params".to_string()),
            construct: true,
            params: Some(json!(["@gantry:options:header"])),
            ..MiddlewareDecl::default()
        };
        instantiate_list(&mut ctx, "Blog", &[decl]).expect("list");
    }
}
