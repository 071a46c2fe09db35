use std::collections::HashMap;
use std::sync::Arc;

use crate::contracts::{
    ArcHandler, Controller, ControllerFactory, Extension, HandlerHost, MiddlewareFactory,
    ParamValidatorFn,
};

/// Lookup key for extension implementations. Declarations resolve to one
/// of these; `LocalFile` and `ModuleFile` sources collapse onto the same
/// `(module, file)` slot while keeping distinct load identities.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExtensionKey {
    Package(String),
    ModuleFile { module: String, file: String },
}

impl std::fmt::Display for ExtensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionKey::Package(name) => write!(f, "{name}"),
            ExtensionKey::ModuleFile { module, file } => write!(f, "{module}/{file}"),
        }
    }
}

/// Source of a middleware handler registered in the library.
#[derive(Clone)]
pub enum MiddlewareSource {
    /// A ready handler, installed as-is.
    Direct(ArcHandler),
    /// A factory invoked with resolved params; requires `construct` on the
    /// declaration.
    Factory(MiddlewareFactory),
    /// An object exposing named bound handlers; the declaration's `method`
    /// selects one.
    Host(Arc<dyn HandlerHost>),
}

/// Static registration tables, built from plain imports before bootstrap.
/// Declarations in setup descriptors resolve against these by key; there
/// is no loading-by-path at runtime.
#[derive(Default)]
pub struct Library {
    extensions: HashMap<ExtensionKey, Arc<dyn Extension>>,
    middleware: HashMap<String, MiddlewareSource>,
    controllers: HashMap<(String, String), ControllerFactory>,
    validators: HashMap<String, ParamValidatorFn>,
    errors: Vec<String>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_extension_package(
        &mut self,
        package: impl Into<String>,
        extension: Arc<dyn Extension>,
    ) -> &mut Self {
        let key = ExtensionKey::Package(package.into());
        if self.extensions.insert(key.clone(), extension).is_some() {
            self.errors
                .push(format!("extension `{key}` is already registered"));
        }
        self
    }

    pub fn register_module_extension(
        &mut self,
        module: impl Into<String>,
        file: impl Into<String>,
        extension: Arc<dyn Extension>,
    ) -> &mut Self {
        let key = ExtensionKey::ModuleFile {
            module: module.into(),
            file: file.into(),
        };
        if self.extensions.insert(key.clone(), extension).is_some() {
            self.errors
                .push(format!("extension `{key}` is already registered"));
        }
        self
    }

    pub fn register_middleware(
        &mut self,
        key: impl Into<String>,
        source: MiddlewareSource,
    ) -> &mut Self {
        let key = key.into();
        if self.middleware.insert(key.clone(), source).is_some() {
            self.errors
                .push(format!("middleware `{key}` is already registered"));
        }
        self
    }

    pub fn register_middleware_handler(
        &mut self,
        key: impl Into<String>,
        handler: ArcHandler,
    ) -> &mut Self {
        self.register_middleware(key, MiddlewareSource::Direct(handler))
    }

    pub fn register_middleware_factory<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&crate::kernel::AppContext, serde_json::Value) -> anyhow::Result<ArcHandler>
            + Send
            + Sync
            + 'static,
    {
        self.register_middleware(key, MiddlewareSource::Factory(Arc::new(factory)))
    }

    pub fn register_middleware_host(
        &mut self,
        key: impl Into<String>,
        host: Arc<dyn HandlerHost>,
    ) -> &mut Self {
        self.register_middleware(key, MiddlewareSource::Host(host))
    }

    pub fn register_controller<C, F>(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        make: F,
    ) -> &mut Self
    where
        C: Controller,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let slot = (module.into(), name.into());
        let factory: ControllerFactory = Arc::new(move || Arc::new(make()));
        if self.controllers.insert(slot.clone(), factory).is_some() {
            self.errors.push(format!(
                "controller `{}::{}` is already registered",
                slot.0, slot.1
            ));
        }
        self
    }

    pub fn register_param_validator<F>(&mut self, key: impl Into<String>, validator: F) -> &mut Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let key = key.into();
        if self
            .validators
            .insert(key.clone(), Arc::new(validator))
            .is_some()
        {
            self.errors
                .push(format!("param validator `{key}` is already registered"));
        }
        self
    }

    pub(crate) fn extension(&self, key: &ExtensionKey) -> Option<&Arc<dyn Extension>> {
        self.extensions.get(key)
    }

    pub(crate) fn middleware(&self, key: &str) -> Option<&MiddlewareSource> {
        self.middleware.get(key)
    }

    pub(crate) fn controller_factory(&self, module: &str, name: &str) -> Option<ControllerFactory> {
        self.controllers
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn validator(&self, key: &str) -> Option<ParamValidatorFn> {
        self.validators.get(key).cloned()
    }

    /// Registration problems accumulated so far; checked once at bootstrap.
    pub(crate) fn errors(&self) -> &[String] {
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{handler_fn, Flow};
    use axum::http::StatusCode;

    #[test]
    fn duplicate_registrations_are_collected() {
        let mut lib = Library::new();
        let handler = handler_fn(|_req| async { Flow::done(StatusCode::OK) });
        lib.register_middleware_handler("dup", handler.clone());
        lib.register_middleware_handler("dup", handler);
        assert_eq!(lib.errors().len(), 1);
        assert!(lib.errors()[0].contains("already registered"));
    }

    #[test]
    fn controller_lookup_is_module_scoped() {
        struct Dummy;
        impl crate::contracts::Controller for Dummy {
            fn action(
                self: std::sync::Arc<Self>,
                _name: &str,
            ) -> Option<crate::contracts::ArcHandler> {
                None
            }
        }

        let mut lib = Library::new();
        lib.register_controller("Blog", "IndexController", || Dummy);
        assert!(lib.controller_factory("Blog", "IndexController").is_some());
        assert!(lib.controller_factory("Default", "IndexController").is_none());
    }
}
