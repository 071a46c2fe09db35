//! # Gantry: a modular web application kernel
//!
//! Applications are assembled from vertical slices called modules, each
//! mounted under a URL prefix with its own controllers, middleware,
//! params and configuration. Extensions plug into bootstrap with
//! dependency-ordered, exactly-once loading.
//!
//! Controllers, middleware and extensions are plain Rust values
//! registered in a [`Library`] before bootstrap; setup descriptors
//! reference them by key, so there is no loading-by-path at runtime.
//!
//! ```rust,no_run
//! use gantry::{Kernel, KernelOptions, ModuleOptions, SetupConfig};
//!
//! # fn setup() -> SetupConfig { SetupConfig::default() }
//! # async fn demo() -> anyhow::Result<()> {
//! let mut kernel = Kernel::new(KernelOptions::default());
//! kernel
//!     .library_mut()
//!     .register_controller("Blog", "IndexController", || BlogIndex);
//! kernel.add_module("Blog", ModuleOptions { prefix: "/blog".into(), ..Default::default() }, setup());
//! kernel.run().await
//! # }
//! # struct BlogIndex;
//! # impl gantry::Controller for BlogIndex {
//! #     fn action(self: std::sync::Arc<Self>, _: &str) -> Option<gantry::ArcHandler> { None }
//! # }
//! ```

pub mod config;
pub mod contracts;
pub mod extensions;
pub mod kernel;
pub mod library;
pub mod middleware;
pub mod module;
pub mod routes;

pub use config::{ConfigError, ConfigStore};
pub use contracts::{
    handler_fn, ArcHandler, Controller, Extension, Flow, HandlerHost, MiddlewareFactory,
    ParamValidatorFn, Request, Response, RouteHandler,
};
pub use extensions::{ExtensionDecl, ExtensionError, ExtensionSource};
pub use kernel::{AppContext, BootstrapError, Kernel, KernelOptions, Phase};
pub use library::{ExtensionKey, Library, MiddlewareSource};
pub use middleware::{MiddlewareDecl, MiddlewareError};
pub use module::{
    MiddlewareStages, ModuleError, ModuleFolders, ModuleOptions, ModuleRecord, ParamRule,
    RouteDecl, RouteStages, SetupConfig,
};
pub use routes::{HttpMethod, RouteError};

// Re-exported for implementors of the async contracts.
pub use async_trait::async_trait;
