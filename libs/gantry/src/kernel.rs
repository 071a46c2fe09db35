use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{Html, IntoResponse};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use gantry_bootstrap::config::{current_env, AppConfig};

use crate::config::{ConfigError, ConfigStore};
use crate::contracts::{ArcHandler, Controller, Flow, Request, Response};
use crate::extensions::{self, ExtensionDecl, ExtensionError, ExtensionSource, LoadedExtension};
use crate::library::Library;
use crate::middleware::{instantiate_list, MiddlewareError, MiddlewareId};
use crate::module::{
    self, ModuleError, ModuleOptions, ModuleRecord, ModuleSource, PendingModule, SetupConfig,
};
use crate::routes::{build_module_router, normalize_prefix, prefix_matches, RouteError};

/// Bootstrap phases, entered strictly in declaration order. `Serving` is
/// reached only after the HTTP listener is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    ConfigLoaded,
    ModulesLoaded,
    ExtensionsLoaded,
    HeadMiddlewareInstalled,
    RoutesInstalled,
    TailMiddlewareInstalled,
    Serving,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid library registration:\n{errors:#?}")]
    Library { errors: Vec<String> },
    #[error("serializing application config failed")]
    AppConfig {
        #[source]
        source: serde_json::Error,
    },
    #[error("`gantry:extensions` is not a valid extension list")]
    ExtensionSection {
        #[source]
        source: serde_json::Error,
    },
    #[error("`gantry:modules` is not a valid module table")]
    ModuleSection {
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// All bootstrap state, owned by the kernel and passed explicitly to
/// every loader, resolver and installer. Registries are touched only
/// from the single bootstrap call stack; once bootstrap completes the
/// context is effectively read-only.
pub struct AppContext {
    pub env: String,
    pub base_dir: PathBuf,
    pub config: ConfigStore,
    pub(crate) library: Library,
    pub(crate) modules: Vec<ModuleRecord>,
    pub(crate) extensions: Vec<ExtensionDecl>,
    pub(crate) loaded_extensions: HashMap<ExtensionSource, LoadedExtension>,
    pub(crate) middleware: HashMap<MiddlewareId, ArcHandler>,
    pub(crate) controllers: HashMap<String, Arc<dyn Controller>>,
    pub(crate) response_headers: Vec<(http::HeaderName, http::HeaderValue)>,
}

impl AppContext {
    pub(crate) fn new(env: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            env: env.into(),
            base_dir: base_dir.into(),
            config: ConfigStore::new(),
            library: Library::new(),
            modules: Vec::new(),
            extensions: Vec::new(),
            loaded_extensions: HashMap::new(),
            middleware: HashMap::new(),
            controllers: HashMap::new(),
            response_headers: Vec::new(),
        }
    }

    /// Attach a header to every response, unless a handler already set
    /// it. Typically called from extension entry points.
    pub fn add_response_header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let name = name.parse::<http::HeaderName>()?;
        let value = value.parse::<http::HeaderValue>()?;
        self.response_headers.push((name, value));
        Ok(())
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut Library {
        &mut self.library
    }

    pub fn modules(&self) -> &[ModuleRecord] {
        &self.modules
    }

    /// Register an additional module at load time. Extensions use this to
    /// contribute routes or module-scoped middleware; extension
    /// declarations on such modules are ignored, since the load sequence
    /// is already fixed.
    pub fn register_module(
        &mut self,
        name: &str,
        options: ModuleOptions,
        mut setup: SetupConfig,
    ) -> Result<(), ModuleError> {
        if !setup.extensions.is_empty() {
            tracing::warn!(
                module = name,
                "extensions declared on a runtime-registered module are ignored"
            );
            setup.extensions.clear();
        }
        module::load_module(
            self,
            PendingModule {
                name: name.to_string(),
                options,
                source: ModuleSource::Inline(setup),
            },
        )
    }
}

/// Kernel construction options.
pub struct KernelOptions {
    /// Base directory for module folders; defaults to the working
    /// directory.
    pub base_dir: PathBuf,
    /// Environment override; defaults to `APP_ENV` / `production`.
    pub env: Option<String>,
    /// Layered application configuration.
    pub app_config: AppConfig,
    /// Host application name, surfaced at `gantry:package:name`.
    pub app_name: Option<String>,
    /// Host application version, surfaced at `gantry:package:version`.
    pub app_version: Option<String>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: None,
            app_config: AppConfig::default(),
            app_name: None,
            app_version: None,
        }
    }
}

type PhaseObserver = Box<dyn Fn(Phase) + Send + Sync>;

/// The bootstrap orchestrator: sequences configuration, module loading,
/// extension resolution, middleware instantiation and route installation,
/// then serves the composed router.
pub struct Kernel {
    options: KernelOptions,
    ctx: AppContext,
    pending: Vec<PendingModule>,
    observers: Vec<PhaseObserver>,
    phase: Phase,
    bootstrapped: bool,
    router: Option<Router>,
}

impl Kernel {
    pub fn new(options: KernelOptions) -> Self {
        let env = options
            .env
            .clone()
            .unwrap_or_else(current_env);
        let ctx = AppContext::new(env, options.base_dir.clone());
        Self {
            options,
            ctx,
            pending: Vec::new(),
            observers: Vec::new(),
            phase: Phase::Unconfigured,
            bootstrapped: false,
            router: None,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn library_mut(&mut self) -> &mut Library {
        &mut self.ctx.library
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The composed application router; available once bootstrap ran.
    pub fn router(&self) -> Option<Router> {
        self.router.clone()
    }

    /// Queue a code-declared module; processed before the configuration's
    /// module table, in registration order.
    pub fn add_module(&mut self, name: &str, options: ModuleOptions, setup: SetupConfig) {
        self.pending.push(PendingModule {
            name: name.to_string(),
            options,
            source: ModuleSource::Inline(setup),
        });
    }

    /// Observe phase transitions.
    pub fn on_phase<F>(&mut self, observer: F)
    where
        F: Fn(Phase) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        tracing::info!(phase = ?phase, "bootstrap phase");
        for observer in &self.observers {
            observer(phase);
        }
    }

    /// Run the bootstrap pipeline once. A second call is a silent no-op;
    /// any failure aborts the whole bootstrap with no partial rollback.
    pub fn bootstrap(&mut self) -> Result<(), BootstrapError> {
        if self.bootstrapped {
            tracing::debug!("bootstrap already ran; ignoring repeated call");
            return Ok(());
        }

        if !self.ctx.library.errors().is_empty() {
            return Err(BootstrapError::Library {
                errors: self.ctx.library.errors().to_vec(),
            });
        }

        self.load_config()?;
        self.set_phase(Phase::ConfigLoaded);

        self.load_modules()?;
        self.set_phase(Phase::ModulesLoaded);

        extensions::load_extensions(&mut self.ctx)?;
        self.set_phase(Phase::ExtensionsLoaded);

        // Module records are frozen from here on; extensions had their
        // chance to contribute more.
        let records: Vec<ModuleRecord> = self.ctx.modules.clone();

        let head = self.install_head_middleware(&records)?;
        self.set_phase(Phase::HeadMiddlewareInstalled);

        let mut app = Router::new();
        for record in &records {
            let module_router = build_module_router(&mut self.ctx, record)?;
            let prefix = normalize_prefix(&record.options.prefix);
            if prefix == "/" {
                app = app.merge(module_router);
            } else {
                app = app.nest(&prefix, module_router);
            }
            tracing::info!(module = %record.name, prefix = %prefix, "module mounted");
        }
        self.set_phase(Phase::RoutesInstalled);

        let tails = self.install_tail_middleware(&records)?;
        self.set_phase(Phase::TailMiddlewareInstalled);

        app = self.finish_router(app, head, tails, &records);
        self.router = Some(app);
        self.bootstrapped = true;
        Ok(())
    }

    fn load_config(&mut self) -> Result<(), BootstrapError> {
        self.ctx.config.set("gantry", default_kernel_config())?;

        let app_value = serde_json::to_value(&self.options.app_config)
            .map_err(|source| BootstrapError::AppConfig { source })?;
        self.ctx.config.merge_over("gantry", app_value)?;

        if let Some(name) = &self.options.app_name {
            self.ctx
                .config
                .set("gantry:package:name", json!(name))?;
        }
        if let Some(version) = &self.options.app_version {
            self.ctx
                .config
                .set("gantry:package:version", json!(version))?;
        }

        let raw = self
            .ctx
            .config
            .get_or("gantry:extensions", Value::Array(Vec::new()));
        self.ctx.extensions = serde_json::from_value(raw)
            .map_err(|source| BootstrapError::ExtensionSection { source })?;
        Ok(())
    }

    fn load_modules(&mut self) -> Result<(), BootstrapError> {
        for pending in std::mem::take(&mut self.pending) {
            module::load_module(&mut self.ctx, pending)?;
        }

        let raw = self
            .ctx
            .config
            .get_or("gantry:modules", Value::Object(Map::new()));
        let table: BTreeMap<String, Value> = serde_json::from_value(raw)
            .map_err(|source| BootstrapError::ModuleSection { source })?;

        for (name, options_value) in table {
            let options: ModuleOptions = serde_json::from_value(options_value).map_err(
                |source| ModuleError::BadOptions {
                    module: name.clone(),
                    source,
                },
            )?;
            let root = options
                .path
                .clone()
                .map(|p| {
                    if p.is_absolute() {
                        p
                    } else {
                        self.ctx.base_dir.join(p)
                    }
                })
                .unwrap_or_else(|| self.ctx.base_dir.join("modules").join(&name));
            module::load_module(
                &mut self.ctx,
                PendingModule {
                    name,
                    options,
                    source: ModuleSource::Dir(root),
                },
            )?;
        }
        Ok(())
    }

    fn install_head_middleware(
        &mut self,
        records: &[ModuleRecord],
    ) -> Result<Vec<(String, ArcHandler)>, MiddlewareError> {
        let mut head = Vec::new();
        for record in records {
            let handlers =
                instantiate_list(&mut self.ctx, &record.name, &record.setup.middleware.head)?;
            let prefix = normalize_prefix(&record.options.prefix);
            for handler in handlers {
                head.push((prefix.clone(), handler));
            }
        }
        Ok(head)
    }

    fn install_tail_middleware(
        &mut self,
        records: &[ModuleRecord],
    ) -> Result<Vec<(String, Arc<[ArcHandler]>)>, MiddlewareError> {
        let mut tails = Vec::new();
        for record in records {
            let handlers =
                instantiate_list(&mut self.ctx, &record.name, &record.setup.middleware.tail)?;
            if !handlers.is_empty() {
                let prefix = normalize_prefix(&record.options.prefix);
                tails.push((prefix, handlers.into()));
            }
        }
        Ok(tails)
    }

    /// Attach the fallback (tail middleware, then the 404 responder),
    /// head middleware layers and the ambient server layers.
    fn finish_router(
        &mut self,
        mut app: Router,
        head: Vec<(String, ArcHandler)>,
        tails: Vec<(String, Arc<[ArcHandler]>)>,
        records: &[ModuleRecord],
    ) -> Router {
        let not_found_page = self
            .ctx
            .config
            .get_str("gantry:options:error_pages:404:view_template")
            .and_then(|template| {
                let path = PathBuf::from(&template);
                let path = if path.is_absolute() {
                    path
                } else {
                    self.ctx.base_dir.join(path)
                };
                match std::fs::read_to_string(&path) {
                    Ok(content) => Some(Arc::new(content)),
                    Err(e) => {
                        tracing::warn!(
                            template = %path.display(),
                            error = %e,
                            "404 view template is not readable"
                        );
                        None
                    }
                }
            });

        let no_view: Vec<String> = records
            .iter()
            .filter(|r| r.options.disable_view_engine)
            .map(|r| normalize_prefix(&r.options.prefix))
            .collect();

        let state = FallbackState {
            env: self.ctx.env.clone(),
            tails: tails.into(),
            not_found_page,
            no_view: no_view.into(),
        };
        app = app.fallback(move |req: Request| {
            let state = state.clone();
            async move { dispatch_fallback(state, req).await }
        });

        // Head middleware runs in declaration order, scoped to its
        // module's prefix; the last layer added ends up outermost.
        for (prefix, handler) in head.into_iter().rev() {
            app = app.layer(axum::middleware::from_fn(
                move |req: Request, next: Next| {
                    let handler = handler.clone();
                    let prefix = prefix.clone();
                    async move {
                        if !prefix_matches(&prefix, req.uri().path()) {
                            return next.run(req).await;
                        }
                        match handler.call(req).await {
                            Flow::Continue(passed) => next.run(passed).await,
                            Flow::Done(resp) => resp,
                        }
                    }
                },
            ));
        }

        for (name, value) in self.ctx.response_headers.clone() {
            app = app.layer(SetResponseHeaderLayer::if_not_present(name, value));
        }

        app = app.layer(PropagateRequestIdLayer::x_request_id());
        app = app.layer(TraceLayer::new_for_http());
        if let Some(timeout) = self.ctx.config.get_u64("gantry:server:timeout_sec") {
            if timeout > 0 {
                app = app.layer(TimeoutLayer::new(Duration::from_secs(timeout)));
            }
        }
        app.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Bootstrap if needed, bind the HTTP listener and serve until the
    /// token cancels.
    pub async fn serve_with_shutdown(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.bootstrap()?;
        let Some(router) = self.router.clone() else {
            anyhow::bail!("bootstrap did not produce a router");
        };

        let host = self
            .ctx
            .config
            .get_str("gantry:server:host")
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .or_else(|| {
                self.ctx
                    .config
                    .get_u64("gantry:server:port")
                    .map(|p| p as u16)
            })
            .unwrap_or(3000);

        let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
        self.set_phase(Phase::Serving);
        tracing::info!(%host, port, env = %self.ctx.env, "listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    /// Bootstrap and serve, shutting down on SIGINT/SIGTERM.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let waiter = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = gantry_bootstrap::wait_for_shutdown().await {
                tracing::warn!(error = %e, "signal waiter failed; falling back to ctrl_c");
                let _ = tokio::signal::ctrl_c().await;
            }
            waiter.cancel();
        });
        self.serve_with_shutdown(cancel).await
    }
}

fn default_kernel_config() -> Value {
    json!({
        "options": {
            "error_pages": {
                "404": {}
            }
        }
    })
}

/// Page served for unmatched browser requests when the application does
/// not configure `gantry:options:error_pages:404:view_template`.
const DEFAULT_404_PAGE: &str = include_str!("../templates/404.html");

#[derive(Clone)]
struct FallbackState {
    env: String,
    tails: Arc<[(String, Arc<[ArcHandler]>)]>,
    not_found_page: Option<Arc<String>>,
    no_view: Arc<[String]>,
}

/// Unmatched requests: tail middleware of every prefix-matching module in
/// module order, then the 404 responder.
async fn dispatch_fallback(state: FallbackState, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let mut req = req;
    for (prefix, handlers) in state.tails.iter() {
        if !prefix_matches(prefix, &path) {
            continue;
        }
        for handler in handlers.iter() {
            match handler.call(req).await {
                Flow::Continue(passed) => req = passed,
                Flow::Done(resp) => return resp,
            }
        }
    }
    not_found(&state, &path, &req)
}

fn not_found(state: &FallbackState, path: &str, req: &Request) -> Response {
    let message = if state.env == "development" {
        format!("404 - Not found: {path}")
    } else {
        "404 - Not found!".to_string()
    };

    let xhr = req
        .headers()
        .get("x-requested-with")
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"XMLHttpRequest"));
    if xhr {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": message, "error_code": 404 })),
        )
            .into_response();
    }

    let view_disabled = state.no_view.iter().any(|p| prefix_matches(p, path));
    if view_disabled {
        return (StatusCode::NOT_FOUND, Html(format!("<h1>{message}</h1>"))).into_response();
    }

    // Configured or built-in page; `{message}` is the one substitution.
    let page = match &state.not_found_page {
        Some(page) => page.replace("{message}", &message),
        None => DEFAULT_404_PAGE.replace("{message}", &message),
    };
    (StatusCode::NOT_FOUND, Html(page)).into_response()
}

/// Request-id generator for the ambient `x-request-id` layers.
#[derive(Clone, Copy, Default)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::new_v4().to_string();
        http::HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_twice_is_a_noop() {
        let mut kernel = Kernel::new(KernelOptions {
            env: Some("production".to_string()),
            ..KernelOptions::default()
        });
        kernel.bootstrap().expect("first bootstrap");
        assert_eq!(kernel.phase(), Phase::TailMiddlewareInstalled);
        kernel.bootstrap().expect("second bootstrap");
        assert!(kernel.router().is_some());
    }

    #[test]
    fn library_registration_errors_fail_bootstrap() {
        let mut kernel = Kernel::new(KernelOptions {
            env: Some("production".to_string()),
            ..KernelOptions::default()
        });
        let handler =
            crate::contracts::handler_fn(|_req| async { Flow::done(StatusCode::OK) });
        kernel.library_mut().register_middleware_handler("dup", handler.clone());
        kernel.library_mut().register_middleware_handler("dup", handler);
        assert!(matches!(
            kernel.bootstrap(),
            Err(BootstrapError::Library { .. })
        ));
    }

    #[test]
    fn phase_observers_see_every_transition() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut kernel = Kernel::new(KernelOptions {
            env: Some("production".to_string()),
            ..KernelOptions::default()
        });
        kernel.on_phase(move |phase| {
            if let Ok(mut v) = sink.lock() {
                v.push(phase);
            }
        });
        kernel.bootstrap().expect("bootstrap");

        let phases = seen.lock().expect("lock").clone();
        assert_eq!(
            phases,
            vec![
                Phase::ConfigLoaded,
                Phase::ModulesLoaded,
                Phase::ExtensionsLoaded,
                Phase::HeadMiddlewareInstalled,
                Phase::RoutesInstalled,
                Phase::TailMiddlewareInstalled,
            ]
        );
    }

    #[test]
    fn package_info_lands_in_config() {
        let mut kernel = Kernel::new(KernelOptions {
            env: Some("production".to_string()),
            app_name: Some("demo-app".to_string()),
            app_version: Some("1.2.3".to_string()),
            ..KernelOptions::default()
        });
        kernel.bootstrap().expect("bootstrap");
        assert_eq!(
            kernel.context().config.get_str("gantry:package:name"),
            Some("demo-app".to_string())
        );
        assert_eq!(
            kernel.context().config.get_str("gantry:package:version"),
            Some("1.2.3".to_string())
        );
    }
}
