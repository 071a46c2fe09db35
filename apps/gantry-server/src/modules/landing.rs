use std::sync::Arc;

use axum::response::Html;

use gantry::{
    handler_fn, ArcHandler, Controller, Flow, Kernel, MiddlewareDecl, ModuleOptions, RouteDecl,
    SetupConfig,
};

/// Landing pages at the application root.
struct IndexController;

impl Controller for IndexController {
    fn action(self: Arc<Self>, name: &str) -> Option<ArcHandler> {
        match name {
            "indexAction" => Some(handler_fn(|_req| async {
                Flow::done(Html(
                    "<h1>It works!</h1><p>This application runs on gantry.</p>",
                ))
            })),
            "healthAction" => Some(handler_fn(|_req| async { Flow::done("ok") })),
            _ => None,
        }
    }
}

fn request_logger() -> ArcHandler {
    handler_fn(|req| async move {
        tracing::info!(method = %req.method(), path = %req.uri().path(), "request");
        Flow::Continue(req)
    })
}

pub fn register(kernel: &mut Kernel) {
    kernel
        .library_mut()
        .register_controller("Default", "IndexController", || IndexController)
        .register_middleware_handler("request-logger", request_logger());

    let mut setup = SetupConfig::default();
    setup.middleware.head = vec![MiddlewareDecl {
        name: Some("Request Logger".to_string()),
        package: Some("request-logger".to_string()),
        ..MiddlewareDecl::default()
    }];
    setup.routes = vec![
        RouteDecl {
            description: Some("Landing page".to_string()),
            pattern: "/".to_string(),
            controllers: vec!["IndexController.indexAction".to_string()],
            ..RouteDecl::default()
        },
        RouteDecl {
            description: Some("Liveness probe".to_string()),
            pattern: "/healthz".to_string(),
            controllers: vec!["IndexController.healthAction.get".to_string()],
            ..RouteDecl::default()
        },
    ];

    kernel.add_module("Default", ModuleOptions::default(), setup);
}
