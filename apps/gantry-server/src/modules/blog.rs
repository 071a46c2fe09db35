use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Html;

use gantry::{
    handler_fn, AppContext, ArcHandler, Controller, ExtensionDecl, Flow, Kernel, ModuleOptions,
    ParamRule, RouteDecl, SetupConfig,
};

/// Blog pages, mounted under `/blog`.
struct IndexController {
    /// Site title, resolved from configuration during init.
    title: std::sync::OnceLock<String>,
}

impl IndexController {
    fn new() -> Self {
        Self {
            title: std::sync::OnceLock::new(),
        }
    }

    fn title(&self) -> &str {
        self.title.get().map(String::as_str).unwrap_or("Blog")
    }
}

impl Controller for IndexController {
    fn init(&self, ctx: &AppContext) -> anyhow::Result<()> {
        let title = ctx
            .config
            .get_str("blog:settings:title")
            .unwrap_or_else(|| "Blog".to_string());
        let _ = self.title.set(title);
        Ok(())
    }

    fn action(self: Arc<Self>, name: &str) -> Option<ArcHandler> {
        match name {
            "indexAction" => {
                let me = self.clone();
                Some(handler_fn(move |_req| {
                    let me = me.clone();
                    async move {
                        Flow::done(Html(format!(
                            "<h1>{}</h1><ul><li><a href=\"/blog/1\">First post</a></li></ul>",
                            me.title()
                        )))
                    }
                }))
            }
            "showAction" => {
                let me = self.clone();
                Some(handler_fn(move |req| {
                    let me = me.clone();
                    async move {
                        let post_id = req
                            .uri()
                            .path()
                            .rsplit('/')
                            .next()
                            .unwrap_or_default()
                            .to_string();
                        match post_id.as_str() {
                            "1" => Flow::done(Html(format!(
                                "<h1>{}: post 1</h1><p>Hello from gantry.</p>",
                                me.title()
                            ))),
                            _ => Flow::done((StatusCode::NOT_FOUND, "no such post")),
                        }
                    }
                }))
            }
            _ => None,
        }
    }
}

pub fn register(kernel: &mut Kernel) {
    kernel
        .library_mut()
        .register_controller("Blog", "IndexController", IndexController::new);

    let mut setup = SetupConfig::default();
    // The blog pulls the powered-header extension in; the kernel dedups
    // it against any global declaration by content identity.
    setup.extensions = vec![ExtensionDecl {
        name: "Powered Header".to_string(),
        package: Some("powered".to_string()),
        ..ExtensionDecl::default()
    }];
    let mut show = RouteDecl {
        description: Some("Single post".to_string()),
        pattern: "/{post_id}".to_string(),
        controllers: vec!["IndexController.showAction.get".to_string()],
        ..RouteDecl::default()
    };
    show.params.insert(
        "post_id".to_string(),
        ParamRule::Pattern("^[0-9]+$".to_string()),
    );
    setup.routes = vec![
        RouteDecl {
            description: Some("Post listing".to_string()),
            pattern: "/".to_string(),
            controllers: vec!["IndexController.indexAction".to_string()],
            ..RouteDecl::default()
        },
        show,
    ];

    kernel.add_module(
        "Blog",
        ModuleOptions {
            prefix: "/blog".to_string(),
            ..ModuleOptions::default()
        },
        setup,
    );
}
