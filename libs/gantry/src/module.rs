use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::extensions::ExtensionDecl;
use crate::kernel::AppContext;
use crate::middleware::MiddlewareDecl;

/// Per-module options from the application's module table.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleOptions {
    pub disabled: bool,
    /// URL prefix the module's router mounts under.
    pub prefix: String,
    /// Skip the 404 view template for requests falling through this module.
    pub disable_view_engine: bool,
    /// Module directory; defaults to `<base>/modules/<Name>`.
    pub path: Option<PathBuf>,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            prefix: "/".to_string(),
            disable_view_engine: false,
            path: None,
        }
    }
}

/// Conventional folder layout inside a module directory.
#[derive(Clone, Debug)]
pub struct ModuleFolders {
    pub root: PathBuf,
    pub setup: PathBuf,
    pub configs: PathBuf,
    pub controllers: PathBuf,
    pub models: PathBuf,
    pub middleware: PathBuf,
    pub params: PathBuf,
    pub views: PathBuf,
    pub extensions: PathBuf,
    pub i18n: PathBuf,
    pub assets: PathBuf,
}

impl ModuleFolders {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            setup: root.join("setup"),
            configs: root.join("setup").join("configs"),
            controllers: root.join("controllers"),
            models: root.join("models"),
            middleware: root.join("middleware"),
            params: root.join("params"),
            views: root.join("views"),
            extensions: root.join("extensions"),
            i18n: root.join("i18n"),
            assets: root.join("assets"),
            root,
        }
    }
}

/// Declarative setup descriptor: params, middleware stages, extensions
/// and routes.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupConfig {
    pub params: BTreeMap<String, ParamRule>,
    pub middleware: MiddlewareStages,
    pub extensions: Vec<ExtensionDecl>,
    pub routes: Vec<RouteDecl>,
}

/// Module-global middleware, installed before (head) or behind (tail)
/// all of the module's routes.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiddlewareStages {
    pub head: Vec<MiddlewareDecl>,
    pub tail: Vec<MiddlewareDecl>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteDecl {
    pub description: Option<String>,
    pub pattern: String,
    /// `"Name[.actionAction[.method,...]]"` references; empty is legal
    /// for modules that only exist to pull in extensions.
    pub controllers: Vec<String>,
    pub middleware: RouteStages,
    pub params: BTreeMap<String, ParamRule>,
    pub disabled: bool,
}

/// Middleware around one route's controller actions.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouteStages {
    pub before: Vec<MiddlewareDecl>,
    pub after: Vec<MiddlewareDecl>,
}

/// Validation rule for a path parameter: a bare string is a regular
/// expression, an object references a registered validator.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ParamRule {
    Pattern(String),
    Validator { validator: String },
}

/// A fully loaded module. Immutable once the loader finishes with it.
#[derive(Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub options: ModuleOptions,
    pub folders: Option<ModuleFolders>,
    pub setup: SetupConfig,
}

/// How a pending module's setup descriptor is obtained.
pub(crate) enum ModuleSource {
    Inline(SetupConfig),
    Dir(PathBuf),
}

pub(crate) struct PendingModule {
    pub name: String,
    pub options: ModuleOptions,
    pub source: ModuleSource,
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module name must be a non-empty string")]
    EmptyName,
    #[error("module name `gantry` is reserved for the framework")]
    ReservedName,
    #[error("invalid options for module `{module}`")]
    BadOptions {
        module: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("module `{module}`: cannot read `{path}`")]
    Io {
        module: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("module `{module}`: `{path}` is not a valid setup or config file")]
    BadFile {
        module: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Load one module: per-environment configs into the store, the setup
/// descriptor, and its extension declarations into the global list.
pub(crate) fn load_module(ctx: &mut AppContext, pending: PendingModule) -> Result<(), ModuleError> {
    let name = pending.name.trim().to_string();
    if name.is_empty() {
        return Err(ModuleError::EmptyName);
    }
    if name.eq_ignore_ascii_case("gantry") {
        return Err(ModuleError::ReservedName);
    }
    if pending.options.disabled {
        tracing::info!(module = %name, "module disabled, skipping");
        return Ok(());
    }

    tracing::info!(module = %name, "loading module");

    let (folders, setup) = match pending.source {
        ModuleSource::Inline(setup) => (None, setup),
        ModuleSource::Dir(root) => {
            let folders = ModuleFolders::new(root);
            load_config_dir(ctx, &name, &folders.configs)?;
            let setup_path = folders.setup.join("setup.json");
            let raw = std::fs::read_to_string(&setup_path).map_err(|source| ModuleError::Io {
                module: name.clone(),
                path: setup_path.clone(),
                source,
            })?;
            let setup: SetupConfig =
                serde_json::from_str(&raw).map_err(|source| ModuleError::BadFile {
                    module: name.clone(),
                    path: setup_path,
                    source,
                })?;
            (Some(folders), setup)
        }
    };

    merge_extension_decls(&mut ctx.extensions, setup.extensions.clone(), &name);

    ctx.modules.push(ModuleRecord {
        name,
        options: pending.options,
        folders,
        setup,
    });
    Ok(())
}

/// Load every JSON file in the module's config folder under
/// `<module>:<file-stem>`, then overlay the environment-specific folder
/// (environment values win). Files are processed in sorted order.
fn load_config_dir(ctx: &mut AppContext, module: &str, dir: &Path) -> Result<(), ModuleError> {
    if !dir.is_dir() {
        tracing::warn!(module, "module has no configuration folder");
        return Ok(());
    }
    let section = module.to_lowercase();
    merge_config_files(ctx, module, &section, dir)?;

    let env_dir = dir.join(&ctx.env);
    if env_dir.is_dir() {
        merge_config_files(ctx, module, &section, &env_dir)?;
    } else {
        tracing::debug!(module, env = %ctx.env, "no environment configs");
    }
    Ok(())
}

fn merge_config_files(
    ctx: &mut AppContext,
    module: &str,
    section: &str,
    dir: &Path,
) -> Result<(), ModuleError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| ModuleError::Io {
            module: module.to_string(),
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let stem = stem.to_lowercase();
        if stem.is_empty() {
            continue;
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ModuleError::Io {
            module: module.to_string(),
            path: path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| ModuleError::BadFile {
            module: module.to_string(),
            path: path.clone(),
            source,
        })?;
        ctx.config.merge_over(&format!("{section}:{stem}"), value)?;
        tracing::info!(module, config = %stem, file = %path.display(), "config loaded");
    }
    Ok(())
}

/// Overlay module-declared extensions onto the global list, keyed by
/// content identity. Matching entries merge field-wise (overlay wins,
/// dependency lists union); new entries are stamped with the declaring
/// module and appended.
pub(crate) fn merge_extension_decls(
    global: &mut Vec<ExtensionDecl>,
    incoming: Vec<ExtensionDecl>,
    owner: &str,
) {
    for mut ext in incoming {
        let matched = global
            .iter_mut()
            .find(|g| g.content_identity() == ext.content_identity());
        match matched {
            Some(existing) => overlay_decl(existing, ext),
            None => {
                if ext.file.is_some() && ext.provider_module.is_none() {
                    ext.owner_module = Some(owner.to_string());
                }
                global.push(ext);
            }
        }
    }
}

fn overlay_decl(base: &mut ExtensionDecl, overlay: ExtensionDecl) {
    if !overlay.name.trim().is_empty() {
        base.name = overlay.name;
    }
    base.disabled = overlay.disabled;
    for dep in overlay.dependencies {
        if !base.dependencies.contains(&dep) {
            base.dependencies.push(dep);
        }
    }
    for target in overlay.is_dependency_for {
        if !base.is_dependency_for.contains(&target) {
            base.is_dependency_for.push(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::AppContext;
    use serde_json::json;

    fn ctx(env: &str) -> AppContext {
        AppContext::new(env, std::env::temp_dir())
    }

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, content).expect("write");
    }

    #[test]
    fn environment_configs_overlay_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("Blog");
        write(
            &root.join("setup/configs/common.json"),
            r#"{"per_page": 10, "title": "blog"}"#,
        );
        write(
            &root.join("setup/configs/development/common.json"),
            r#"{"per_page": 3}"#,
        );
        write(&root.join("setup/setup.json"), r#"{"routes": []}"#);

        let mut ctx = ctx("development");
        load_module(
            &mut ctx,
            PendingModule {
                name: "Blog".to_string(),
                options: ModuleOptions::default(),
                source: ModuleSource::Dir(root.clone()),
            },
        )
        .expect("load");

        assert_eq!(ctx.config.get_u64("blog:common:per_page"), Some(3));
        assert_eq!(
            ctx.config.get_str("blog:common:title"),
            Some("blog".to_string())
        );

        let mut prod = AppContext::new("production", std::env::temp_dir());
        load_module(
            &mut prod,
            PendingModule {
                name: "Blog".to_string(),
                options: ModuleOptions::default(),
                source: ModuleSource::Dir(root),
            },
        )
        .expect("load");
        assert_eq!(prod.config.get_u64("blog:common:per_page"), Some(10));
    }

    #[test]
    fn setup_descriptor_is_parsed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("Blog");
        write(
            &root.join("setup/setup.json"),
            r#"{
                "params": {"post_id": "^[0-9]+$"},
                "middleware": {"head": [{"package": "logger"}]},
                "extensions": [{"name": "Feeds", "file": "feeds"}],
                "routes": [
                    {"pattern": "/", "controllers": ["IndexController.indexAction"]}
                ]
            }"#,
        );

        let mut ctx = ctx("production");
        load_module(
            &mut ctx,
            PendingModule {
                name: "Blog".to_string(),
                options: ModuleOptions::default(),
                source: ModuleSource::Dir(root),
            },
        )
        .expect("load");

        let record = &ctx.modules[0];
        assert_eq!(record.setup.routes.len(), 1);
        assert_eq!(record.setup.middleware.head.len(), 1);
        // Module-declared file extension got stamped with its owner.
        assert_eq!(
            ctx.extensions[0].owner_module.as_deref(),
            Some("Blog")
        );
    }

    #[test]
    fn disabled_modules_are_skipped() {
        let mut ctx = ctx("production");
        load_module(
            &mut ctx,
            PendingModule {
                name: "Gone".to_string(),
                options: ModuleOptions {
                    disabled: true,
                    ..ModuleOptions::default()
                },
                source: ModuleSource::Inline(SetupConfig::default()),
            },
        )
        .expect("load");
        assert!(ctx.modules.is_empty());
    }

    #[test]
    fn reserved_and_empty_names_are_rejected() {
        let mut ctx = ctx("production");
        let reserved = load_module(
            &mut ctx,
            PendingModule {
                name: "gantry".to_string(),
                options: ModuleOptions::default(),
                source: ModuleSource::Inline(SetupConfig::default()),
            },
        );
        assert!(matches!(reserved, Err(ModuleError::ReservedName)));

        let empty = load_module(
            &mut ctx,
            PendingModule {
                name: "  ".to_string(),
                options: ModuleOptions::default(),
                source: ModuleSource::Inline(SetupConfig::default()),
            },
        );
        assert!(matches!(empty, Err(ModuleError::EmptyName)));
    }

    #[test]
    fn extension_merge_dedups_by_content_identity() {
        let mut global = vec![ExtensionDecl {
            name: "Mailer".to_string(),
            package: Some("mailer".to_string()),
            dependencies: vec!["Logger".to_string()],
            ..ExtensionDecl::default()
        }];
        let incoming = vec![
            ExtensionDecl {
                name: "Mailer Override".to_string(),
                package: Some("mailer".to_string()),
                dependencies: vec!["Templates".to_string(), "Logger".to_string()],
                ..ExtensionDecl::default()
            },
            ExtensionDecl {
                name: "Feeds".to_string(),
                file: Some("feeds".to_string()),
                ..ExtensionDecl::default()
            },
        ];

        merge_extension_decls(&mut global, incoming, "Blog");

        assert_eq!(global.len(), 2);
        assert_eq!(global[0].name, "Mailer Override");
        assert_eq!(global[0].dependencies, vec!["Logger", "Templates"]);
        assert_eq!(global[1].owner_module.as_deref(), Some("Blog"));
    }

    #[test]
    fn param_rules_deserialize_both_shapes() {
        let setup: SetupConfig = serde_json::from_value(json!({
            "params": {
                "id": "^[0-9]+$",
                "slug": {"validator": "slug-check"}
            }
        }))
        .expect("parse");
        assert!(matches!(setup.params.get("id"), Some(ParamRule::Pattern(_))));
        assert!(matches!(
            setup.params.get("slug"),
            Some(ParamRule::Validator { .. })
        ));
    }
}
