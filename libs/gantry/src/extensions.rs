use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::contracts::Extension;
use crate::kernel::AppContext;
use crate::library::ExtensionKey;

/// Where an extension's code comes from. This value doubles as the
/// extension's content identity (EUID): two declarations with equal
/// sources are the same extension, whatever their names say.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExtensionSource {
    /// A package registered in the library under a global name.
    Package { package: String },
    /// A file shipped by another module's extensions folder.
    ModuleFile { module: String, file: String },
    /// A file local to the module that declared the extension; the owner
    /// is stamped when module declarations merge into the global list.
    LocalFile { owner: String, file: String },
}

impl ExtensionSource {
    pub(crate) fn library_key(&self) -> ExtensionKey {
        match self {
            ExtensionSource::Package { package } => ExtensionKey::Package(package.clone()),
            ExtensionSource::ModuleFile { module, file } => ExtensionKey::ModuleFile {
                module: module.clone(),
                file: file.clone(),
            },
            ExtensionSource::LocalFile { owner, file } => ExtensionKey::ModuleFile {
                module: owner.clone(),
                file: file.clone(),
            },
        }
    }
}

/// One entry of the global extensions collection.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionDecl {
    pub name: String,
    /// File within a module's extensions namespace.
    pub file: Option<String>,
    /// Package key registered in the library.
    pub package: Option<String>,
    /// Module providing `file` when it is not the declaring module.
    pub provider_module: Option<String>,
    /// Declaring module; stamped during merge, never read from config.
    #[serde(skip)]
    pub owner_module: Option<String>,
    /// Names of extensions that must load before this one.
    pub dependencies: Vec<String>,
    /// Names of extensions this one must load before. Rewritten into the
    /// targets' `dependencies` during normalization.
    pub is_dependency_for: Vec<String>,
    pub disabled: bool,
}

impl ExtensionDecl {
    pub fn source(&self) -> Result<ExtensionSource, ExtensionError> {
        if let Some(file) = &self.file {
            if let Some(provider) = &self.provider_module {
                return Ok(ExtensionSource::ModuleFile {
                    module: provider.clone(),
                    file: file.clone(),
                });
            }
            if let Some(owner) = &self.owner_module {
                return Ok(ExtensionSource::LocalFile {
                    owner: owner.clone(),
                    file: file.clone(),
                });
            }
            return Err(ExtensionError::Misconfigured {
                name: self.name.clone(),
            });
        }
        if let Some(package) = &self.package {
            return Ok(ExtensionSource::Package {
                package: package.clone(),
            });
        }
        Err(ExtensionError::Misconfigured {
            name: self.name.clone(),
        })
    }

    /// Content identity used when module declarations overlay the global
    /// list; compared before the owner module is stamped.
    pub(crate) fn content_identity(&self) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
        (
            self.file.as_deref(),
            self.package.as_deref(),
            self.provider_module.as_deref(),
            self.owner_module.as_deref(),
        )
    }
}

/// An extension that has been through its entry point. Registry entries
/// are write-once and live for the process lifetime.
pub struct LoadedExtension {
    pub decl: ExtensionDecl,
    pub extension: Arc<dyn Extension>,
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("extension declaration without a name")]
    MissingName,
    #[error("extension `{name}` must declare a `package`, or a `file` together with a module")]
    Misconfigured { name: String },
    #[error(
        "extension `{extension}` lists `{target}` in `is_dependency_for`, \
         but no extension with that name exists"
    )]
    UnknownInjectionTarget { extension: String, target: String },
    #[error("extension `{extension}` depends on unknown `{depends_on}`")]
    UnknownDependency {
        extension: String,
        depends_on: String,
    },
    #[error("cyclic extension dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("extension `{name}` ({key}) is not registered in the library")]
    NotRegistered { name: String, key: ExtensionKey },
    #[error("loading extension `{name}` failed")]
    Load {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Name → index of first occurrence in the global list.
fn name_index(extensions: &[ExtensionDecl]) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (i, ext) in extensions.iter().enumerate() {
        index.entry(ext.name.trim().to_string()).or_insert(i);
    }
    index
}

/// Rewrite every `is_dependency_for` edge into the target's
/// `dependencies` list, then drop the field. Lets an extension declare
/// "I must run before X" without X knowing about it in advance.
pub(crate) fn normalize_dependencies(
    extensions: &mut [ExtensionDecl],
) -> Result<(), ExtensionError> {
    let index = name_index(extensions);
    for i in 0..extensions.len() {
        let name = extensions[i].name.trim().to_string();
        if name.is_empty() {
            return Err(ExtensionError::MissingName);
        }
        let targets = std::mem::take(&mut extensions[i].is_dependency_for);
        for target in targets {
            let Some(&j) = index.get(target.trim()) else {
                return Err(ExtensionError::UnknownInjectionTarget {
                    extension: name,
                    target,
                });
            };
            let deps = &mut extensions[j].dependencies;
            if !deps.iter().any(|d| d.trim() == name) {
                deps.push(name.clone());
            }
        }
    }
    Ok(())
}

/// Load order over the global extension list: indices into the list, plus
/// the parallel name sequence for diagnostics.
pub(crate) struct LoadSequence {
    pub indices: Vec<usize>,
    #[allow(dead_code)]
    pub names: Vec<String>,
}

/// Compute a dependency-respecting linear order. The graph is checked for
/// cycles first (reporting the exact members), then ordered with Kahn's
/// algorithm seeded in declaration order, which makes the result
/// deterministic for a given declaration sequence.
pub(crate) fn resolve_order(extensions: &[ExtensionDecl]) -> Result<LoadSequence, ExtensionError> {
    let n = extensions.len();
    let index = name_index(extensions);

    // Edge dep -> dependent, so dependencies drain first.
    let mut adj = vec![Vec::<usize>::new(); n];
    for (u, ext) in extensions.iter().enumerate() {
        for dep in &ext.dependencies {
            let Some(&v) = index.get(dep.trim()) else {
                return Err(ExtensionError::UnknownDependency {
                    extension: ext.name.clone(),
                    depends_on: dep.clone(),
                });
            };
            adj[v].push(u);
        }
    }

    if let Some(cycle) = find_cycle(n, &adj) {
        let path = cycle.into_iter().map(|i| extensions[i].name.clone()).collect();
        return Err(ExtensionError::CycleDetected { path });
    }

    let mut indegree = vec![0usize; n];
    for targets in &adj {
        for &t in targets {
            indegree[t] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &w in &adj[u] {
            indegree[w] -= 1;
            if indegree[w] == 0 {
                queue.push_back(w);
            }
        }
    }

    let names: Vec<String> = order.iter().map(|&i| extensions[i].name.clone()).collect();
    tracing::info!(extensions = ?names, "extension load order resolved");
    Ok(LoadSequence {
        indices: order,
        names,
    })
}

/// Iterative DFS with an explicit frame stack; a back edge onto the
/// active path yields the closed cycle `a -> ... -> a`.
fn find_cycle(n: usize, adj: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    let mut mark = vec![Mark::New; n];
    for start in 0..n {
        if mark[start] != Mark::New {
            continue;
        }
        mark[start] = Mark::Active;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if frame.1 < adj[node].len() {
                let next = adj[node][frame.1];
                frame.1 += 1;
                match mark[next] {
                    Mark::Active => {
                        let from = stack
                            .iter()
                            .position(|&(v, _)| v == next)
                            .unwrap_or_default();
                        let mut path: Vec<usize> =
                            stack[from..].iter().map(|&(v, _)| v).collect();
                        path.push(next);
                        return Some(path);
                    }
                    Mark::New => {
                        mark[next] = Mark::Active;
                        stack.push((next, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                mark[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    None
}

/// Normalize, order and load the global extension set. Each content
/// identity loads exactly once; failures abort the bootstrap.
pub(crate) fn load_extensions(ctx: &mut AppContext) -> Result<(), ExtensionError> {
    tracing::debug!("normalizing extension dependency declarations");
    normalize_dependencies(&mut ctx.extensions)?;

    let sequence = resolve_order(&ctx.extensions)?;

    for &i in &sequence.indices {
        let decl = ctx.extensions[i].clone();
        if decl.disabled {
            tracing::info!(extension = %decl.name, "extension disabled, skipping");
            continue;
        }
        let source = decl.source()?;
        if ctx.loaded_extensions.contains_key(&source) {
            continue;
        }

        let key = source.library_key();
        let Some(extension) = ctx.library.extension(&key).cloned() else {
            return Err(ExtensionError::NotRegistered {
                name: decl.name.clone(),
                key,
            });
        };

        if let Some((namespace, defaults)) = extension.default_config() {
            ctx.config
                .merge_under(&format!("gantry:extension:{namespace}"), defaults)?;
        }

        ctx.loaded_extensions.insert(
            source,
            LoadedExtension {
                decl: decl.clone(),
                extension: extension.clone(),
            },
        );

        extension.load(ctx).map_err(|source| ExtensionError::Load {
            name: decl.name.clone(),
            source,
        })?;
        tracing::info!(extension = %decl.name, "extension loaded");
    }

    Ok(())
}
