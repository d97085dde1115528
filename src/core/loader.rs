//! Bundle loading
//!
//! Scans directories for module bundles, parses and validates their
//! manifests, and resolves handler bindings against a code-loading scope.
//! Isolation level decides scope sharing: isolated bundles each get a
//! fresh scope seeded with the host factories only, while a shared pass
//! re-exports every loaded module's handlers so later bundles can bind to
//! them as `<module>.<action>`.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{
    error::{ErrorContext, ServiceError, ServiceResult},
    module::{host_factories, ActionHandler, DispatchPattern, HandlerCreateFn, Module},
};

/// Fixed bundle-file suffix; the remainder of the file name must equal the
/// manifest-declared module name.
pub const BUNDLE_SUFFIX: &str = ".bundle.yaml";

/// Module bundle manifest.
#[derive(Debug, Deserialize, Validate)]
pub struct Manifest {
    #[validate(length(min = 1))]
    pub name: String,

    /// Optional dispatch-pattern descriptor `group|pattern|priority`.
    pub pattern: Option<String>,

    /// Action name to handler binding.
    #[validate(length(min = 1))]
    pub handlers: HashMap<String, HandlerBinding>,

    /// Arbitrary build metadata, carried but not interpreted.
    #[serde(default)]
    pub metadata: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HandlerBinding {
    pub binding: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

enum ScopeEntry {
    /// Host factory: builds a fresh handler from manifest configuration.
    Factory(HandlerCreateFn),
    /// Handler exported by an earlier module in a shared pass.
    Exported(Arc<dyn ActionHandler>),
}

/// Code-loading scope a bundle resolves its handler bindings against.
pub struct ModuleScope {
    entries: DashMap<String, ScopeEntry>,
}

impl ModuleScope {
    /// A scope seeded with the host's built-in factories.
    pub fn host() -> Self {
        let entries = DashMap::new();
        for (name, factory) in host_factories() {
            entries.insert(name.to_string(), ScopeEntry::Factory(factory));
        }
        Self { entries }
    }

    pub fn resolve(
        &self,
        binding: &str,
        config: serde_yaml::Value,
    ) -> ServiceResult<Arc<dyn ActionHandler>> {
        let entry = self.entries.get(binding).ok_or_else(|| {
            ServiceError::Load(format!("unknown handler binding '{binding}'"))
        })?;
        match entry.value() {
            ScopeEntry::Factory(factory) => factory(config),
            ScopeEntry::Exported(handler) => {
                if !config.is_null() {
                    warn!("binding '{binding}' is an exported handler; config ignored");
                }
                Ok(Arc::clone(handler))
            }
        }
    }

    /// Make a loaded module's handlers visible to later bundles in the
    /// same pass.
    pub fn export_module(&self, module: &Module) {
        for action in module.action_names() {
            if let Some(handler) = module.action(action) {
                let key = format!("{}.{}", module.name, action);
                debug!("exporting handler '{key}' into shared scope");
                self.entries.insert(key, ScopeEntry::Exported(handler));
            }
        }
    }
}

/// List bundle files in a directory, sorted by file name so registration
/// order (and with it pattern-priority tie-breaking) is deterministic.
pub fn scan_bundles(dir: &Path) -> ServiceResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| ServiceError::Load(format!("cannot scan '{}': {e}", dir.display())))?;
    let mut bundles: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(BUNDLE_SUFFIX))
        })
        .collect();
    bundles.sort();
    Ok(bundles)
}

/// Load one bundle: parse and validate the manifest, check the
/// file-derived name, compile the dispatch pattern and resolve every
/// handler binding through the scope.
pub fn load_bundle(path: &Path, scope: &ModuleScope) -> ServiceResult<Module> {
    let text = fs::read_to_string(path)
        .map_err(|e| ServiceError::Load(format!("cannot read '{}': {e}", path.display())))?;
    let manifest: Manifest = serde_yaml::from_str(&text)
        .map_err(|e| ServiceError::Load(format!("bad manifest '{}': {e}", path.display())))?;
    manifest
        .validate()
        .map_err(|e| ServiceError::Load(format!("invalid manifest '{}': {e}", path.display())))?;

    let derived = derived_name(path).ok_or_else(|| {
        ServiceError::Load(format!("'{}' is not a bundle file", path.display()))
    })?;
    if derived != manifest.name {
        return Err(ServiceError::Load(format!(
            "manifest name '{}' does not match bundle file name '{derived}'",
            manifest.name
        )));
    }

    let pattern = manifest
        .pattern
        .as_deref()
        .map(DispatchPattern::parse)
        .transpose()?;

    let mut actions: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
    for (action, binding) in &manifest.handlers {
        let handler = scope
            .resolve(&binding.binding, binding.config.clone())
            .with_context(&format!(
                "resolving handler '{action}' of module '{}'",
                manifest.name
            ))?;
        actions.insert(action.clone(), handler);
    }

    let mut module = Module::new(manifest.name, actions).with_metadata(manifest.metadata);
    if let Some(pattern) = pattern {
        module = module.with_pattern(pattern);
    }
    Ok(module)
}

/// Run one load pass over the given directories.
///
/// `isolated` selects per-bundle scopes; `fail_on_error=false` logs and
/// skips bad bundles instead of aborting. The caller installs the result
/// as a whole generation, so a returned error means nothing was loaded.
pub fn load_pass(
    dirs: &[PathBuf],
    isolated: bool,
    fail_on_error: bool,
) -> ServiceResult<Vec<Arc<Module>>> {
    let shared_scope = ModuleScope::host();
    let mut modules: Vec<Arc<Module>> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for dir in dirs {
        for path in scan_bundles(dir)? {
            let result = if isolated {
                load_bundle(&path, &ModuleScope::host())
            } else {
                load_bundle(&path, &shared_scope)
            };
            let module = match result {
                Ok(module) => module,
                Err(e) => {
                    if fail_on_error {
                        return Err(e);
                    }
                    warn!("skipping bundle '{}': {e}", path.display());
                    continue;
                }
            };
            if !seen.insert(module.name.clone()) {
                let e = ServiceError::Load(format!("duplicate module name '{}'", module.name));
                if fail_on_error {
                    return Err(e);
                }
                warn!("skipping bundle '{}': {e}", path.display());
                continue;
            }
            info!(
                "loaded module '{}' with {} action(s)",
                module.name,
                module.action_names().count()
            );
            let module = Arc::new(module);
            if !isolated {
                shared_scope.export_module(&module);
            }
            modules.push(module);
        }
    }
    Ok(modules)
}

fn derived_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(BUNDLE_SUFFIX))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_bundle(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(format!("{name}{BUNDLE_SUFFIX}"));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const ECHO_BUNDLE: &str = "\
name: echo
pattern: \"g|^echo.*|10\"
handlers:
  ping:
    binding: echo
metadata:
  build: \"1\"
";

    #[test]
    fn loads_a_valid_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "echo", ECHO_BUNDLE);

        let module = load_bundle(&path, &ModuleScope::host()).unwrap();
        assert_eq!(module.name, "echo");
        assert!(module.action("ping").is_some());
        assert_eq!(module.pattern.as_ref().unwrap().priority, 10);
        assert_eq!(module.metadata.len(), 1);
    }

    #[test]
    fn rejects_name_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "other", ECHO_BUNDLE);

        let err = load_bundle(&path, &ModuleScope::host()).unwrap_err();
        assert!(matches!(err, ServiceError::Load(_)));
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_unknown_binding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(
            dir.path(),
            "m",
            "name: m\nhandlers:\n  a:\n    binding: no-such-handler\n",
        );
        let err = load_bundle(&path, &ModuleScope::host()).unwrap_err();
        assert!(err.to_string().contains("no-such-handler"));
    }

    #[test]
    fn shared_pass_exports_earlier_modules() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "base", "name: base\nhandlers:\n  work:\n    binding: echo\n");
        // Sorted after "base", so it can see base's export in a shared pass.
        write_bundle(
            dir.path(),
            "derived",
            "name: derived\nhandlers:\n  work:\n    binding: base.work\n",
        );

        let modules = load_pass(&[dir.path().to_path_buf()], false, true).unwrap();
        assert_eq!(modules.len(), 2);

        // The same bundles fail in isolated mode: no cross-bundle exports.
        let err = load_pass(&[dir.path().to_path_buf()], true, true).unwrap_err();
        assert!(err.to_string().contains("base.work"));
    }

    #[test]
    fn skip_policy_keeps_good_bundles() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "bad", "name: mismatched\nhandlers:\n  a:\n    binding: echo\n");
        write_bundle(dir.path(), "echo", ECHO_BUNDLE);

        let modules = load_pass(&[dir.path().to_path_buf()], false, false).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "echo");

        assert!(load_pass(&[dir.path().to_path_buf()], false, true).is_err());
    }
}
