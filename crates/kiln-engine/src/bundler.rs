//! Static bundling of entry scripts against the generated workspace tree.
//!
//! The workspace is produced elsewhere (the code generator): one subtree per
//! service namespace holding per-tool wrapper modules plus a shared client
//! module. The bundler's job is to stage the submitted script inside that
//! tree, walk its relative import graph on disk, and hand the VM a fully
//! in-memory module map — execution never touches the filesystem.
//!
//! Import statements are recognized statically, one statement per line,
//! which covers everything the generator emits and the scripts agents write.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use deno_core::ModuleSpecifier;
use regex::Regex;
use uuid::Uuid;

use crate::error::{BundleError, EngineError};

/// Matches `import`/`export ... from` statements and captures the specifier.
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[^'";]*?\bfrom\s+)?["']([^"']+)["']"#).unwrap()
});

/// The pre-generated module tree the engine resolves imports against.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open a workspace rooted at `root`. The directory must already exist;
    /// the engine never creates or validates the generated tree.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root: PathBuf = root.into();
        let root = root
            .canonicalize()
            .map_err(|_| EngineError::WorkspaceUnusable(root.clone()))?;
        if !root.is_dir() {
            return Err(EngineError::WorkspaceUnusable(root));
        }
        Ok(Self { root })
    }

    /// The canonical workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the wrapped script to a transient, collision-free entry file
    /// inside the workspace so its relative imports resolve.
    ///
    /// The returned guard removes the file on drop, on every exit path.
    pub fn stage_entry(&self, code: &str) -> Result<StagedEntry, EngineError> {
        let name = format!("__entry_{}.js", Uuid::new_v4().simple());
        let path = self.root.join(name);
        let wrapped = wrap_entry(code);
        std::fs::write(&path, wrapped).map_err(|source| EngineError::WorkspaceWrite {
            path: self.root.clone(),
            source,
        })?;
        Ok(StagedEntry { path })
    }

    /// Walk the static import graph from `entry` and collect every module
    /// into an in-memory [`Bundle`].
    pub fn bundle(&self, entry: &StagedEntry) -> Result<Bundle, BundleError> {
        let entry_specifier = ModuleSpecifier::from_file_path(&entry.path)
            .map_err(|_| BundleError::EscapesWorkspace(entry.path.display().to_string()))?;

        let mut modules = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue = vec![entry_specifier.clone()];
        visited.insert(entry_specifier.as_str().to_string());

        while let Some(specifier) = queue.pop() {
            let source = self.read_module(&specifier)?;

            for captures in IMPORT_RE.captures_iter(&source) {
                let raw = &captures[1];
                let resolved = self.resolve(raw, &specifier)?;
                if visited.insert(resolved.as_str().to_string()) {
                    queue.push(resolved);
                }
            }

            modules.push((specifier, source));
        }

        tracing::debug!(
            modules = modules.len(),
            entry = %entry_specifier,
            "bundle assembled"
        );

        Ok(Bundle {
            entry: entry_specifier,
            modules,
        })
    }

    /// Resolve one import specifier against its referrer, confined to the
    /// workspace root.
    fn resolve(
        &self,
        raw: &str,
        referrer: &ModuleSpecifier,
    ) -> Result<ModuleSpecifier, BundleError> {
        if !raw.starts_with("./") && !raw.starts_with("../") {
            return Err(BundleError::Resolve {
                specifier: raw.to_string(),
                referrer: referrer.to_string(),
                reason: "only relative imports are supported".into(),
            });
        }

        let resolved =
            deno_core::resolve_import(raw, referrer.as_str()).map_err(|e| BundleError::Resolve {
                specifier: raw.to_string(),
                referrer: referrer.to_string(),
                reason: e.to_string(),
            })?;

        let path = resolved
            .to_file_path()
            .map_err(|_| BundleError::EscapesWorkspace(raw.to_string()))?;
        if !path.starts_with(&self.root) {
            return Err(BundleError::EscapesWorkspace(raw.to_string()));
        }

        if self.module_file(&path).is_none() {
            return Err(BundleError::Resolve {
                specifier: raw.to_string(),
                referrer: referrer.to_string(),
                reason: "no such module in workspace".into(),
            });
        }

        Ok(resolved)
    }

    /// Map a module specifier's path to the file that backs it, trying a
    /// `.js` suffix for extensionless specifiers.
    fn module_file(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        if path.extension().is_none() {
            let with_ext = path.with_extension("js");
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        None
    }

    fn read_module(&self, specifier: &ModuleSpecifier) -> Result<String, BundleError> {
        let path = specifier
            .to_file_path()
            .map_err(|_| BundleError::EscapesWorkspace(specifier.to_string()))?;
        let file = self
            .module_file(&path)
            .ok_or_else(|| BundleError::ModuleRead {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such module"),
            })?;
        std::fs::read_to_string(&file)
            .map_err(|source| BundleError::ModuleRead { path: file, source })
    }
}

/// A transient entry file staged inside the workspace.
///
/// Removal is tied to drop so the workspace is left clean on success,
/// failure, and timeout alike.
pub struct StagedEntry {
    path: PathBuf,
}

impl StagedEntry {
    /// Path of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staged entry");
        }
    }
}

/// A self-contained compiled unit: the full module map plus its entry point.
pub struct Bundle {
    /// Specifier of the entry module.
    pub entry: ModuleSpecifier,
    /// Every module reachable from the entry, source included.
    pub modules: Vec<(ModuleSpecifier, String)>,
}

/// Wrap the raw script so top-level `await` is legal in every position.
///
/// Import statements must stay at module top level, so they are hoisted
/// above the async wrapper; everything else runs inside it. The wrapper is
/// purely syntactic — the bridge ops are the only suspension points and each
/// one blocks the single VM thread until it completes.
pub(crate) fn wrap_entry(code: &str) -> String {
    let mut imports = String::new();
    let mut body = String::new();

    for line in code.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("import ") || trimmed.starts_with("import\"")
            || trimmed.starts_with("import'")
        {
            imports.push_str(line);
            imports.push('\n');
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    format!("{imports}await (async () => {{\n{body}}})();\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    fn write(ws: &Workspace, rel: &str, content: &str) {
        let path = ws.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn wrap_hoists_import_lines() {
        let code = "import { op } from \"./svc/op.js\";\nconsole.log(await op());";
        let wrapped = wrap_entry(code);
        assert!(wrapped.starts_with("import { op } from \"./svc/op.js\";\n"));
        assert!(wrapped.contains("await (async () => {"));
        assert!(wrapped.contains("console.log(await op());"));
    }

    #[test]
    fn wrap_plain_script_has_no_header() {
        let wrapped = wrap_entry("console.log(1);");
        assert!(wrapped.starts_with("await (async () => {"));
    }

    #[test]
    fn stage_entry_removes_file_on_drop() {
        let (_dir, ws) = workspace();
        let path;
        {
            let staged = ws.stage_entry("console.log(1);").unwrap();
            path = staged.path().to_path_buf();
            assert!(path.exists());
            assert!(path.file_name().unwrap().to_str().unwrap().starts_with("__entry_"));
        }
        assert!(!path.exists());
    }

    #[test]
    fn staged_entries_do_not_collide() {
        let (_dir, ws) = workspace();
        let a = ws.stage_entry("1;").unwrap();
        let b = ws.stage_entry("2;").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn bundle_walks_import_graph() {
        let (_dir, ws) = workspace();
        write(&ws, "client.js", "export const call = globalThis.callTool;\n");
        write(
            &ws,
            "svc/op.js",
            "import { call } from \"../client.js\";\nexport const op = (a) => call(\"svc__op\", a);\n",
        );
        let staged = ws
            .stage_entry("import { op } from \"./svc/op.js\";\nawait op({});")
            .unwrap();

        let bundle = ws.bundle(&staged).unwrap();
        assert_eq!(bundle.modules.len(), 3);
        assert!(bundle.entry.as_str().contains("__entry_"));
    }

    #[test]
    fn bundle_resolves_extensionless_specifiers() {
        let (_dir, ws) = workspace();
        write(&ws, "client.js", "export const x = 1;\n");
        let staged = ws
            .stage_entry("import { x } from \"./client\";\nconsole.log(x);")
            .unwrap();

        let bundle = ws.bundle(&staged).unwrap();
        assert_eq!(bundle.modules.len(), 2);
    }

    #[test]
    fn bundle_deduplicates_shared_modules() {
        let (_dir, ws) = workspace();
        write(&ws, "client.js", "export const c = 1;\n");
        write(&ws, "a.js", "import { c } from \"./client.js\";\nexport const a = c;\n");
        write(&ws, "b.js", "import { c } from \"./client.js\";\nexport const b = c;\n");
        let staged = ws
            .stage_entry("import { a } from \"./a.js\";\nimport { b } from \"./b.js\";")
            .unwrap();

        let bundle = ws.bundle(&staged).unwrap();
        assert_eq!(bundle.modules.len(), 4);
    }

    #[test]
    fn bundle_rejects_missing_module() {
        let (_dir, ws) = workspace();
        let staged = ws
            .stage_entry("import { x } from \"./nope.js\";")
            .unwrap();

        let err = ws.bundle(&staged).unwrap_err();
        assert!(
            matches!(err, BundleError::Resolve { .. }),
            "expected resolve error, got: {err}"
        );
        assert!(err.to_string().contains("nope.js"));
    }

    #[test]
    fn bundle_rejects_bare_specifiers() {
        let (_dir, ws) = workspace();
        let staged = ws.stage_entry("import lodash from \"lodash\";").unwrap();

        let err = ws.bundle(&staged).unwrap_err();
        assert!(err.to_string().contains("only relative imports"), "got: {err}");
    }

    #[test]
    fn bundle_rejects_workspace_escape() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("ws");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(dir.path().join("outside.js"), "export const x = 1;\n").unwrap();
        let ws = Workspace::open(&inner).unwrap();

        let staged = ws
            .stage_entry("import { x } from \"../outside.js\";")
            .unwrap();

        let err = ws.bundle(&staged).unwrap_err();
        assert!(
            matches!(err, BundleError::EscapesWorkspace(_)),
            "expected escape error, got: {err}"
        );
    }

    #[test]
    fn open_rejects_missing_root() {
        let err = Workspace::open("/definitely/not/a/real/path").unwrap_err();
        assert!(matches!(err, EngineError::WorkspaceUnusable(_)));
    }
}
