//! Build configuration: global options, per-module overrides and search paths.

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How imports of modules that were not explicitly requested are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowImports {
    /// Fully analyze the imported module.
    #[default]
    Normal,
    /// Analyze the imported module but silence its diagnostics.
    Silent,
    /// Don't analyze the imported module at all.
    Skip,
    /// Like `Skip`, but additionally report the ignored import.
    Error,
}

/// Directories consulted when resolving a dotted module name to a file.
#[derive(Clone, Debug, Default)]
pub struct SearchPaths {
    /// Project source roots, highest precedence.
    pub source_paths: Vec<PathBuf>,
    /// Installed third-party package roots. Diagnostics for modules found
    /// here are silenced unless [`Options::silence_site_packages`] is off.
    pub package_paths: Vec<PathBuf>,
    /// Bundled stub roots, silenced like package paths.
    pub typeshed_paths: Vec<PathBuf>,
}

impl SearchPaths {
    /// Whether `path` lives under a silenced root (site packages or bundled
    /// stubs).
    pub fn is_silenced_path(&self, path: &Path) -> bool {
        self.package_paths.iter().chain(self.typeshed_paths.iter()).any(|dir| path.starts_with(dir))
    }
}

/// Per-module overrides, matched against dotted module names.
///
/// A pattern is either an exact dotted name (which also covers its
/// submodules) or a name ending in `.*`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleOverrides {
    pub follow_imports: Option<FollowImports>,
    pub ignore_missing_imports: Option<bool>,
    pub ignore_errors: Option<bool>,
}

static MODULE_PATTERN_META: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.^$+()\[\]{}|\\]").unwrap());

/// Compile a dotted-name pattern into an anchored regex. A trailing `.*` is
/// equivalent to the bare base name: both cover the base and its submodules.
fn pattern_regex(pattern: &str) -> Option<Regex> {
    let base = pattern.strip_suffix(".*").unwrap_or(pattern);
    let escaped = MODULE_PATTERN_META.replace_all(base, r"\$0");
    let body = escaped.replace('*', "[^.]*");
    Regex::new(&format!(r"^{body}(\..*)?$")).ok()
}

/// Global build options.
///
/// The fields that affect analysis results are mirrored into [`CacheOptions`]
/// and persisted with every metadata record; changing any of them invalidates
/// the cache.
#[derive(Clone, Debug)]
pub struct Options {
    /// Where cache files live; `None` disables reading and writing the cache.
    pub cache_dir: Option<PathBuf>,
    /// Whether cached metadata may be consulted at all.
    pub incremental: bool,
    /// Analyzer version; the cache root is `<cache_dir>/<major>.<minor>/` and
    /// the full rendered version is stored in each record.
    pub version: Version,
    /// Target platform tag recorded with the cache.
    pub platform: String,
    pub follow_imports: FollowImports,
    /// Whether the follow-imports policy also applies to stub files.
    pub follow_imports_for_stubs: bool,
    pub ignore_missing_imports: bool,
    /// Discard all non-blocking diagnostics for matching modules.
    pub ignore_errors: bool,
    /// Coerce modules found under package or typeshed roots to
    /// [`FollowImports::Silent`].
    pub silence_site_packages: bool,
    /// Distributed-build mode: mtimes are recorded as zero and paths as
    /// relative, leaving content digests as the sole validity signal.
    pub bazel: bool,
    /// Accept records written by a different analyzer version; also relaxes
    /// the platform comparison.
    pub skip_version_check: bool,
    /// Inside a stale SCC, reuse cached trees for nodes that are individually
    /// fresh instead of re-analyzing the whole component.
    pub mixed_freshness: bool,
    /// Fine-grained incremental mode: cache files are never written.
    pub fine_grained_incremental: bool,
    /// Write per-module fine-grained dependency files.
    pub cache_fine_grained: bool,
    /// Load the fine-grained cache wholesale instead of scheduling SCCs.
    pub use_fine_grained_cache: bool,
    pub warn_unused_ignores: bool,
    /// Capture all inferred types into the build result.
    pub export_types: bool,
    /// Pretty-print cache files; ignored when comparing recorded options.
    pub debug_cache: bool,
    /// Buffer metadata writes in memory and publish them as one batch at the
    /// end of the build.
    pub buffered_cache: bool,
    /// `(pattern, overrides)` pairs applied in order; later entries win.
    pub per_module: Vec<(String, ModuleOverrides)>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            incremental: true,
            version: Version::new(0, 1, 0),
            platform: std::env::consts::OS.to_string(),
            follow_imports: FollowImports::Normal,
            follow_imports_for_stubs: false,
            ignore_missing_imports: false,
            ignore_errors: false,
            silence_site_packages: true,
            bazel: false,
            skip_version_check: false,
            mixed_freshness: false,
            fine_grained_incremental: false,
            cache_fine_grained: false,
            use_fine_grained_cache: false,
            warn_unused_ignores: false,
            export_types: false,
            debug_cache: false,
            buffered_cache: false,
            per_module: Vec::new(),
        }
    }
}

/// The default per-user cache location.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("sift"))
}

impl Options {
    /// Returns the options specialized for `module`, with all matching
    /// per-module overrides applied.
    pub fn clone_for_module(&self, module: &str) -> Options {
        let mut options = self.clone();
        for (pattern, overrides) in &self.per_module {
            let matches = pattern_regex(pattern).is_some_and(|re| re.is_match(module));
            if !matches {
                continue;
            }
            if let Some(follow) = overrides.follow_imports {
                options.follow_imports = follow;
            }
            if let Some(ignore) = overrides.ignore_missing_imports {
                options.ignore_missing_imports = ignore;
            }
            if let Some(ignore) = overrides.ignore_errors {
                options.ignore_errors = ignore;
            }
        }
        options
    }

    /// The subset of options that affect analysis results, as persisted into
    /// metadata records.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            follow_imports: self.follow_imports,
            follow_imports_for_stubs: self.follow_imports_for_stubs,
            ignore_missing_imports: self.ignore_missing_imports,
            ignore_errors: self.ignore_errors,
            mixed_freshness: self.mixed_freshness,
            platform: self.platform.clone(),
            bazel: self.bazel,
        }
    }

    /// Whether the cache may be read, before any runtime downgrades.
    pub fn cache_readable(&self) -> bool {
        self.incremental && self.cache_dir.is_some()
    }
}

/// The recorded option subset compared during cache validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub follow_imports: FollowImports,
    pub follow_imports_for_stubs: bool,
    pub ignore_missing_imports: bool,
    pub ignore_errors: bool,
    pub mixed_freshness: bool,
    pub platform: String,
    pub bazel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_module_overrides_match_submodules() {
        let mut options = Options::default();
        options.per_module.push((
            "vendored.*".to_string(),
            ModuleOverrides { ignore_errors: Some(true), ..Default::default() },
        ));

        assert!(options.clone_for_module("vendored.http.client").ignore_errors);
        assert!(options.clone_for_module("vendored").ignore_errors);
        assert!(!options.clone_for_module("vendoredx").ignore_errors);
        assert!(!options.clone_for_module("app.vendored").ignore_errors);
    }

    #[test]
    fn exact_pattern_covers_itself_and_children() {
        let mut options = Options::default();
        options.per_module.push((
            "third_party".to_string(),
            ModuleOverrides { follow_imports: Some(FollowImports::Silent), ..Default::default() },
        ));

        assert_eq!(options.clone_for_module("third_party").follow_imports, FollowImports::Silent);
        assert_eq!(
            options.clone_for_module("third_party.lib").follow_imports,
            FollowImports::Silent
        );
        assert_eq!(options.clone_for_module("other").follow_imports, FollowImports::Normal);
    }

    #[test]
    fn cache_options_ignore_cosmetic_fields() {
        let mut a = Options::default();
        let mut b = Options::default();
        a.debug_cache = true;
        b.warn_unused_ignores = true;
        assert_eq!(a.cache_options(), b.cache_options());

        b.platform = "emscripten".to_string();
        assert_ne!(a.cache_options(), b.cache_options());
    }
}
