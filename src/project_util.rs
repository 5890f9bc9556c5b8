//! Utilities for creating and testing temporary analysis projects.
//!
//! Provides a miniature line-oriented frontend ([`PyFrontend`]) that
//! understands just enough of a Python-like surface syntax to exercise the
//! orchestrator -- imports in their three shapes, top-level definitions,
//! ignore comments -- plus a search-path module finder and a tempdir-backed
//! project scaffold.

use crate::{
    analysis::{Analysis, ImportNode, ModuleFinder, Modules},
    config::{Options, SearchPaths},
    fscache::FileSystemCache,
    report::{Reporter, Severity},
    BuildResult, BuildSource, CompileError, FollowImports, ModuleOverrides,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use walkdir::WalkDir;

/// Matches `import a.b, c as d`.
static RE_IMPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^import\s+(.+)$").unwrap());

/// Matches `from ..pkg import x, y` and `from pkg import *`, with the named
/// groups "dots", "module" and "names".
static RE_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^from\s+(?P<dots>\.*)(?P<module>[\w.]*)\s+import\s+(?P<names>.+)$").unwrap()
});

static RE_DEF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^def\s+(\w+)").unwrap());
static RE_CLASS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^class\s+(\w+)").unwrap());
static RE_ASSIGN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)\s*=\s*(.+)$").unwrap());
static RE_GUARD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^if\s+TYPE_CHECKING\s*:").unwrap());
static RE_DEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^if\s+False\s*:").unwrap());

/// The parsed (and progressively annotated) form of one module.
///
/// Only the fields that make up the module's public interface are
/// serialized; bookkeeping that varies between runs is rebuilt after a cache
/// load instead.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PyTree {
    pub id: String,
    pub is_stub: bool,
    pub is_partial_stub_package: bool,
    pub imports: Vec<ImportNode>,
    /// Top-level names with a crude description of what they are bound to.
    pub names: BTreeMap<String, String>,

    #[serde(skip)]
    pub path: String,
    #[serde(skip)]
    pub ignored_lines: BTreeSet<u64>,
    /// `(line, message)` pairs the checker will report.
    #[serde(skip)]
    pub type_errors: Vec<(u64, String)>,
    /// Submodule names injected into this namespace by imports elsewhere.
    #[serde(skip)]
    pub namespace_extras: BTreeSet<String>,
    #[serde(skip)]
    pub cross_refs_fixed: bool,
}

/// A deferred fix-up produced by the semantic passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PyPatch {
    pub module: String,
    pub action: &'static str,
}

#[derive(Clone, Copy, PartialEq)]
enum Block {
    Plain,
    Guard,
    Dead,
    Func,
    Class,
}

fn scan_source(id: &str, path: &str, source: &str, reporter: &mut Reporter) -> PyTree {
    let is_stub = path.ends_with(".pyi");
    let is_init = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("__init__."));

    let mut tree = PyTree { id: id.to_string(), is_stub, path: path.to_string(), ..Default::default() };
    let mut block = Block::Plain;

    for (idx, raw) in source.lines().enumerate() {
        let line = (idx + 1) as u64;
        if raw.contains("# type: ignore") {
            tree.ignored_lines.insert(line);
        }
        let indented = raw.starts_with(' ') || raw.starts_with('\t');
        // Trailing comments are not part of the code.
        let stripped = raw.split('#').next().unwrap_or_default().trim();
        if stripped.is_empty() {
            continue;
        }

        if !indented {
            if RE_GUARD.is_match(stripped) {
                block = Block::Guard;
                continue;
            }
            if RE_DEAD.is_match(stripped) {
                block = Block::Dead;
                continue;
            }
            if let Some(caps) = RE_DEF.captures(stripped) {
                tree.names.insert(caps[1].to_string(), "def".to_string());
                block = Block::Func;
                continue;
            }
            if let Some(caps) = RE_CLASS.captures(stripped) {
                tree.names.insert(caps[1].to_string(), "class".to_string());
                block = Block::Class;
                continue;
            }
            block = Block::Plain;
        }

        let (top_level, guarded, unreachable) = if indented {
            match block {
                Block::Guard => (true, true, false),
                Block::Dead => (true, false, true),
                Block::Class => (true, false, false),
                Block::Func | Block::Plain => (false, false, false),
            }
        } else {
            (true, false, false)
        };

        if let Some(caps) = RE_FROM.captures(stripped) {
            let relative = caps["dots"].len() as u32;
            let module = caps["module"].to_string();
            let names_part = caps["names"].trim();
            if names_part == "*" {
                tree.imports.push(ImportNode::ImportAll {
                    id: module,
                    relative,
                    line,
                    top_level,
                    guarded,
                    unreachable,
                });
            } else {
                let names = names_part
                    .split(',')
                    .map(|name| {
                        name.trim().split_whitespace().next().unwrap_or_default().to_string()
                    })
                    .filter(|name| !name.is_empty())
                    .collect();
                tree.imports.push(ImportNode::ImportFrom {
                    id: module,
                    relative,
                    names,
                    line,
                    top_level,
                    guarded,
                    unreachable,
                });
            }
            continue;
        }
        if let Some(caps) = RE_IMPORT.captures(stripped) {
            let ids = caps[1]
                .split(',')
                .map(|item| {
                    item.trim().split_whitespace().next().unwrap_or_default().to_string()
                })
                .filter(|item| !item.is_empty())
                .collect();
            tree.imports.push(ImportNode::Import { ids, line, top_level, guarded, unreachable });
            continue;
        }

        if !indented {
            if stripped == ")" {
                reporter.set_file(path.to_string(), Some(id));
                reporter.report(line as i64, "invalid syntax", Severity::Error, true, false);
                continue;
            }
            if let Some(caps) = RE_ASSIGN.captures(stripped) {
                let value = caps[2].trim().to_string();
                if value == "None + 1" {
                    tree.type_errors
                        .push((line, "Unsupported operand types for +".to_string()));
                }
                tree.names.insert(caps[1].to_string(), value);
            }
        }
    }

    tree.is_partial_stub_package = is_stub && is_init && tree.names.contains_key("__getattr__");
    tree
}

/// A miniature frontend driving the orchestrator in tests.
///
/// Pass activity is recorded into a shared log so tests can assert on phase
/// ordering; checker behavior (extra deferred rounds, synthetic module
/// references) is injectable per module.
#[derive(Debug, Default)]
pub struct PyFrontend {
    plugins: BTreeMap<String, String>,
    /// Synthetic references the checker pretends to encounter, per module.
    indirect_refs: HashMap<String, BTreeSet<String>>,
    /// Additional rounds of deferred work the second pass reports.
    extra_second_pass_rounds: HashMap<String, u32>,
    rounds_left: HashMap<String, u32>,
    collected_refs: HashMap<String, BTreeSet<String>>,
    proto_deps: Option<BTreeMap<String, BTreeSet<String>>>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl PyFrontend {
    pub fn new() -> Self {
        Self { proto_deps: Some(BTreeMap::new()), ..Default::default() }
    }

    pub fn with_plugins(mut self, plugins: BTreeMap<String, String>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_indirect_refs(mut self, module: &str, refs: &[&str]) -> Self {
        self.indirect_refs
            .insert(module.to_string(), refs.iter().map(|r| r.to_string()).collect());
        self
    }

    pub fn with_second_pass_rounds(mut self, module: &str, rounds: u32) -> Self {
        self.extra_second_pass_rounds.insert(module.to_string(), rounds);
        self
    }

    fn log(&self, entry: String) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(entry);
        }
    }
}

impl Analysis for PyFrontend {
    type Tree = PyTree;
    type Patch = PyPatch;

    fn plugins_snapshot(&self) -> BTreeMap<String, String> {
        self.plugins.clone()
    }

    fn parse(
        &mut self,
        id: &str,
        path: &str,
        source: &str,
        _ignore_errors: bool,
        reporter: &mut Reporter,
    ) -> PyTree {
        self.log(format!("parse:{id}"));
        scan_source(id, path, source, reporter)
    }

    fn imports(&self, tree: &PyTree) -> Vec<ImportNode> {
        tree.imports.clone()
    }

    fn ignored_lines(&self, tree: &PyTree) -> BTreeSet<u64> {
        tree.ignored_lines.clone()
    }

    fn is_partial_stub_package(&self, tree: &PyTree) -> bool {
        tree.is_partial_stub_package
    }

    fn fix_cross_refs(&mut self, id: &str, modules: &mut Modules<PyTree>, _allow_missing: bool) {
        self.log(format!("fixref:{id}"));
        if let Some(tree) = modules.get_mut(id) {
            tree.cross_refs_fixed = true;
        }
    }

    fn patch_parent_namespace(&mut self, dep: &str, modules: &mut Modules<PyTree>) {
        if let Some((parent, child)) = dep.rsplit_once('.') {
            if let Some(tree) = modules.get_mut(parent) {
                tree.namespace_extras.insert(child.to_string());
            }
        }
    }

    fn inject_typing_aliases(&mut self, modules: &mut Modules<PyTree>) {
        if let Some(tree) = modules.get_mut("typing") {
            tree.names.insert("List".to_string(), "alias".to_string());
            tree.names.insert("Dict".to_string(), "alias".to_string());
        }
    }

    fn semantic_pass_two(
        &mut self,
        id: &str,
        modules: &mut Modules<PyTree>,
        _options: &Options,
        _reporter: &mut Reporter,
    ) -> Vec<(u32, PyPatch)> {
        self.log(format!("sem2:{id}"));
        let imports = modules.get(id).map(|tree| tree.imports.clone()).unwrap_or_default();
        for node in imports {
            if let ImportNode::Import { ids, .. } = node {
                for target in ids {
                    if let Some((parent, child)) = target.rsplit_once('.') {
                        if let Some(tree) = modules.get_mut(parent) {
                            tree.namespace_extras.insert(child.to_string());
                        }
                    }
                }
            }
        }
        vec![(2, PyPatch { module: id.to_string(), action: "bind" })]
    }

    fn semantic_pass_three(
        &mut self,
        id: &str,
        _modules: &mut Modules<PyTree>,
        _options: &Options,
        _reporter: &mut Reporter,
    ) -> Vec<(u32, PyPatch)> {
        self.log(format!("sem3:{id}"));
        vec![(1, PyPatch { module: id.to_string(), action: "finalize" })]
    }

    fn apply_patches(&mut self, id: &str, patches: Vec<PyPatch>, _modules: &mut Modules<PyTree>) {
        for patch in &patches {
            self.log(format!("patch:{id}:{}", patch.action));
        }
    }

    fn type_check_first(
        &mut self,
        id: &str,
        modules: &mut Modules<PyTree>,
        _options: &Options,
        reporter: &mut Reporter,
    ) {
        self.log(format!("check1:{id}"));
        let Some(tree) = modules.get(id) else { return };
        reporter.set_file(tree.path.clone(), Some(id));
        for (line, message) in tree.type_errors.clone() {
            reporter.report(line as i64, message, Severity::Error, false, false);
        }
        // Record the module references "encountered while checking".
        let mut refs: BTreeSet<String> = BTreeSet::new();
        for node in &tree.imports {
            if let ImportNode::Import { ids, .. } = node {
                refs.extend(ids.iter().cloned());
            }
        }
        if let Some(extra) = self.indirect_refs.get(id) {
            refs.extend(extra.iter().cloned());
        }
        self.collected_refs.insert(id.to_string(), refs);
    }

    fn type_check_second(
        &mut self,
        id: &str,
        _modules: &mut Modules<PyTree>,
        _options: &Options,
        _reporter: &mut Reporter,
    ) -> bool {
        self.log(format!("check2:{id}"));
        let configured = self.extra_second_pass_rounds.get(id).copied().unwrap_or(0);
        let left = self.rounds_left.entry(id.to_string()).or_insert(configured);
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }

    fn module_refs(&mut self, id: &str) -> BTreeSet<String> {
        self.collected_refs.remove(id).unwrap_or_default()
    }

    fn finish(
        &mut self,
        id: &str,
        _modules: &mut Modules<PyTree>,
        _options: &Options,
        _reporter: &mut Reporter,
    ) {
        self.log(format!("finish:{id}"));
    }

    fn fine_grained_deps(
        &mut self,
        id: &str,
        modules: &Modules<PyTree>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut deps = BTreeMap::new();
        if let Some(tree) = modules.get(id) {
            for node in &tree.imports {
                if let ImportNode::Import { ids, .. } = node {
                    for target in ids {
                        deps.entry(target.clone())
                            .or_insert_with(BTreeSet::new)
                            .insert(id.to_string());
                    }
                }
            }
        }
        deps
    }

    fn protocol_deps(&mut self) -> Option<BTreeMap<String, BTreeSet<String>>> {
        self.proto_deps.clone()
    }
}

/// Resolves dotted names against the configured search paths, preferring
/// stubs over sources and plain modules over packages.
#[derive(Debug, Default)]
pub struct PathFinder {
    cache: HashMap<String, Option<PathBuf>>,
}

impl ModuleFinder for PathFinder {
    fn find_module(
        &mut self,
        id: &str,
        search: &SearchPaths,
        fscache: &mut FileSystemCache,
    ) -> Option<PathBuf> {
        if let Some(hit) = self.cache.get(id) {
            return hit.clone();
        }
        let rel = id.replace('.', "/");
        let candidates = [
            format!("{rel}.pyi"),
            format!("{rel}.py"),
            format!("{rel}/__init__.pyi"),
            format!("{rel}/__init__.py"),
        ];
        let mut found = None;
        'roots: for root in search
            .source_paths
            .iter()
            .chain(search.package_paths.iter())
            .chain(search.typeshed_paths.iter())
        {
            for candidate in &candidates {
                let path = root.join(candidate);
                if fscache.is_file(&path) {
                    found = Some(path);
                    break 'roots;
                }
            }
        }
        self.cache.insert(id.to_string(), found.clone());
        found
    }
}

/// A temporary project on disk, with its own cache directory and a
/// pre-seeded `builtins` stub.
pub struct TempProject {
    _dir: tempfile::TempDir,
    root: PathBuf,
    pub options: Options,
    pub plugins: BTreeMap<String, String>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl TempProject {
    pub fn new() -> std::io::Result<Self> {
        // Deterministic message assertions.
        yansi::Paint::disable();
        let dir = tempfile::tempdir()?;
        // Canonicalized so that finder results and root source paths agree
        // even when the temp dir sits behind a symlink.
        let root = crate::utils::canonicalize(dir.path())
            .unwrap_or_else(|_| dir.path().to_path_buf());
        let mut options = Options::default();
        options.cache_dir = Some(root.join(".sift-cache"));
        options.platform = "linux".to_string();
        let project = Self {
            _dir: dir,
            root,
            options,
            plugins: BTreeMap::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        };
        // Every module implicitly depends on builtins.
        project.add_source("builtins.pyi", "def int(): ...\ndef str(): ...\n");
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.options.cache_dir.clone().expect("temp projects always have a cache dir")
    }

    /// Write (or overwrite) a source file, creating parent directories.
    pub fn add_source(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create source dirs");
        }
        fs::write(&path, contents).expect("write source");
        path
    }

    pub fn remove_source(&self, rel: &str) {
        let _ = fs::remove_file(self.root().join(rel));
    }

    pub fn search_paths(&self) -> SearchPaths {
        SearchPaths { source_paths: vec![self.root().to_path_buf()], ..Default::default() }
    }

    /// A frontend wired to this project's plugin set and pass log.
    pub fn frontend(&self) -> PyFrontend {
        PyFrontend::new().with_plugins(self.plugins.clone()).with_log(self.log.clone())
    }

    pub fn build(
        &self,
        sources: Vec<BuildSource>,
    ) -> std::result::Result<BuildResult<PyTree>, CompileError> {
        self.build_with(sources, self.frontend())
    }

    pub fn build_with(
        &self,
        sources: Vec<BuildSource>,
        frontend: PyFrontend,
    ) -> std::result::Result<BuildResult<PyTree>, CompileError> {
        crate::build(
            sources,
            self.options.clone(),
            self.search_paths(),
            frontend,
            Box::<PathFinder>::default(),
            None,
            None,
            None,
        )
    }

    /// All files currently present under the cache directory, sorted, as
    /// paths relative to the cache root.
    pub fn cache_files(&self) -> Vec<PathBuf> {
        let root = self.cache_dir();
        let mut files: Vec<PathBuf> = WalkDir::new(&root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().strip_prefix(&root).unwrap_or(entry.path()).to_path_buf())
            .collect();
        files.sort();
        files
    }

    /// All source files under the project root, sorted.
    pub fn source_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(self.root())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry
                        .path()
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext == "py" || ext == "pyi")
            })
            .map(|entry| entry.path().to_path_buf())
            .collect();
        files.sort();
        files
    }

    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Mark every module matching `pattern` as silent.
    pub fn silence(&mut self, pattern: &str) {
        self.options.per_module.push((
            pattern.to_string(),
            ModuleOverrides {
                follow_imports: Some(FollowImports::Silent),
                ..Default::default()
            },
        ));
    }
}
