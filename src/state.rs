//! Per-module build state.
//!
//! A [`State`] tracks one module through its whole lifecycle: discovery,
//! cache validation, parsing, the semantic and type-checking passes, and
//! finally the cache write. States refer to their peers by dotted module ID
//! and look them up through the graph map; parsed trees live in the
//! manager's module map, so the cyclic import graph contains no reference
//! cycles.

use crate::{
    analysis::{Analysis, NoParentModule, PRI_ALL, PRI_HIGH, PRI_INDIRECT},
    cache::{self, CacheMeta},
    config::{FollowImports, Options},
    error::CompileError,
    report::Severity,
    utils, Manager,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
};

/// The module graph: one state per reachable module, keyed by dotted ID.
pub type Graph = HashMap<String, State>;

/// Failure modes of state construction.
#[derive(Debug)]
pub(crate) enum StateError {
    /// The module could not be located; recovered by the graph loader which
    /// moves the dependency into the referrer's suppressed list.
    NotFound,
    /// A blocking failure that must unwind to the build entry point.
    Compile(CompileError),
}

impl From<CompileError> for StateError {
    fn from(err: CompileError) -> Self {
        StateError::Compile(err)
    }
}

/// The state for a module.
///
/// The source text is only set for modules supplied as literal text; in that
/// case `path` is `None`. Otherwise the source is read (and dropped again)
/// at parse time.
#[derive(Debug)]
pub struct State {
    /// Fully qualified module name.
    pub id: String,
    /// Path to the module source, if any.
    pub path: Option<PathBuf>,
    /// Rendered path, or `"<string>"` for literal sources; used in
    /// diagnostics and as the reporter's file key.
    pub xpath: String,
    /// Literal source text; cleared once parsed.
    pub source: Option<String>,
    /// Digest of the source that was actually parsed.
    pub source_hash: Option<String>,
    /// Digest recorded in the metadata record, if one was found (kept even
    /// when the record is later rejected).
    pub meta_source_hash: Option<String>,
    /// Validated metadata; present iff the cache was hit and validated.
    pub meta: Option<CacheMeta>,
    /// Modules directly imported by the module.
    pub dependencies: Vec<String>,
    /// Suppressed/missing dependencies.
    pub suppressed: Vec<String>,
    /// Import priority per dependency; minimum wins when a dependency is
    /// imported more than once.
    pub priorities: HashMap<String, u8>,
    /// Line of the first import per dependency.
    pub dep_line_map: HashMap<String, u64>,
    /// Parent package, its parent, and so on.
    pub ancestors: Vec<String>,
    /// Direct submodules known to exist.
    pub child_modules: BTreeSet<String>,
    /// `(path, line)` chain of imports that led here; diagnostics only.
    pub import_context: Vec<(String, u64)>,
    /// Line in the caller where the import occurred, if any.
    pub caller_line: u64,
    /// Discovery counter; tie-break in scheduling.
    pub order: u32,
    /// Cleared when the public interface changes.
    pub externally_same: bool,
    /// Digest of the serialized artifact from the previous run.
    pub interface_hash: String,
    /// Options specialized for this module.
    pub options: Options,
    /// Discard this module's diagnostics (silent-import mode).
    pub ignore_all: bool,
    /// This module or a transitive dependency had an error; blocks cache
    /// writes.
    pub transitive_error: bool,
    /// Fine-grained dependency triggers, when configured.
    pub fine_grained_deps: BTreeMap<String, BTreeSet<String>>,
}

impl State {
    /// Construct the state for one module, consulting the finder and the
    /// cache as needed.
    ///
    /// On a cache hit the dependency lists come from the validated record;
    /// otherwise the module is parsed immediately so its dependencies can be
    /// computed. In fine-grained cache mode a miss raises instead, deferring
    /// the module to a later stage.
    pub(crate) fn new<A: Analysis>(
        manager: &mut Manager<A>,
        id: Option<&str>,
        path: Option<PathBuf>,
        source: Option<String>,
        caller: Option<(&State, u64)>,
        ancestor_for: Option<&State>,
        root_source: bool,
    ) -> Result<State, StateError> {
        debug_assert!(
            id.is_some() || path.is_some() || source.is_some(),
            "neither id, path nor source given"
        );
        let order = manager.next_order();
        let mut import_context = Vec::new();
        let mut caller_line = 0;
        if let Some((caller_state, line)) = caller {
            import_context = caller_state.import_context.clone();
            import_context.push((caller_state.xpath.clone(), line));
            caller_line = line;
        }
        let id = id.map(str::to_string).unwrap_or_else(|| "__main__".to_string());
        let options = manager.options.clone_for_module(&id);

        let mut ignore_all = false;
        let mut path = path;
        if path.is_none() && source.is_none() {
            match find_module_and_diagnose(
                manager,
                &id,
                &options,
                caller,
                ancestor_for,
                root_source,
                false,
            ) {
                Ok((found, follow_imports)) => {
                    if follow_imports == FollowImports::Silent {
                        ignore_all = true;
                    }
                    path = Some(found);
                }
                Err(err) => {
                    if matches!(err, StateError::NotFound) {
                        manager.missing_modules.insert(id);
                    }
                    return Err(err);
                }
            }
        }
        let xpath =
            path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<string>".into());
        let mut source = source;
        if let Some(p) = &path {
            // A namespace package directory has no source of its own.
            if source.is_none() && manager.fscache.is_dir(p) {
                source = Some(String::new());
            }
        }

        let mut meta = None;
        let mut interface_hash = String::new();
        let mut meta_source_hash = None;
        if let Some(p) = &path {
            if source.is_none() && manager.cache_enabled {
                meta = cache::find_cache_meta(&id, p, manager);
                if let Some(found) = &meta {
                    interface_hash = found.interface_hash.clone();
                    meta_source_hash = Some(found.hash.clone());
                }
            }
        }

        let ancestors = compute_ancestors(&id, path.as_deref());
        let mut state = State {
            id,
            path,
            xpath,
            source,
            source_hash: None,
            meta_source_hash,
            meta: None,
            dependencies: Vec::new(),
            suppressed: Vec::new(),
            priorities: HashMap::new(),
            dep_line_map: HashMap::new(),
            ancestors,
            child_modules: BTreeSet::new(),
            import_context,
            caller_line,
            order,
            externally_same: true,
            interface_hash,
            options,
            ignore_all,
            transitive_error: false,
            fine_grained_deps: BTreeMap::new(),
        };

        let meta = cache::validate_meta(
            meta,
            &state.id,
            state.path.as_deref(),
            state.ignore_all,
            manager,
            false,
        );
        if let Some(meta) = meta {
            state.dependencies = meta.dependencies.clone();
            state.suppressed = meta.suppressed.clone();
            let all_deps = state.dependencies.iter().chain(state.suppressed.iter());
            state.priorities =
                all_deps.clone().cloned().zip(meta.dep_prios.iter().copied()).collect();
            state.dep_line_map = all_deps.cloned().zip(meta.dep_lines.iter().copied()).collect();
            state.child_modules = meta.child_modules.iter().cloned().collect();
            state.meta = Some(meta);
            if !manager.use_fine_grained_cache()
                && exist_added_packages(&state.suppressed.clone(), manager, &state.options)
            {
                // A previously missing package appeared, so the recorded
                // dependency lists are unreliable. Re-parsing is safe, the
                // cache is stale anyway.
                state.parse_file(manager)?;
                state.compute_dependencies(manager)?;
            }
        } else {
            if manager.use_fine_grained_cache() {
                // Pretend we only know about modules with cache information;
                // new modules are handled by the fine-grained update.
                debug!("deferring module to fine-grained update {} ({})", state.xpath, state.id);
                return Err(StateError::NotFound);
            }
            state.parse_file(manager)?;
            state.compute_dependencies(manager)?;
            state.child_modules = BTreeSet::new();
        }
        Ok(state)
    }

    /// The effective priority of `dep` for this module.
    pub fn priority(&self, dep: &str) -> u8 {
        self.priorities.get(dep).copied().unwrap_or(PRI_HIGH)
    }

    /// Whether this module is a package `__init__` file.
    pub fn is_package(&self) -> bool {
        self.path
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("__init__."))
    }

    /// The validated metadata of an allegedly fresh module.
    pub(crate) fn xmeta(&self) -> &CacheMeta {
        self.meta.as_ref().expect("missing meta on allegedly fresh module")
    }

    /// Whether the cache data for this module is fresh.
    ///
    /// `dependencies` may differ from the recorded list when a dependency was
    /// dropped due to suppression; a suppressed dependency coming back is
    /// detected later, by the scheduler.
    pub fn is_fresh(&self) -> bool {
        match &self.meta {
            Some(meta) => {
                self.is_interface_fresh()
                    && self.dependencies == meta.dependencies
                    && self.child_modules
                        == meta.child_modules.iter().cloned().collect::<BTreeSet<_>>()
            }
            None => false,
        }
    }

    pub fn is_interface_fresh(&self) -> bool {
        self.externally_same
    }

    /// Mark this module as having a stale public interface.
    pub(crate) fn mark_interface_stale<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
        on_errors: bool,
    ) {
        self.externally_same = false;
        if !on_errors {
            manager.stale_modules.insert(self.id.clone());
        }
    }

    /// Raise if a blocking error has been recorded.
    pub(crate) fn check_blockers<A: Analysis>(
        &self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        if manager.reporter.is_blockers() {
            debug!("bailing due to blocking errors");
            return Err(manager.reporter.compile_error());
        }
        Ok(())
    }

    /// Run `f` with this module's import context installed, converting panics
    /// into a blocking diagnostic that names the offending file.
    pub(crate) fn wrap_context<A: Analysis, T>(
        &self,
        manager: &mut Manager<A>,
        f: impl FnOnce(&mut Manager<A>) -> T,
    ) -> Result<T, CompileError> {
        let saved = manager.reporter.import_context();
        manager.reporter.set_import_context(self.import_context.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| f(manager)));
        let value = match outcome {
            Ok(value) => Some(value),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown cause".to_string());
                manager.reporter.set_file(self.xpath.clone(), Some(&self.id));
                manager.reporter.report(
                    0,
                    format!("INTERNAL ERROR while analyzing {}: {message}", self.id),
                    Severity::Error,
                    true,
                    false,
                );
                None
            }
        };
        manager.reporter.set_import_context(saved);
        self.check_blockers(manager)?;
        value.ok_or_else(|| manager.reporter.compile_error())
    }

    /// Load the fine-grained deps recorded for a cached module.
    pub(crate) fn load_fine_grained_deps<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        let meta = self.meta.as_ref().expect("cached module must have metadata");
        let deps_json =
            meta.deps_json.clone().expect("fine-grained record without deps file");
        let raw = manager.metastore.read(&deps_json).map_err(|err| {
            CompileError::from_message(format!(
                "sift: error reading fine-grained deps for '{}': {err}",
                self.id
            ))
        })?;
        let deps: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw).map_err(|err| {
            CompileError::from_message(format!(
                "sift: malformed fine-grained deps for '{}': {err}",
                self.id
            ))
        })?;
        self.fine_grained_deps =
            deps.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect();
        Ok(())
    }

    /// Deserialize the analysis artifact from the data file and publish it in
    /// the module map.
    pub(crate) fn load_tree<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        let meta = self.meta.as_ref().expect("cached module must have metadata");
        let raw = manager.metastore.read(&meta.data_json).map_err(|err| {
            CompileError::from_message(format!(
                "sift: error reading cache data for '{}': {err}",
                self.id
            ))
        })?;
        let tree: A::Tree = serde_json::from_str(&raw).map_err(|err| {
            CompileError::from_message(format!(
                "sift: malformed cache data for '{}': {err}",
                self.id
            ))
        })?;
        manager.modules.insert(self.id.clone(), tree);
        manager.add_stats("fresh_trees", 1);
        Ok(())
    }

    /// Resolve deferred symbol links to live nodes using the current module
    /// map.
    pub(crate) fn fix_cross_refs<A: Analysis>(&self, manager: &mut Manager<A>) {
        // Missing modules must be tolerated when the map is knowingly
        // incomplete: mixed-freshness processing and fine-grained loads.
        let allow_missing =
            manager.options.mixed_freshness || self.options.use_fine_grained_cache;
        let Manager { analysis, modules, .. } = manager;
        analysis.fix_cross_refs(&self.id, modules, allow_missing);
    }

    /// Re-inject each direct dependency into its parent module's namespace.
    ///
    /// Import semantics mutate the parent package when a submodule is
    /// imported, but the mutation is not persisted in the child's serialized
    /// form, so it is repeated after deserializing. Only needed for fresh
    /// SCCs; the semantic analyzer does it while processing stale ones.
    pub(crate) fn patch_dependency_parents<A: Analysis>(&self, manager: &mut Manager<A>) {
        let Manager { analysis, modules, .. } = manager;
        for dep in &self.dependencies {
            analysis.patch_parent_namespace(dep, modules);
        }
    }

    /// Recompute which dependencies count as suppressed, against the current
    /// graph.
    ///
    /// In silent mode the loader marks dependencies as suppressed while the
    /// graph is built; a re-parse inside the stale pipeline would wipe those
    /// decisions out, so they are reestablished here.
    pub(crate) fn fix_suppressed_dependencies(
        &mut self,
        graph_ids: &HashSet<String>,
        entry_points: &HashSet<String>,
    ) {
        let silent_mode = self.options.ignore_missing_imports
            || self.options.follow_imports == FollowImports::Skip;
        if !silent_mode {
            return;
        }
        let mut new_dependencies = Vec::new();
        let mut new_suppressed = Vec::new();
        for dep in self.dependencies.iter().chain(self.suppressed.iter()) {
            let ignored = self.suppressed.contains(dep) && !entry_points.contains(dep);
            if ignored || !graph_ids.contains(dep) {
                new_suppressed.push(dep.clone());
            } else {
                new_dependencies.push(dep.clone());
            }
        }
        self.dependencies = new_dependencies;
        self.suppressed = new_suppressed;
    }

    /// Parse the file and run the first semantic pass; a no-op if the module
    /// was already parsed during discovery.
    ///
    /// Everything done here is local to the file; dependencies are recorded
    /// separately by [`Self::compute_dependencies`].
    pub(crate) fn parse_file<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        if manager.modules.contains_key(&self.id) {
            return Ok(());
        }
        debug!("parsing {} ({})", self.xpath, self.id);

        let source = match self.source.take() {
            Some(source) => {
                self.source_hash = Some(utils::compute_hash(&source));
                source
            }
            None => {
                let path = self.path.clone().expect("state has neither path nor source");
                let source = manager.fscache.read(&path).map_err(|err| {
                    CompileError::from_message(format!(
                        "sift: can't read file '{}': {}",
                        path.display(),
                        std::io::Error::from(err).kind()
                    ))
                })?;
                self.source_hash =
                    Some(manager.fscache.md5(&path).expect("digest cached by read"));
                source
            }
        };

        let ignore_errors = self.ignore_all || self.options.ignore_errors;
        let id = self.id.clone();
        let xpath = self.xpath.clone();
        let tree = self.wrap_context(manager, |manager| {
            manager.reporter.set_file(xpath.clone(), Some(&id));
            let Manager { analysis, reporter, .. } = manager;
            analysis.parse(&id, &xpath, &source, ignore_errors, reporter)
        })?;
        let ignored = manager.analysis.ignored_lines(&tree);
        manager.reporter.set_file_ignored_lines(&self.xpath, ignored, ignore_errors);
        manager.modules.insert(self.id.clone(), tree);
        self.check_blockers(manager)
    }

    /// Compute the module's dependencies after parsing.
    ///
    /// Used when there was no up-to-date cache record; with one, the recorded
    /// lists are used instead. Missing dependencies are moved from
    /// `dependencies` to `suppressed` later, when the loader fails to
    /// construct them.
    pub(crate) fn compute_dependencies<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        let tree = &manager.modules[&self.id];
        let imports = manager.analysis.imports(tree);
        let file_is_package = self.is_package();

        let mut triples: Vec<(u8, String, u64)> = Vec::new();
        for node in &imports {
            if node.is_unreachable() {
                continue;
            }
            let resolved = node.imported_ids(
                &self.id,
                file_is_package,
                &mut |sub_id| manager.is_module(sub_id),
                &mut triples,
            );
            if let Err(NoParentModule { line }) = resolved {
                manager.reporter.set_file(self.xpath.clone(), Some(&self.id));
                manager.reporter.report(
                    line as i64,
                    "No parent module -- cannot perform relative import",
                    Severity::Error,
                    true,
                    false,
                );
            }
        }

        let mut dependencies = Vec::new();
        let mut priorities: HashMap<String, u8> = HashMap::new();
        let mut dep_line_map: HashMap<String, u64> = HashMap::new();
        for (pri, dep, line) in triples {
            let entry = priorities.entry(dep.clone()).or_insert(PRI_ALL);
            *entry = (*entry).min(pri);
            if dep == self.id {
                continue;
            }
            if !dep_line_map.contains_key(&dep) {
                dependencies.push(dep.clone());
                dep_line_map.insert(dep, line);
            }
        }
        // Every module implicitly depends on builtins.
        if self.id != "builtins" && !dep_line_map.contains_key("builtins") {
            dependencies.push("builtins".to_string());
        }

        self.dependencies = dependencies;
        self.suppressed = Vec::new();
        self.priorities = priorities;
        self.dep_line_map = dep_line_map;

        // Can fail due to bogus relative imports.
        self.check_blockers(manager)
    }

    /// Semantic analysis pass two: name binding and scope resolution.
    pub(crate) fn semantic_analysis<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<Vec<(u32, A::Patch)>, CompileError> {
        let id = self.id.clone();
        let options = self.options.clone();
        self.wrap_context(manager, |manager| {
            let Manager { analysis, modules, reporter, .. } = manager;
            analysis.semantic_pass_two(&id, modules, &options, reporter)
        })
    }

    /// Semantic analysis pass three: final resolution.
    pub(crate) fn semantic_analysis_pass_three<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<Vec<(u32, A::Patch)>, CompileError> {
        let id = self.id.clone();
        let options = self.options.clone();
        self.wrap_context(manager, |manager| {
            let Manager { analysis, modules, reporter, .. } = manager;
            analysis.semantic_pass_three(&id, modules, &options, reporter)
        })
    }

    pub(crate) fn type_check_first_pass<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        let id = self.id.clone();
        let options = self.options.clone();
        self.wrap_context(manager, |manager| {
            let Manager { analysis, modules, reporter, .. } = manager;
            analysis.type_check_first(&id, modules, &options, reporter);
        })
    }

    /// Returns whether the pass produced more deferred work.
    pub(crate) fn type_check_second_pass<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<bool, CompileError> {
        let id = self.id.clone();
        let options = self.options.clone();
        self.wrap_context(manager, |manager| {
            let Manager { analysis, modules, reporter, .. } = manager;
            analysis.type_check_second(&id, modules, &options, reporter)
        })
    }

    /// Wrap up after type checking: run the frontend's finish hook and patch
    /// indirect dependencies.
    ///
    /// Indirect dependencies are patched even in full builds: the cache may
    /// still be written, and it must be correct.
    pub(crate) fn finish_passes<A: Analysis>(
        &mut self,
        manager: &mut Manager<A>,
    ) -> Result<(), CompileError> {
        let id = self.id.clone();
        let options = self.options.clone();
        self.wrap_context(manager, |manager| {
            let Manager { analysis, modules, reporter, .. } = manager;
            analysis.finish(&id, modules, &options, reporter);
        })?;
        let refs = manager.analysis.module_refs(&self.id);
        self.patch_indirect_dependencies(refs, manager);
        Ok(())
    }

    fn patch_indirect_dependencies<A: Analysis>(
        &mut self,
        module_refs: BTreeSet<String>,
        manager: &mut Manager<A>,
    ) {
        let valid = self.valid_references();
        for dep in module_refs {
            if valid.contains(&dep) || !manager.modules.contains_key(&dep) {
                continue;
            }
            if !self.suppressed.contains(&dep) {
                if manager.missing_modules.contains(&dep) {
                    self.suppressed.push(dep);
                } else {
                    self.dependencies.push(dep.clone());
                    self.priorities.insert(dep, PRI_INDIRECT);
                }
            }
        }
    }

    /// Compute fine-grained dependency triggers for this module.
    ///
    /// Changes to bundled stubs are not tracked; they only change together
    /// with the analyzer, which invalidates everything anyway.
    pub(crate) fn compute_fine_grained_deps<A: Analysis>(&mut self, manager: &mut Manager<A>) {
        if let Some(path) = &self.path {
            if manager.search_paths.typeshed_paths.iter().any(|dir| path.starts_with(dir)) {
                return;
            }
        }
        let Manager { analysis, modules, .. } = manager;
        self.fine_grained_deps = analysis.fine_grained_deps(&self.id, modules);
    }

    /// The references this module may legitimately hold without them counting
    /// as indirect dependencies.
    fn valid_references(&self) -> HashSet<String> {
        let mut valid: HashSet<String> = self
            .dependencies
            .iter()
            .chain(self.suppressed.iter())
            .chain(self.ancestors.iter())
            .cloned()
            .collect();
        valid.insert(self.id.clone());
        if valid.contains("os") {
            valid.insert("os.path".to_string());
        }
        valid
    }

    /// Write the cache files for this module, or delete them when errors were
    /// recorded.
    pub(crate) fn write_cache<A: Analysis>(&mut self, manager: &mut Manager<A>) {
        let Some(path) = self.path.clone() else { return };
        if manager.options.cache_dir.is_none() || manager.options.fine_grained_incremental {
            return;
        }
        let is_errors = if manager.options.mixed_freshness {
            manager.reporter.is_errors_for_file(&self.xpath)
        } else {
            self.transitive_error
        };
        if is_errors {
            cache::delete_cache(&self.id, &path, manager);
            self.meta = None;
            self.mark_interface_stale(manager, true);
            return;
        }
        let dep_prios = self.dependency_priorities();
        let dep_lines = self.dependency_lines();
        let child_modules: Vec<String> = self.child_modules.iter().cloned().collect();
        let source_hash =
            self.source_hash.clone().expect("analyzed module must have a source hash");
        let (new_interface_hash, meta) = cache::write_cache(
            &self.id,
            &path,
            &self.fine_grained_deps,
            &self.dependencies,
            &self.suppressed,
            &child_modules,
            &dep_prios,
            &dep_lines,
            &self.interface_hash,
            &source_hash,
            self.ignore_all,
            manager,
        );
        self.meta = meta;
        if new_interface_hash == self.interface_hash {
            debug!("cached module {} has same interface", self.id);
        } else {
            debug!("cached module {} has changed interface", self.id);
            self.mark_interface_stale(manager, false);
            self.interface_hash = new_interface_hash;
        }
    }

    pub(crate) fn mark_as_rechecked<A: Analysis>(&self, manager: &mut Manager<A>) {
        manager.rechecked_modules.insert(self.id.clone());
    }

    /// Report errors for import targets that don't exist; with
    /// `suppressed_only`, check only suppressed dependencies.
    pub(crate) fn verify_dependencies<A: Analysis>(
        &self,
        manager: &mut Manager<A>,
        suppressed_only: bool,
    ) {
        let all_deps: Vec<String> = if suppressed_only {
            self.suppressed.clone()
        } else {
            // Indirect dependencies are synthesized, not imported; they get
            // no missing-module diagnostics.
            self.dependencies
                .iter()
                .filter(|dep| self.priority(dep) != PRI_INDIRECT)
                .chain(self.suppressed.iter())
                .chain(self.ancestors.iter())
                .cloned()
                .collect()
        };
        for dep in all_deps {
            if manager.modules.contains_key(&dep) {
                continue;
            }
            let options = manager.options.clone_for_module(&dep);
            if options.ignore_missing_imports {
                continue;
            }
            let line = self.dep_line_map.get(&dep).copied().unwrap_or(1);
            let (caller, ancestor) = if self.ancestors.contains(&dep) {
                (None, Some(self))
            } else {
                (Some((self, line)), None)
            };
            // Called just for its diagnostic side effects; swallow failures
            // produced while diagnosing.
            let _ = find_module_and_diagnose(manager, &dep, &options, caller, ancestor, false, false);
        }
    }

    /// Priorities parallel to `dependencies + suppressed`.
    pub(crate) fn dependency_priorities(&self) -> Vec<u8> {
        self.dependencies
            .iter()
            .chain(self.suppressed.iter())
            .map(|dep| self.priority(dep))
            .collect()
    }

    /// Import lines parallel to `dependencies + suppressed`.
    pub(crate) fn dependency_lines(&self) -> Vec<u64> {
        self.dependencies
            .iter()
            .chain(self.suppressed.iter())
            .map(|dep| self.dep_line_map.get(dep).copied().unwrap_or(1))
            .collect()
    }

    pub(crate) fn generate_unused_ignore_notes<A: Analysis>(&self, manager: &mut Manager<A>) {
        if !self.options.warn_unused_ignores {
            return;
        }
        // A module loaded from cache may have suppressed dependencies backed
        // by ignore comments; re-verify them so those comments don't come out
        // as spuriously unused.
        if self.meta.is_some() {
            self.verify_dependencies(manager, true);
        }
        manager.reporter.generate_unused_ignore_notes(&self.xpath);
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(id: &str, order: u32, deps: &[(&str, u8)]) -> State {
        State {
            id: id.to_string(),
            path: None,
            xpath: "<string>".to_string(),
            source: None,
            source_hash: None,
            meta_source_hash: None,
            meta: None,
            dependencies: deps.iter().map(|(dep, _)| dep.to_string()).collect(),
            suppressed: Vec::new(),
            priorities: deps.iter().map(|(dep, pri)| (dep.to_string(), *pri)).collect(),
            dep_line_map: HashMap::new(),
            ancestors: Vec::new(),
            child_modules: BTreeSet::new(),
            import_context: Vec::new(),
            caller_line: 0,
            order,
            externally_same: true,
            interface_hash: String::new(),
            options: Options { cache_dir: None, ..Options::default() },
            ignore_all: false,
            transitive_error: false,
            fine_grained_deps: BTreeMap::new(),
        }
    }
}

/// Parent packages of a dotted module name; empty for files whose stem
/// itself contains a dot (just a weird filename, not a package member).
fn compute_ancestors(id: &str, path: Option<&Path>) -> Vec<String> {
    if let Some(path) = path {
        let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
        if stem.contains('.') {
            return Vec::new();
        }
    }
    let mut ancestors = Vec::new();
    let mut parent = id;
    while let Some(idx) = parent.rfind('.') {
        parent = &parent[..idx];
        ancestors.push(parent.to_string());
    }
    ancestors
}

/// Find a module by name, honoring the follow-imports policy and producing
/// diagnostics.
///
/// The configured policy can be overridden: root sources and `builtins` are
/// always followed normally, stubs are followed normally unless stub
/// following is enabled, and modules under silenced roots are coerced to
/// silent. Returns the path together with the effective policy; raises
/// `NotFound` when the module is missing or skipped.
pub(crate) fn find_module_and_diagnose<A: Analysis>(
    manager: &mut Manager<A>,
    id: &str,
    options: &Options,
    caller: Option<(&State, u64)>,
    ancestor_for: Option<&State>,
    root_source: bool,
    skip_diagnose: bool,
) -> Result<(PathBuf, FollowImports), StateError> {
    if let Some(path) = manager.find_module(id) {
        let mut follow_imports = options.follow_imports;
        let is_stub = path.extension().and_then(|ext| ext.to_str()) == Some("pyi");
        if root_source || (is_stub && !options.follow_imports_for_stubs) || id == "builtins" {
            follow_imports = FollowImports::Normal;
        }
        if skip_diagnose {
            // Probing only: no logging, no diagnostics.
        } else {
            match follow_imports {
                FollowImports::Normal => {}
                FollowImports::Silent => {
                    debug!("silencing {} ({id})", path.display());
                }
                FollowImports::Skip | FollowImports::Error => {
                    if !manager.missing_modules.contains(id) {
                        debug!("skipping {} ({id})", path.display());
                    }
                    if follow_imports == FollowImports::Error {
                        if let Some(ancestor) = ancestor_for {
                            skipping_ancestor(manager, id, ancestor);
                        } else if let Some((caller_state, caller_line)) = caller {
                            skipping_module(manager, caller_line, caller_state, id);
                        }
                    }
                    return Err(StateError::NotFound);
                }
            }
        }
        if options.silence_site_packages && manager.search_paths.is_silenced_path(&path) {
            // Silence errors in site packages and bundled stubs.
            follow_imports = FollowImports::Silent;
        }
        Ok((path, follow_imports))
    } else {
        // Typically a misspelled module name, a missing stub, or a module
        // not in the search path.
        if skip_diagnose {
            return Err(StateError::NotFound);
        }
        if let Some((caller_state, caller_line)) = caller {
            if !(options.ignore_missing_imports || in_partial_package(id, manager)) {
                module_not_found(manager, caller_line, caller_state, id)?;
            }
            Err(StateError::NotFound)
        } else if root_source {
            // A root source that can't be found is always fatal.
            Err(StateError::Compile(CompileError::from_message(format!(
                "sift: can't find module '{id}'"
            ))))
        } else {
            Err(StateError::NotFound)
        }
    }
}

/// A filesystem path for module `id`, or `None` if not found.
pub(crate) fn find_module_simple<A: Analysis>(
    id: &str,
    manager: &mut Manager<A>,
) -> Option<PathBuf> {
    manager.find_module(id)
}

/// Find whether any newly added package was previously suppressed.
///
/// Modules that are roots of the build are excluded: their importers are
/// invalidated through the normal mechanism.
pub(crate) fn exist_added_packages<A: Analysis>(
    suppressed: &[String],
    manager: &mut Manager<A>,
    options: &Options,
) -> bool {
    for dep in suppressed {
        if manager.source_set.source_modules.contains(dep) {
            continue;
        }
        let Some(path) = find_module_simple(dep, manager) else { continue };
        let is_stub = path.extension().and_then(|ext| ext.to_str()) == Some("pyi");
        if options.follow_imports == FollowImports::Skip
            && (!is_stub || options.follow_imports_for_stubs)
        {
            continue;
        }
        let is_init = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("__init__."));
        if is_init {
            // A slightly lenient test: cheap, and erring towards re-parsing
            // only costs time, never correctness.
            return true;
        }
    }
    false
}

/// Check whether a missing module could be part of a partial stub package:
/// a package whose stub admits arbitrary submodules.
pub(crate) fn in_partial_package<A: Analysis>(id: &str, manager: &mut Manager<A>) -> bool {
    let mut id = id.to_string();
    while let Some(idx) = id.rfind('.') {
        let parent = id[..idx].to_string();
        let partial = if let Some(tree) = manager.modules.get(&parent) {
            Some(manager.analysis.is_partial_stub_package(tree))
        } else {
            probe_tree(&parent, manager)
                .map(|tree| manager.analysis.is_partial_stub_package(&tree))
        };
        match partial {
            Some(true) => return true,
            // A complete subpackage: bail out soon.
            Some(false) => return false,
            None => {}
        }
        id = parent;
    }
    false
}

/// Quickly obtain a module's tree without processing it further.
///
/// Temporary by construction: no diagnostics, no missing-module recording,
/// no cache writes; the tree is not published in the module map.
fn probe_tree<A: Analysis>(id: &str, manager: &mut Manager<A>) -> Option<A::Tree> {
    let options = manager.options.clone_for_module(id);
    let (path, follow_imports) =
        find_module_and_diagnose(manager, id, &options, None, None, false, true).ok()?;
    if manager.cache_enabled {
        let meta = cache::find_cache_meta(id, &path, manager);
        let ignore_all = follow_imports == FollowImports::Silent;
        if let Some(meta) =
            cache::validate_meta(meta, id, Some(&path), ignore_all, manager, true)
        {
            if let Ok(raw) = manager.metastore.read(&meta.data_json) {
                if let Ok(tree) = serde_json::from_str::<A::Tree>(&raw) {
                    return Some(tree);
                }
            }
        }
    }
    let source = manager.fscache.read(&path).ok()?;
    let mut scratch = crate::report::Reporter::new();
    let Manager { analysis, .. } = manager;
    Some(analysis.parse(id, &path.display().to_string(), &source, true, &mut scratch))
}

/// Produce diagnostics for an import that could not be resolved.
fn module_not_found<A: Analysis>(
    manager: &mut Manager<A>,
    line: u64,
    caller_state: &State,
    target: &str,
) -> Result<(), CompileError> {
    let saved = manager.reporter.import_context();
    manager.reporter.set_import_context(caller_state.import_context.clone());
    manager.reporter.set_file(caller_state.xpath.clone(), Some(&caller_state.id));
    if target == "builtins" {
        manager.reporter.report(
            line as i64,
            "Cannot find 'builtins' module. The bundled stubs appear broken!",
            Severity::Error,
            true,
            false,
        );
        let err = manager.reporter.compile_error();
        manager.reporter.set_import_context(saved);
        return Err(err);
    }
    manager.reporter.report(
        line as i64,
        format!("Cannot find module named '{target}'"),
        Severity::Error,
        false,
        false,
    );
    manager.reporter.report(
        line as i64,
        "See the missing-imports documentation for how to silence this error",
        Severity::Note,
        false,
        true,
    );
    manager.reporter.set_import_context(saved);
    Ok(())
}

/// Produce a note for an import ignored due to the error follow-imports
/// policy.
fn skipping_module<A: Analysis>(
    manager: &mut Manager<A>,
    line: u64,
    caller_state: &State,
    id: &str,
) {
    let saved = manager.reporter.import_context();
    manager.reporter.set_import_context(caller_state.import_context.clone());
    manager.reporter.set_file(caller_state.xpath.clone(), Some(&caller_state.id));
    manager.reporter.report(
        line as i64,
        format!("Import of '{id}' ignored"),
        Severity::Note,
        false,
        false,
    );
    manager.reporter.report(
        line as i64,
        "(Using follow-imports=error, module not passed on command line)",
        Severity::Note,
        false,
        true,
    );
    manager.reporter.set_import_context(saved);
}

/// Produce a note for an ancestor package ignored due to the error
/// follow-imports policy.
fn skipping_ancestor<A: Analysis>(manager: &mut Manager<A>, id: &str, ancestor_for: &State) {
    manager.reporter.set_import_context(Vec::new());
    manager.reporter.set_file(ancestor_for.xpath.clone(), Some(&ancestor_for.id));
    manager.reporter.report(
        -1,
        format!("Ancestor package '{id}' ignored"),
        Severity::Note,
        false,
        true,
    );
    manager.reporter.report(
        -1,
        "(Using follow-imports=error, submodule passed on command line)",
        Severity::Note,
        false,
        true,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_from_dotted_name() {
        assert_eq!(
            compute_ancestors("a.b.c", Some(Path::new("src/a/b/c.py"))),
            vec!["a.b".to_string(), "a".to_string()]
        );
        assert_eq!(compute_ancestors("top", None), Vec::<String>::new());
        // A dot in the file stem marks a weird filename, not a package.
        assert_eq!(
            compute_ancestors("a.b", Some(Path::new("src/a.b.py"))),
            Vec::<String>::new()
        );
    }

    #[test]
    fn dependency_metadata_arrays_stay_parallel() {
        let mut state = State::new_for_tests("m", 1, &[("a", 10), ("b", 5)]);
        state.suppressed.push("gone".to_string());
        state.dep_line_map.insert("a".to_string(), 3);

        let prios = state.dependency_priorities();
        let lines = state.dependency_lines();
        assert_eq!(prios.len(), state.dependencies.len() + state.suppressed.len());
        assert_eq!(lines.len(), prios.len());
        assert_eq!(prios, vec![10, 5, PRI_HIGH]);
        assert_eq!(lines, vec![3, 1, 1]);
    }

    #[test]
    fn freshness_requires_matching_dependency_lists() {
        let mut state = State::new_for_tests("m", 1, &[("a", 10)]);
        assert!(!state.is_fresh());

        state.meta = Some(CacheMeta {
            id: "m".to_string(),
            path: "m.py".to_string(),
            mtime: 0,
            size: 0,
            hash: String::new(),
            data_mtime: 0,
            deps_mtime: None,
            dependencies: vec!["a".to_string()],
            suppressed: vec![],
            child_modules: vec![],
            options: serde_json::Value::Null,
            dep_prios: vec![10],
            dep_lines: vec![1],
            interface_hash: String::new(),
            version_id: String::new(),
            ignore_all: false,
            data_json: String::new(),
            deps_json: None,
        });
        assert!(state.is_fresh());

        state.dependencies.push("new_dep".to_string());
        assert!(!state.is_fresh());
        state.dependencies.pop();

        state.externally_same = false;
        assert!(!state.is_fresh());
    }
}
