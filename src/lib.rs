//! Build orchestration for the sift static analyzer.
//!
//! Given a set of root source files, the orchestrator discovers the
//! transitive set of imported modules ([`resolver`]), decides per module
//! whether a cached analysis artifact can be reused ([`cache`]), and drives
//! each module through parsing, semantic analysis and type checking in an
//! order dictated by the strongly connected components of the import graph
//! ([`pipeline`]).
//!
//! The language-specific pieces -- the parser, the semantic analyzers, the
//! type checker and the module finder -- are collaborators supplied by the
//! caller through the traits in [`analysis`]. Everything is single-threaded
//! and cooperative: correctness of the cross-reference fixup and the patch
//! protocol depends on a single writer per module.

#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod analysis;
pub use analysis::{
    import_priority, Analysis, ImportNode, ModuleFinder, Modules, PRI_ALL, PRI_GUARDED, PRI_HIGH,
    PRI_INDIRECT, PRI_LOW, PRI_MED,
};

pub mod cache;
pub use cache::{
    BufferedMetadataStore, CacheMeta, FilesystemMetadataStore, MetadataStore,
    PLUGIN_SNAPSHOT_FILE,
};

mod config;
pub use config::{default_cache_dir, FollowImports, ModuleOverrides, Options, SearchPaths};

pub mod error;
pub use error::{BuildError, CompileError, IoError, Result};

pub mod fscache;
pub use fscache::{FileStat, FileSystemCache};

mod graph;

pub mod report;
pub use report::{Reporter, Severity};

mod pipeline;
mod resolver;

pub mod state;
pub use state::{Graph, State};

pub mod utils;

/// Utilities for creating and testing temporary analysis projects.
#[cfg(feature = "project-util")]
pub mod project_util;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};

/// A module to be analyzed, as requested by the caller.
///
/// At least one of `module`, `path` and `text` must be given. Literal `text`
/// serves the analyze-a-string entry point; in that case `path` is `None`.
#[derive(Clone, Debug, Default)]
pub struct BuildSource {
    /// Dotted module name, if known.
    pub module: Option<String>,
    /// Path to the source file.
    pub path: Option<PathBuf>,
    /// Literal source text.
    pub text: Option<String>,
}

impl BuildSource {
    /// A root source identified by module name; the path is resolved through
    /// the module finder.
    pub fn from_module(module: impl Into<String>) -> Self {
        Self { module: Some(module.into()), path: None, text: None }
    }

    /// A root source identified by file path.
    pub fn from_path(module: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { module: Some(module.into()), path: Some(path.into()), text: None }
    }

    /// A root source supplied as a literal string.
    pub fn from_text(module: impl Into<String>, text: impl Into<String>) -> Self {
        Self { module: Some(module.into()), path: None, text: Some(text.into()) }
    }
}

/// Efficiently tests membership in the set of root sources.
#[derive(Debug, Default)]
pub struct SourceSet {
    pub source_text_present: bool,
    pub source_modules: HashSet<String>,
    pub source_paths: HashSet<PathBuf>,
}

impl SourceSet {
    fn new(sources: &[BuildSource]) -> Self {
        let mut set = Self::default();
        for source in sources {
            if source.text.is_some() {
                set.source_text_present = true;
            } else if let Some(path) = &source.path {
                set.source_paths.insert(path.clone());
            } else if let Some(module) = &source.module {
                set.source_modules.insert(module.clone());
            }
        }
        set
    }
}

/// Sink invoked with `(messages, is_serious)` at each SCC boundary.
pub type FlushErrors = Box<dyn FnMut(Vec<String>, bool)>;

/// Holds the shared state of one build.
///
/// Constructed at [`build`] entry and dropped at return; the discovery
/// counter and the global caches (plugin snapshot, protocol dependencies)
/// live here rather than as ambient globals.
pub struct Manager<A: Analysis> {
    pub options: Options,
    pub search_paths: SearchPaths,
    pub source_set: SourceSet,
    /// Rendered analyzer version, recorded in every metadata record.
    pub version_id: String,
    /// All parsed or cache-loaded trees, shared by the passes.
    pub modules: Modules<A::Tree>,
    /// Modules that could not be imported, so far.
    pub missing_modules: HashSet<String>,
    /// Modules whose interface changed this run.
    pub stale_modules: HashSet<String>,
    /// Modules fully re-analyzed this run.
    pub rechecked_modules: HashSet<String>,
    /// The language frontend.
    pub analysis: A,
    /// The module-path finder.
    pub finder: Box<dyn ModuleFinder>,
    /// Shared diagnostic channel; flushed at SCC boundaries.
    pub reporter: Reporter,
    /// Memoized view of the file system.
    pub fscache: FileSystemCache,
    /// Mediates all cache-file IO.
    pub metastore: Box<dyn MetadataStore>,
    /// Whether the cache is being read; disabled at runtime when a
    /// fine-grained load fails halfway.
    pub cache_enabled: bool,
    /// Fingerprints of the currently active plugins.
    pub plugins_snapshot: BTreeMap<String, String>,
    /// Snapshot recorded by the previous run, if any.
    pub old_plugins_snapshot: Option<BTreeMap<String, String>>,
    /// The loaded or computed protocol-dependency map.
    pub proto_deps: Option<BTreeMap<String, BTreeSet<String>>>,
    /// Instrumentation counters; `fresh_metas` doubles as a correctness
    /// signal for the protocol-cache consistency check.
    pub stats: HashMap<String, u64>,
    flush: Option<FlushErrors>,
    collected_messages: Vec<String>,
    order_counter: u32,
    start_time: Instant,
}

impl<A: Analysis> Manager<A> {
    fn new(
        options: Options,
        search_paths: SearchPaths,
        sources: &[BuildSource],
        analysis: A,
        finder: Box<dyn ModuleFinder>,
        flush: Option<FlushErrors>,
        fscache: FileSystemCache,
    ) -> Self {
        let version_id = options.version.to_string();
        let cache_enabled = options.cache_readable()
            && (!options.fine_grained_incremental || options.use_fine_grained_cache);
        let cache_prefix = cache::cache_dir_prefix(&options);
        let metastore: Box<dyn MetadataStore> = {
            let root = cache_prefix
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("sift-disabled-cache"));
            if options.buffered_cache {
                Box::new(BufferedMetadataStore::new(root))
            } else {
                Box::new(FilesystemMetadataStore::new(root))
            }
        };
        let old_plugins_snapshot = if cache_prefix.is_some() {
            cache::read_plugins_snapshot(metastore.as_ref())
        } else {
            None
        };
        let plugins_snapshot = analysis.plugins_snapshot();
        let mut reporter = Reporter::new();
        if let Ok(cwd) = std::env::current_dir() {
            // Error messages leave off the current directory prefix.
            reporter.set_ignore_prefix(cwd.display().to_string());
        }
        Self {
            options,
            search_paths,
            source_set: SourceSet::new(sources),
            version_id,
            modules: Modules::new(),
            missing_modules: HashSet::new(),
            stale_modules: HashSet::new(),
            rechecked_modules: HashSet::new(),
            analysis,
            finder,
            reporter,
            fscache,
            metastore,
            cache_enabled,
            plugins_snapshot,
            old_plugins_snapshot,
            proto_deps: None,
            stats: HashMap::new(),
            flush,
            collected_messages: Vec::new(),
            order_counter: 0,
            start_time: Instant::now(),
        }
    }

    /// The next discovery counter value.
    pub(crate) fn next_order(&mut self) -> u32 {
        self.order_counter += 1;
        self.order_counter
    }

    /// Resolve `id` through the module finder.
    pub fn find_module(&mut self, id: &str) -> Option<PathBuf> {
        let Self { finder, search_paths, fscache, .. } = self;
        finder.find_module(id, search_paths, fscache)
    }

    /// Is there a file in the file system corresponding to module `id`?
    pub fn is_module(&mut self, id: &str) -> bool {
        self.find_module(id).is_some()
    }

    pub fn use_fine_grained_cache(&self) -> bool {
        self.cache_enabled && self.options.use_fine_grained_cache
    }

    /// A cache file's mtime; zero in bazel mode, whose distributed cache
    /// tolerates no filesystem metadata in output files.
    pub(crate) fn getmtime(&self, name: &str) -> Result<i64, IoError> {
        if self.options.bazel {
            Ok(0)
        } else {
            self.metastore.getmtime(name)
        }
    }

    /// Convert a source path to absolute form; to relative in bazel mode.
    pub(crate) fn normpath(&self, path: &Path) -> PathBuf {
        if self.options.bazel {
            utils::relativize(path)
        } else {
            utils::absolutize(path)
        }
    }

    pub(crate) fn add_stats(&mut self, key: &str, n: u64) {
        *self.stats.entry(key.to_string()).or_default() += n;
    }

    /// Hand a batch of formatted messages to the flush sink, or collect them
    /// for the build result when no sink was given.
    pub(crate) fn flush_errors(&mut self, messages: Vec<String>, serious: bool) {
        match &mut self.flush {
            Some(flush) => flush(messages, serious),
            None => self.collected_messages.extend(messages),
        }
    }
}

/// The result of a successful build.
#[derive(Debug)]
pub struct BuildResult<T> {
    /// The full module graph, one state per reachable module.
    pub graph: Graph,
    /// The trees loaded during the build. A fully warm build queues fresh
    /// components without materializing them, so modules may legitimately be
    /// absent here even though they appear in `graph`.
    pub modules: Modules<T>,
    /// Whether a pre-existing cache was consulted.
    pub used_cache: bool,
    /// Diagnostics, when no flush sink was supplied; empty otherwise.
    pub errors: Vec<String>,
    pub missing_modules: HashSet<String>,
    pub stale_modules: HashSet<String>,
    pub rechecked_modules: HashSet<String>,
    pub stats: HashMap<String, u64>,
}

/// Analyze a program.
///
/// A single call performs parsing, semantic analysis and type checking for
/// the requested sources and everything they transitively import. Returns a
/// [`BuildResult`] if the build completed (type errors are non-blocking and
/// land in the result); raises [`CompileError`] on blocking failures, with
/// pending diagnostics flushed first.
///
/// `alt_lib_path` is an additional directory consulted first when resolving
/// modules. If `flush_errors` is given, every diagnostic batch is passed to
/// it as it is produced and the `errors` fields of both the result and the
/// failure stay empty; otherwise diagnostics accumulate in those fields.
#[instrument(skip_all, name = "build")]
#[allow(clippy::too_many_arguments)]
pub fn build<A: Analysis>(
    sources: Vec<BuildSource>,
    options: Options,
    mut search_paths: SearchPaths,
    analysis: A,
    finder: Box<dyn ModuleFinder>,
    alt_lib_path: Option<PathBuf>,
    flush_errors: Option<FlushErrors>,
    fscache: Option<FileSystemCache>,
) -> std::result::Result<BuildResult<A::Tree>, CompileError> {
    if let Some(alt) = alt_lib_path {
        search_paths.source_paths.insert(0, alt);
    }
    let mut manager = Manager::new(
        options,
        search_paths,
        &sources,
        analysis,
        finder,
        flush_errors,
        fscache.unwrap_or_default(),
    );

    let outcome = pipeline::dispatch(&sources, &mut manager);
    manager.metastore.commit();
    debug!(
        "build finished in {:.3} seconds with {} modules, and {} errors",
        manager.start_time.elapsed().as_secs_f64(),
        manager.modules.len(),
        manager.reporter.num_messages()
    );

    match outcome {
        Ok(graph) => Ok(BuildResult {
            graph,
            modules: std::mem::take(&mut manager.modules),
            used_cache: manager.cache_enabled,
            errors: std::mem::take(&mut manager.collected_messages),
            missing_modules: std::mem::take(&mut manager.missing_modules),
            stale_modules: std::mem::take(&mut manager.stale_modules),
            rechecked_modules: std::mem::take(&mut manager.rechecked_modules),
            stats: std::mem::take(&mut manager.stats),
        }),
        Err(mut err) => {
            // Stream out whatever the failure carried, then hand the caller
            // either all of the collected messages or none, depending on
            // whether a sink is in place.
            let serious = !err.use_stdout;
            manager.flush_errors(err.messages.clone(), serious);
            err.messages = std::mem::take(&mut manager.collected_messages);
            Err(err)
        }
    }
}
