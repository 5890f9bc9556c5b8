//! Support for caching analysis results between builds.
//!
//! Every analyzed module leaves two files behind: a metadata record
//! (`<id>.meta.json`) describing the source it was computed from, and the
//! serialized analysis artifact itself (`<id>.data.json`). A third optional
//! file (`<id>.deps.json`) carries fine-grained dependency triggers. On a
//! subsequent build the validator decides per module whether the recorded
//! state still matches the file system, the analyzer version, the option set
//! and the plugin fingerprint; only then may the artifact be loaded instead
//! of re-analyzed.
//!
//! Records are never mutated in place: a fresh record replaces the old file
//! atomically, and cache IO failures are advisory (the validator rejects, the
//! writer logs and continues).

use crate::{
    analysis::Analysis,
    config::Options,
    error::IoError,
    state::Graph,
    utils, Manager,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

/// File at the cache root recording the fingerprints of active plugins.
pub const PLUGIN_SNAPSHOT_FILE: &str = "@plugins_snapshot.json";

/// Files at the cache root holding the protocol-dependency graph, which is a
/// global property of the program and therefore serialized per build rather
/// than per module.
pub fn proto_deps_cache_names() -> (String, String) {
    ("@proto_deps.meta.json".to_string(), "@proto_deps.data.json".to_string())
}

fn default_true() -> bool {
    true
}

/// The per-module metadata record.
///
/// `dep_prios` and `dep_lines` are parallel with `dependencies + suppressed`;
/// `suppressed` holds the reachable imports that were prevented by silent
/// mode or simply not found, so that a later appearance invalidates the
/// record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub id: String,
    /// Recorded source path, forward-slashed; relative in bazel mode.
    pub path: String,
    /// Source mtime in whole seconds; zero in bazel mode.
    pub mtime: i64,
    pub size: u64,
    /// Digest of the source the artifact was computed from.
    pub hash: String,
    /// Mtime of the data file at the time it was written; guards against the
    /// artifact being rewritten behind the record's back.
    pub data_mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps_mtime: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub suppressed: Vec<String>,
    #[serde(default)]
    pub child_modules: Vec<String>,
    /// The recorded subset of build options that affect analysis results.
    pub options: serde_json::Value,
    #[serde(default)]
    pub dep_prios: Vec<u8>,
    #[serde(default)]
    pub dep_lines: Vec<u64>,
    /// Digest over the serialized artifact; equality certifies that nothing
    /// externally visible changed.
    #[serde(default)]
    pub interface_hash: String,
    /// Analyzer version that wrote the record.
    pub version_id: String,
    #[serde(default = "default_true")]
    pub ignore_all: bool,

    /// Store-relative name of the sibling data file; not persisted.
    #[serde(skip)]
    pub data_json: String,
    /// Store-relative name of the sibling deps file, if fine-grained caching
    /// is enabled; not persisted.
    #[serde(skip)]
    pub deps_json: Option<String>,
}

/// Serialize a cache payload, pretty-printed when cache debugging is on.
pub(crate) fn json_dumps<T: Serialize>(value: &T, debug_cache: bool) -> serde_json::Result<String> {
    if debug_cache {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
}

/// The versioned root all store-relative names hang off of.
pub fn cache_dir_prefix(options: &Options) -> Option<PathBuf> {
    let dir = options.cache_dir.as_ref()?;
    Some(dir.join(format!("{}.{}", options.version.major, options.version.minor)))
}

/// Return the store-relative file names for a module's cache files: the meta
/// JSON, the data JSON, and the fine-grained deps JSON if enabled.
///
/// Module `a.b` maps to `a/b.meta.json`; a package module (an `__init__`
/// file) maps to `a/b/__init__.meta.json`.
pub fn get_cache_names(id: &str, path: &Path, options: &Options) -> (String, String, Option<String>) {
    let mut prefix = id.split('.').collect::<Vec<_>>().join("/");
    let is_package = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("__init__."));
    if is_package {
        prefix.push_str("/__init__");
    }
    let deps_json = options.cache_fine_grained.then(|| format!("{prefix}.deps.json"));
    (format!("{prefix}.meta.json"), format!("{prefix}.data.json"), deps_json)
}

/// Mediates all cache-file IO.
///
/// Names are relative to the versioned cache root. `write` reports failure
/// through its return value because cache IO is advisory and must never abort
/// a build.
pub trait MetadataStore: fmt::Debug {
    fn getmtime(&self, name: &str) -> Result<i64, IoError>;
    fn read(&self, name: &str) -> Result<String, IoError>;
    /// Returns `false` when the write did not take effect.
    fn write(&mut self, name: &str, data: &str) -> bool;
    fn remove(&mut self, name: &str);
    /// Publish outstanding writes; a no-op for stores that write through.
    fn commit(&mut self);
}

fn file_mtime(path: &Path) -> Result<i64, IoError> {
    let meta = fs::metadata(path).map_err(|err| IoError::new(err, path))?;
    Ok(meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default())
}

fn write_atomic(root: &Path, name: &str, data: &str) -> bool {
    let path = root.join(name);
    if utils::create_parent_dir_all(&path).is_err() {
        return false;
    }
    let tmp = path.with_extension("json.tmp");
    if fs::write(&tmp, data).is_err() {
        return false;
    }
    fs::rename(&tmp, &path).is_ok()
}

/// Plain filesystem backend: every write lands on disk immediately, via a
/// temporary file and an atomic rename.
#[derive(Debug)]
pub struct FilesystemMetadataStore {
    root: PathBuf,
}

impl FilesystemMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MetadataStore for FilesystemMetadataStore {
    fn getmtime(&self, name: &str) -> Result<i64, IoError> {
        file_mtime(&self.root.join(name))
    }

    fn read(&self, name: &str) -> Result<String, IoError> {
        let path = self.root.join(name);
        fs::read_to_string(&path).map_err(|err| IoError::new(err, path))
    }

    fn write(&mut self, name: &str, data: &str) -> bool {
        write_atomic(&self.root, name, data)
    }

    fn remove(&mut self, name: &str) {
        let _ = fs::remove_file(self.root.join(name));
    }

    fn commit(&mut self) {}
}

/// Buffering backend: writes are staged in memory and visible to subsequent
/// reads through this store, then published to disk as one batch at commit
/// time. This is the alternative backend with multi-file commits.
#[derive(Debug)]
pub struct BufferedMetadataStore {
    root: PathBuf,
    staged: HashMap<String, Option<String>>,
    staged_mtimes: HashMap<String, i64>,
}

impl BufferedMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), staged: HashMap::new(), staged_mtimes: HashMap::new() }
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

impl MetadataStore for BufferedMetadataStore {
    fn getmtime(&self, name: &str) -> Result<i64, IoError> {
        match self.staged.get(name) {
            Some(Some(_)) => Ok(self.staged_mtimes[name]),
            Some(None) => Err(IoError::new(
                io::Error::new(io::ErrorKind::NotFound, "removed"),
                self.root.join(name),
            )),
            None => file_mtime(&self.root.join(name)),
        }
    }

    fn read(&self, name: &str) -> Result<String, IoError> {
        match self.staged.get(name) {
            Some(Some(data)) => Ok(data.clone()),
            Some(None) => Err(IoError::new(
                io::Error::new(io::ErrorKind::NotFound, "removed"),
                self.root.join(name),
            )),
            None => {
                let path = self.root.join(name);
                fs::read_to_string(&path).map_err(|err| IoError::new(err, path))
            }
        }
    }

    fn write(&mut self, name: &str, data: &str) -> bool {
        self.staged.insert(name.to_string(), Some(data.to_string()));
        self.staged_mtimes.insert(name.to_string(), Self::now());
        true
    }

    fn remove(&mut self, name: &str) {
        self.staged.insert(name.to_string(), None);
        self.staged_mtimes.remove(name);
    }

    fn commit(&mut self) {
        for (name, data) in std::mem::take(&mut self.staged) {
            match data {
                Some(data) => {
                    if !write_atomic(&self.root, &name, &data) {
                        debug!("failed to publish staged cache file {name}");
                    }
                }
                None => {
                    let _ = fs::remove_file(self.root.join(&name));
                }
            }
        }
        self.staged_mtimes.clear();
    }
}

/// Find and pre-validate cache metadata for a module.
///
/// Returns a record only when its shape, analyzer version, recorded option
/// subset and the plugin snapshot all check out; the per-file checks against
/// the source live in [`validate_meta`].
#[instrument(skip_all, name = "meta-cache::find", fields(id = id))]
pub(crate) fn find_cache_meta<A: Analysis>(
    id: &str,
    path: &Path,
    manager: &mut Manager<A>,
) -> Option<CacheMeta> {
    let (meta_json, data_json, deps_json) = get_cache_names(id, path, &manager.options);
    trace!("looking for {id} at {meta_json}");
    let raw = match manager.metastore.read(&meta_json) {
        Ok(raw) => raw,
        Err(err) => {
            debug!("could not load cache for {id}: {err}");
            return None;
        }
    };
    let mut meta: CacheMeta = match serde_json::from_str(&raw) {
        Ok(meta) => meta,
        Err(err) => {
            debug!("metadata abandoned for {id}: malformed record: {err}");
            return None;
        }
    };
    meta.data_json = data_json;
    meta.deps_json = deps_json;

    if meta.id != id {
        debug!("metadata abandoned for {id}: record names {}", meta.id);
        return None;
    }
    if manager.options.cache_fine_grained && meta.deps_mtime.is_none() {
        debug!("metadata abandoned for {id}: fine-grained attributes are missing");
        return None;
    }
    // Ignore cache generated by a different analyzer version.
    if meta.version_id != manager.version_id && !manager.options.skip_version_check {
        debug!(
            "metadata abandoned for {id}: version {} != {}",
            meta.version_id, manager.version_id
        );
        return None;
    }
    let n_deps = meta.dependencies.len() + meta.suppressed.len();
    if n_deps != meta.dep_prios.len() || n_deps != meta.dep_lines.len() {
        debug!("metadata abandoned for {id}: dependency arrays are misaligned");
        return None;
    }

    // Ignore cache if the relevant options aren't the same. The recorded set
    // may be mutilated freely, it is only used here.
    let mut cached_options = meta.options.clone();
    let current_options =
        serde_json::to_value(manager.options.clone_for_module(id).cache_options())
            .expect("options serialize");
    if let Some(recorded) = cached_options.as_object_mut() {
        if manager.options.mixed_freshness {
            // In mixed-freshness mode also accept records from strict runs.
            recorded.insert("mixed_freshness".to_string(), true.into());
        }
        if manager.options.skip_version_check {
            // When lax about the version, also be lax about the platform.
            recorded.insert(
                "platform".to_string(),
                current_options.get("platform").cloned().unwrap_or_default(),
            );
        }
        recorded.remove("debug_cache");
    }
    if cached_options != current_options {
        debug!("metadata abandoned for {id}: options differ");
        return None;
    }

    if let Some(old) = &manager.old_plugins_snapshot {
        if !old.is_empty()
            && !manager.plugins_snapshot.is_empty()
            && *old != manager.plugins_snapshot
        {
            debug!("metadata abandoned for {id}: plugins differ");
            return None;
        }
    }

    manager.add_stats("fresh_metas", 1);
    Some(meta)
}

/// Check whether the cached artifact of a module may be used.
///
/// Returns `None` if the record is unusable, the original record if mtime and
/// size matched, or a record with refreshed mtime/path if the content digest
/// matched even though file identity shifted (the refreshed record is also
/// persisted, unless `temporary` forbids side effects).
pub(crate) fn validate_meta<A: Analysis>(
    meta: Option<CacheMeta>,
    id: &str,
    path: Option<&Path>,
    ignore_all: bool,
    manager: &mut Manager<A>,
    temporary: bool,
) -> Option<CacheMeta> {
    // Two steps: check that the module source is the same as when the record
    // was written, and check that the data file itself was not touched since
    // -- its mtime is what propagates change information to dependents.
    let Some(mut meta) = meta else {
        debug!("metadata not found for {id}");
        return None;
    };

    if meta.ignore_all && !ignore_all {
        debug!("metadata abandoned for {id}: errors were previously ignored");
        return None;
    }

    let bazel = manager.options.bazel;
    let path = path.expect("metadata without a source path");

    let data_mtime = match manager.getmtime(&meta.data_json) {
        Ok(mtime) => mtime,
        Err(_) => {
            debug!("metadata abandoned for {id}: data cache is missing");
            return None;
        }
    };
    if data_mtime != meta.data_mtime {
        debug!("metadata abandoned for {id}: data cache is modified");
        return None;
    }
    let mut deps_mtime = None;
    if manager.options.cache_fine_grained {
        let deps_json = meta.deps_json.clone().expect("fine-grained record without deps file");
        match manager.getmtime(&deps_json) {
            Ok(mtime) if Some(mtime) == meta.deps_mtime => deps_mtime = Some(mtime),
            _ => {
                debug!("metadata abandoned for {id}: deps cache is modified");
                return None;
            }
        }
    }

    let norm_path = manager.normpath(path);
    let st = match manager.fscache.stat(&norm_path) {
        Ok(st) => st,
        Err(_) => return None,
    };
    if !st.is_file {
        debug!("metadata abandoned for {id}: file {} does not exist", norm_path.display());
        return None;
    }

    // With a fine-grained cache the initial load accepts stale records so
    // that the later fine-grained update can catch up; the digest check still
    // runs to enable the mtime-refresh optimization.
    let fine_grained_cache = manager.use_fine_grained_cache();

    if st.size != meta.size && !bazel && !fine_grained_cache {
        debug!("metadata abandoned for {id}: file {} has different size", norm_path.display());
        return None;
    }

    let mtime = if bazel { 0 } else { st.mtime };
    let recorded_path = utils::record_path(&norm_path);
    if !bazel && (mtime != meta.mtime || recorded_path != meta.path) {
        let source_hash = match manager.fscache.md5(&norm_path) {
            Ok(hash) => hash,
            Err(_) => return None,
        };
        if source_hash != meta.hash {
            if fine_grained_cache {
                debug!("using stale metadata for {id}: file {}", norm_path.display());
                return Some(meta);
            }
            debug!(
                "metadata abandoned for {id}: file {} has different hash",
                norm_path.display()
            );
            return None;
        }
        // Same content under a new identity: refresh mtime and path so the
        // mismatch doesn't reappear on the next run.
        meta.mtime = mtime;
        meta.size = st.size;
        meta.path = recorded_path;
        meta.data_mtime = data_mtime;
        meta.deps_mtime = deps_mtime.or(meta.deps_mtime);
        meta.options = serde_json::to_value(manager.options.clone_for_module(id).cache_options())
            .expect("options serialize");
        meta.version_id = manager.version_id.clone();
        if !temporary {
            let (meta_json, _, _) = get_cache_names(id, path, &manager.options);
            debug!("updating mtime for {id}: meta {meta_json} mtime {mtime}");
            if let Ok(meta_str) = json_dumps(&meta, manager.options.debug_cache) {
                // Failures are fine, the refresh is just an optimization.
                manager.metastore.write(&meta_json, &meta_str);
            }
        }
        return Some(meta);
    }

    // It's a match on (id, path, size, hash, mtime).
    debug!("metadata fresh for {id}: file {}", norm_path.display());
    Some(meta)
}

/// Write the cache files for a module after a successful analysis.
///
/// Returns the new interface hash and, if the record could be written, the
/// record itself. When the interface hash is unchanged from the previous
/// record the data file is left alone and only the metadata is rewritten.
/// Every failure path is advisory: the next run simply finds the entry out of
/// date.
#[instrument(skip_all, name = "meta-cache::write", fields(id = id))]
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_cache<A: Analysis>(
    id: &str,
    path: &Path,
    fine_grained_deps: &BTreeMap<String, BTreeSet<String>>,
    dependencies: &[String],
    suppressed: &[String],
    child_modules: &[String],
    dep_prios: &[u8],
    dep_lines: &[u64],
    old_interface_hash: &str,
    source_hash: &str,
    ignore_all: bool,
    manager: &mut Manager<A>,
) -> (String, Option<CacheMeta>) {
    let norm_path = manager.normpath(path);
    let (meta_json, data_json, deps_json) = get_cache_names(id, path, &manager.options);
    debug!("writing {id} {} {meta_json} {data_json}", norm_path.display());

    let tree = manager.modules.get(id).expect("tree must be loaded before writing cache");
    let data_str = match json_dumps(tree, manager.options.debug_cache) {
        Ok(data) => data,
        Err(err) => {
            debug!("error serializing data for {id}: {err}");
            return (old_interface_hash.to_string(), None);
        }
    };
    let interface_hash = utils::compute_hash(&data_str);

    let st = match manager.fscache.stat(&norm_path) {
        Ok(st) => st,
        Err(err) => {
            debug!("cannot stat {}: {err}", norm_path.display());
            // Remove apparently-invalid cache files; purely an optimization.
            manager.metastore.remove(&data_json);
            manager.metastore.remove(&meta_json);
            return (interface_hash, None);
        }
    };

    let data_mtime = if old_interface_hash == interface_hash {
        // Unchanged interface means the cached data is guaranteed equivalent;
        // only the metadata needs a refresh.
        trace!("interface for {id} is unchanged");
        match manager.getmtime(&data_json) {
            Ok(mtime) => mtime,
            Err(_) => return (interface_hash, None),
        }
    } else {
        trace!("interface for {id} has changed");
        if !manager.metastore.write(&data_json, &data_str) {
            debug!("error writing data JSON file {data_json}");
            return (interface_hash, None);
        }
        match manager.getmtime(&data_json) {
            Ok(mtime) => mtime,
            Err(_) => return (interface_hash, None),
        }
    };

    let mut deps_mtime = None;
    if let Some(deps_name) = &deps_json {
        let listed: BTreeMap<&String, Vec<&String>> =
            fine_grained_deps.iter().map(|(k, v)| (k, v.iter().collect())).collect();
        let deps_str = match json_dumps(&listed, manager.options.debug_cache) {
            Ok(data) => data,
            Err(_) => return (interface_hash, None),
        };
        if !manager.metastore.write(deps_name, &deps_str) {
            debug!("error writing deps JSON file {deps_name}");
            return (interface_hash, None);
        }
        deps_mtime = match manager.getmtime(deps_name) {
            Ok(mtime) => Some(mtime),
            Err(_) => return (interface_hash, None),
        };
    }

    let mtime = if manager.options.bazel { 0 } else { st.mtime };
    let meta = CacheMeta {
        id: id.to_string(),
        path: utils::record_path(&norm_path),
        mtime,
        size: st.size,
        hash: source_hash.to_string(),
        data_mtime,
        deps_mtime,
        dependencies: dependencies.to_vec(),
        suppressed: suppressed.to_vec(),
        child_modules: child_modules.to_vec(),
        options: serde_json::to_value(manager.options.clone_for_module(id).cache_options())
            .expect("options serialize"),
        dep_prios: dep_prios.to_vec(),
        dep_lines: dep_lines.to_vec(),
        interface_hash: interface_hash.clone(),
        version_id: manager.version_id.clone(),
        ignore_all,
        data_json,
        deps_json,
    };

    match json_dumps(&meta, manager.options.debug_cache) {
        Ok(meta_str) => {
            if !manager.metastore.write(&meta_json, &meta_str) {
                // The next run will simply find the entry out of date.
                debug!("error writing meta JSON file {meta_json}");
            }
        }
        Err(err) => debug!("error serializing meta for {id}: {err}"),
    }

    (interface_hash, Some(meta))
}

/// Delete the cache files for a module.
///
/// Done when a module's analysis produced errors, avoiding inconsistent
/// states between runs.
pub(crate) fn delete_cache<A: Analysis>(id: &str, path: &Path, manager: &mut Manager<A>) {
    let (meta_json, data_json, deps_json) = get_cache_names(id, path, &manager.options);
    debug!("deleting cache for {id} {meta_json} {data_json}");
    manager.metastore.remove(&data_json);
    manager.metastore.remove(&meta_json);
    if let Some(deps_json) = deps_json {
        manager.metastore.remove(&deps_json);
    }
}

/// Read the plugin snapshot left behind by the previous run.
pub(crate) fn read_plugins_snapshot(
    store: &dyn MetadataStore,
) -> Option<BTreeMap<String, String>> {
    let raw = match store.read(PLUGIN_SNAPSHOT_FILE) {
        Ok(raw) => raw,
        Err(err) => {
            debug!("could not load plugins snapshot: {err}");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            debug!("could not load plugins snapshot: {err}");
            None
        }
    }
}

/// Write the snapshot of versions and hashes of currently active plugins.
pub(crate) fn write_plugins_snapshot<A: Analysis>(manager: &mut Manager<A>) {
    let data = serde_json::to_string(&manager.plugins_snapshot).expect("snapshot serializes");
    if !manager.metastore.write(PLUGIN_SNAPSHOT_FILE, &data) {
        let prefix = cache_dir_prefix(&manager.options).unwrap_or_default();
        manager.reporter.set_file(prefix.display().to_string(), None);
        manager.reporter.report(
            0,
            "Error writing plugins snapshot",
            crate::report::Severity::Error,
            true,
            false,
        );
    }
}

/// Write the protocol-dependency cache: a snapshot of all current source
/// hashes (to later check consistency against the per-module records) plus
/// the dependency map itself.
pub(crate) fn write_protocol_deps_cache<A: Analysis>(
    proto_deps: &BTreeMap<String, BTreeSet<String>>,
    manager: &mut Manager<A>,
    graph: &Graph,
) {
    let (proto_meta, proto_cache) = proto_deps_cache_names();
    let mut meta_snapshot = BTreeMap::new();
    for (id, state) in graph {
        // A module without a parsed source must have come from a fresh cache
        // record, so use the hash recorded there.
        let hash = state
            .source_hash
            .clone()
            .or_else(|| state.meta_source_hash.clone())
            .expect("module must be either parsed or cached");
        meta_snapshot.insert(id.clone(), hash);
    }

    let mut error = false;
    let meta_str = serde_json::to_string(&meta_snapshot).expect("snapshot serializes");
    if !manager.metastore.write(&proto_meta, &meta_str) {
        debug!("error writing protocol meta JSON file {proto_meta}");
        error = true;
    }
    let deps_str = serde_json::to_string(proto_deps).expect("deps serialize");
    if !manager.metastore.write(&proto_cache, &deps_str) {
        debug!("error writing protocol deps JSON file {proto_cache}");
        error = true;
    }
    if error {
        let prefix = cache_dir_prefix(&manager.options).unwrap_or_default();
        manager.reporter.set_file(prefix.display().to_string(), None);
        manager.reporter.report(
            0,
            "Error writing protocol dependencies cache",
            crate::report::Severity::Error,
            true,
            false,
        );
    }
}

/// Read and validate the protocol-dependency cache against the per-module
/// records loaded into `graph`.
pub(crate) fn read_protocol_cache<A: Analysis>(
    manager: &mut Manager<A>,
    graph: &Graph,
) -> Option<BTreeMap<String, BTreeSet<String>>> {
    let (proto_meta, proto_cache) = proto_deps_cache_names();
    let meta_snapshot: BTreeMap<String, String> =
        serde_json::from_str(&manager.metastore.read(&proto_meta).ok()?).ok()?;

    // Compare against the hashes from all records we found, including the
    // ones rejected for being out of date.
    let current: BTreeMap<&String, &String> = graph
        .iter()
        .filter_map(|(id, state)| state.meta_source_hash.as_ref().map(|hash| (id, hash)))
        .collect();
    let consistent = meta_snapshot
        .iter()
        .filter(|(id, _)| current.contains_key(id))
        .all(|(id, hash)| current[id] == hash);
    if !consistent {
        debug!("protocol cache inconsistent, ignoring");
        return None;
    }

    serde_json::from_str(&manager.metastore.read(&proto_cache).ok()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_meta() -> CacheMeta {
        CacheMeta {
            id: "pkg.mod".to_string(),
            path: "src/pkg/mod.py".to_string(),
            mtime: 1_600_000_000,
            size: 42,
            hash: "abc".to_string(),
            data_mtime: 1_600_000_001,
            deps_mtime: None,
            dependencies: vec!["builtins".to_string()],
            suppressed: vec!["missing".to_string()],
            child_modules: vec![],
            options: serde_json::json!({"platform": "linux"}),
            dep_prios: vec![10, 10],
            dep_lines: vec![1, 2],
            interface_hash: "beef".to_string(),
            version_id: "0.1.0".to_string(),
            ignore_all: false,
            data_json: String::new(),
            deps_json: None,
        }
    }

    #[test]
    fn meta_codec_round_trips() {
        let meta = sample_meta();
        let encoded = json_dumps(&meta, false).unwrap();
        let decoded: CacheMeta = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn malformed_meta_is_rejected_by_the_codec() {
        // `mtime` missing entirely.
        let raw = r#"{"id": "m", "path": "m.py", "size": 1, "hash": "x",
                      "data_mtime": 0, "options": {}, "version_id": "0.1.0"}"#;
        assert!(serde_json::from_str::<CacheMeta>(raw).is_err());
    }

    #[test]
    fn cache_names_for_plain_and_package_modules() {
        let options = Options::default();
        let (meta, data, deps) = get_cache_names("a.b", Path::new("src/a/b.py"), &options);
        assert_eq!(meta, "a/b.meta.json");
        assert_eq!(data, "a/b.data.json");
        assert_eq!(deps, None);

        let (meta, data, _) = get_cache_names("a.b", Path::new("src/a/b/__init__.py"), &options);
        assert_eq!(meta, "a/b/__init__.meta.json");
        assert_eq!(data, "a/b/__init__.data.json");

        let mut fine = Options::default();
        fine.cache_fine_grained = true;
        let (_, _, deps) = get_cache_names("a", Path::new("a.py"), &fine);
        assert_eq!(deps, Some("a.deps.json".to_string()));
    }

    #[test]
    fn filesystem_store_round_trips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FilesystemMetadataStore::new(dir.path());

        assert!(store.write("a/b.meta.json", "{}"));
        assert_eq!(store.read("a/b.meta.json").unwrap(), "{}");
        assert!(store.getmtime("a/b.meta.json").is_ok());

        store.remove("a/b.meta.json");
        assert!(store.read("a/b.meta.json").is_err());
    }

    #[test]
    fn buffered_store_publishes_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BufferedMetadataStore::new(dir.path());

        assert!(store.write("m.meta.json", "{\"id\": 1}"));
        // Visible through the store, not yet on disk.
        assert_eq!(store.read("m.meta.json").unwrap(), "{\"id\": 1}");
        assert!(!dir.path().join("m.meta.json").exists());

        store.commit();
        assert!(dir.path().join("m.meta.json").exists());

        let fresh = BufferedMetadataStore::new(dir.path());
        assert_eq!(fresh.read("m.meta.json").unwrap(), "{\"id\": 1}");
    }
}
