//! End-to-end build orchestration tests against temporary projects.

use pretty_assertions::assert_eq;
use sift_build::{
    cache::CacheMeta,
    project_util::TempProject,
    utils, BuildSource, FollowImports, ModuleOverrides,
};
use std::{collections::HashSet, fs, path::PathBuf, time::SystemTime};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn sources(project: &TempProject, modules: &[&str]) -> Vec<BuildSource> {
    modules
        .iter()
        .map(|module| {
            let rel = format!("{}.py", module.replace('.', "/"));
            BuildSource::from_path(*module, project.root().join(rel))
        })
        .collect()
}

fn read_meta(project: &TempProject, name: &str) -> CacheMeta {
    let cache_root = project.cache_dir().join("0.1");
    utils::read_json_file(&cache_root.join(name)).expect("meta file exists and parses")
}

fn record_mtimes(project: &TempProject) -> Vec<(PathBuf, SystemTime)> {
    let cache_root = project.cache_dir();
    project
        .cache_files()
        .into_iter()
        .filter(|file| {
            let name = file.to_string_lossy();
            name.ends_with(".meta.json") || name.ends_with(".data.json")
        })
        .map(|file| {
            let mtime = fs::metadata(cache_root.join(&file)).unwrap().modified().unwrap();
            (file, mtime)
        })
        .collect()
}

#[test]
fn cold_build_of_a_linear_chain() {
    init_tracing();
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\nx = 1\n");
    project.add_source("b.py", "y = 2\n");

    let result = project.build(sources(&project, &["a"])).unwrap();

    assert!(result.errors.is_empty(), "unexpected diagnostics: {:?}", result.errors);
    let ids: HashSet<&str> = result.graph.keys().map(String::as_str).collect();
    assert_eq!(ids, HashSet::from(["a", "b", "builtins"]));

    // Both leaves of the chain went through the stale pipeline, b first.
    let log = project.log_entries();
    let pos = |entry: &str| log.iter().position(|x| x == entry).unwrap_or(usize::MAX);
    assert!(pos("check1:b") < pos("check1:a"), "log: {log:?}");
    assert!(pos("parse:b") < pos("check1:b"), "log: {log:?}");

    // Metadata and data files were written for every module.
    let files = project.cache_files();
    let names: Vec<String> = files.iter().map(|f| f.to_string_lossy().into_owned()).collect();
    for expected in
        ["a.meta.json", "a.data.json", "b.meta.json", "b.data.json", "builtins.meta.json"]
    {
        assert!(names.iter().any(|name| name.ends_with(expected)), "missing {expected}: {names:?}");
    }

    // Everything was analyzed for the first time, so every interface is new.
    assert!(result.stale_modules.contains("a"));
    assert!(result.stale_modules.contains("b"));
    assert_eq!(result.graph["a"].dependencies, vec!["b".to_string(), "builtins".to_string()]);

    // Graph invariants: dependencies and ancestors resolve within the graph,
    // suppressed modules do not.
    for state in result.graph.values() {
        for dep in state.dependencies.iter().chain(state.ancestors.iter()) {
            assert!(result.graph.contains_key(dep), "{} dangles", dep);
        }
        for dep in &state.suppressed {
            assert!(!result.graph.contains_key(dep), "{} suppressed but loaded", dep);
        }
    }
}

#[test]
fn warm_build_reuses_everything_without_touching_the_cache() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\nx = 1\n");
    project.add_source("b.py", "y = 2\n");

    project.build(sources(&project, &["a"])).unwrap();
    let before = record_mtimes(&project);
    project.clear_log();

    let result = project.build(sources(&project, &["a"])).unwrap();

    // Every SCC was classified fresh: no parsing, no re-checking, and the
    // fresh queue was never drained, so no trees were materialized either.
    assert!(result.errors.is_empty());
    assert!(result.stale_modules.is_empty());
    assert!(result.rechecked_modules.is_empty());
    assert!(result.modules.is_empty(), "fresh queue should stay unloaded");
    assert!(project.log_entries().iter().all(|entry| !entry.starts_with("parse:")));
    assert!(result.graph["a"].meta.is_some());
    assert!(result.graph["b"].meta.is_some());

    // Cache round-trip: immediate revalidation accepts the records as-is.
    assert_eq!(record_mtimes(&project), before);
}

#[test]
fn changed_leaf_invalidates_its_importers() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\nx = 1\n");
    project.add_source("b.py", "y = 2\n");
    project.build(sources(&project, &["a"])).unwrap();
    let b_hash_before = read_meta(&project, "b.meta.json").interface_hash;

    // A real edit: different content, different size, new interface.
    project.add_source("b.py", "y = 3000\n");
    project.clear_log();
    let result = project.build(sources(&project, &["a"])).unwrap();

    assert!(result.errors.is_empty());
    // b was re-analyzed with a new interface; a was dragged along because
    // its dependency's interface went stale, but its own interface survived.
    assert_eq!(result.stale_modules, HashSet::from(["b".to_string()]));
    assert!(result.rechecked_modules.contains("a"));
    assert!(result.rechecked_modules.contains("b"));

    let log = project.log_entries();
    assert!(log.contains(&"parse:b".to_string()), "log: {log:?}");
    assert!(log.contains(&"parse:a".to_string()), "log: {log:?}");

    let b_hash_after = read_meta(&project, "b.meta.json").interface_hash;
    assert_ne!(b_hash_before, b_hash_after);
}

#[test]
fn unchanged_content_under_new_mtime_only_refreshes_metadata() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\nx = 1\n");
    project.add_source("b.py", "y = 2\n");
    project.build(sources(&project, &["a"])).unwrap();
    let meta_before = read_meta(&project, "b.meta.json");

    // Rewrite the identical bytes after the mtime granularity has passed.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    project.add_source("b.py", "y = 2\n");
    project.clear_log();
    let result = project.build(sources(&project, &["a"])).unwrap();

    // The digest matched, so the record was refreshed in place of a rebuild.
    assert!(result.stale_modules.is_empty());
    assert!(project.log_entries().iter().all(|entry| !entry.starts_with("parse:")));
    let meta_after = read_meta(&project, "b.meta.json");
    assert_eq!(meta_before.hash, meta_after.hash);
    assert_eq!(meta_before.interface_hash, meta_after.interface_hash);
    assert!(meta_after.mtime > meta_before.mtime, "mtime should have been refreshed");
}

#[test]
fn cycle_with_mixed_priorities_orders_the_function_level_importer_first() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\n");
    project.add_source("b.py", "def f():\n    import a\n");

    let result = project.build(sources(&project, &["a", "b"])).unwrap();
    assert!(result.errors.is_empty());

    // One SCC {a, b}; dropping the low-priority b -> a arc leaves a -> b, so
    // b is processed before a in every phase.
    let log = project.log_entries();
    let pos = |entry: &str| log.iter().position(|x| x == entry).unwrap_or(usize::MAX);
    assert!(pos("sem2:b") < pos("sem2:a"), "log: {log:?}");
    assert!(pos("check1:b") < pos("check1:a"), "log: {log:?}");
    // Phase barrier: all of pass two finishes before pass three starts.
    assert!(pos("sem2:a") < pos("sem3:b"), "log: {log:?}");
}

#[test]
fn missing_dependency_is_suppressed_and_recorded() {
    let mut project = TempProject::new().unwrap();
    project.options.ignore_missing_imports = true;
    project.add_source("a.py", "import nonexistent\nx = 1\n");

    let result = project.build(sources(&project, &["a"])).unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.graph["a"].suppressed, vec!["nonexistent".to_string()]);
    assert!(result.missing_modules.contains("nonexistent"));
    assert!(!result.graph.contains_key("nonexistent"));

    // The suppression lands in the metadata record, with the dependency
    // arrays still parallel.
    let meta = read_meta(&project, "a.meta.json");
    assert_eq!(meta.suppressed, vec!["nonexistent".to_string()]);
    assert_eq!(meta.dep_prios.len(), meta.dependencies.len() + meta.suppressed.len());
    assert_eq!(meta.dep_lines.len(), meta.dep_prios.len());

    // And a warm build stays fresh: the suppression is part of the record.
    project.clear_log();
    let warm = project.build(sources(&project, &["a"])).unwrap();
    assert!(warm.stale_modules.is_empty());
    assert!(project.log_entries().iter().all(|entry| !entry.starts_with("parse:")));
}

#[test]
fn plugin_snapshot_change_invalidates_every_record() {
    let mut project = TempProject::new().unwrap();
    project.plugins.insert("acme_hooks".to_string(), "1.0:1111".to_string());
    project.add_source("a.py", "import b\n");
    project.add_source("b.py", "y = 2\n");

    project.build(sources(&project, &["a"])).unwrap();
    project.clear_log();
    let warm = project.build(sources(&project, &["a"])).unwrap();
    assert!(warm.stale_modules.is_empty());

    // Same plugin, new content hash: every validation attempt must reject.
    project.plugins.insert("acme_hooks".to_string(), "1.0:2222".to_string());
    project.clear_log();
    let rebuilt = project.build(sources(&project, &["a"])).unwrap();

    let log = project.log_entries();
    assert!(log.contains(&"parse:a".to_string()), "log: {log:?}");
    assert!(log.contains(&"parse:b".to_string()), "log: {log:?}");
    assert!(rebuilt.rechecked_modules.contains("a"));

    // The new snapshot replaced the old one at the cache root.
    let cache_root = project.cache_dir().join("0.1");
    let snapshot = fs::read_to_string(cache_root.join("@plugins_snapshot.json")).unwrap();
    assert!(snapshot.contains("1.0:2222"), "snapshot: {snapshot}");
}

#[test]
fn interface_hashes_are_deterministic_across_checkouts() {
    let make = || {
        let project = TempProject::new().unwrap();
        project.add_source("a.py", "import b\nx = 1\n");
        project.add_source("b.py", "def helper(): ...\n");
        let result = project.build(sources(&project, &["a"])).unwrap();
        (
            result.graph["a"].interface_hash.clone(),
            result.graph["b"].interface_hash.clone(),
        )
    };
    // Two independent projects with byte-identical sources, including
    // distinct absolute paths, produce identical interfaces.
    assert_eq!(make(), make());
}

#[test]
fn type_errors_block_cache_writes_transitively() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\n");
    project.add_source("b.py", "y = None + 1\n");

    let result = project.build(sources(&project, &["a"])).unwrap();

    assert_eq!(result.errors.len(), 1, "errors: {:?}", result.errors);
    assert!(result.errors[0].contains("b.py:1"));
    assert!(result.errors[0].contains("Unsupported operand types"));

    assert!(result.graph["b"].transitive_error);
    assert!(result.graph["a"].transitive_error, "errors propagate through the SCC ordering");

    // Neither module's cache may be written.
    let names: Vec<String> =
        project.cache_files().iter().map(|f| f.to_string_lossy().into_owned()).collect();
    assert!(!names.iter().any(|name| name.ends_with("b.meta.json")), "cache: {names:?}");
    assert!(!names.iter().any(|name| name.ends_with("a.meta.json")), "cache: {names:?}");

    // The next run re-analyzes both.
    project.clear_log();
    project.build(sources(&project, &["a"])).unwrap();
    let log = project.log_entries();
    assert!(log.contains(&"parse:a".to_string()));
    assert!(log.contains(&"parse:b".to_string()));
}

#[test]
fn ignore_comment_suppresses_the_error_and_allows_caching() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "y = None + 1  # type: ignore\n");

    let result = project.build(sources(&project, &["a"])).unwrap();
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert!(!result.graph["a"].transitive_error);

    let names: Vec<String> =
        project.cache_files().iter().map(|f| f.to_string_lossy().into_owned()).collect();
    assert!(names.iter().any(|name| name.ends_with("a.meta.json")));
}

#[test]
fn unused_ignore_comments_are_flagged_when_requested() {
    let mut project = TempProject::new().unwrap();
    project.options.warn_unused_ignores = true;
    project.add_source("a.py", "x = 1  # type: ignore\n");

    let result = project.build(sources(&project, &["a"])).unwrap();
    assert_eq!(result.errors.len(), 1, "errors: {:?}", result.errors);
    assert!(result.errors[0].contains("unused ignore comment"));
}

#[test]
fn duplicate_roots_are_a_blocking_error() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "x = 1\n");

    let err = project
        .build(vec![
            BuildSource::from_path("a", project.root().join("a.py")),
            BuildSource::from_path("a", project.root().join("a.py")),
        ])
        .unwrap_err();
    assert!(
        err.messages.iter().any(|m| m.contains("Duplicate module named 'a'")),
        "messages: {:?}",
        err.messages
    );
}

#[test]
fn missing_root_source_is_fatal() {
    let project = TempProject::new().unwrap();
    let err = project.build(vec![BuildSource::from_module("does_not_exist")]).unwrap_err();
    assert!(
        err.messages.iter().any(|m| m.contains("can't find module 'does_not_exist'")),
        "messages: {:?}",
        err.messages
    );
}

#[test]
fn syntax_errors_abort_the_build() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", ")\n");
    let err = project.build(sources(&project, &["a"])).unwrap_err();
    assert!(
        err.messages.iter().any(|m| m.contains("invalid syntax")),
        "messages: {:?}",
        err.messages
    );
}

#[test]
fn relative_imports_resolve_and_register_children() {
    let project = TempProject::new().unwrap();
    project.add_source("pkg/__init__.py", "");
    project.add_source("pkg/util.py", "z = 1\n");
    project.add_source("pkg/mod.py", "from . import util\n");

    let result = project
        .build(vec![BuildSource::from_path("pkg.mod", project.root().join("pkg/mod.py"))])
        .unwrap();

    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert!(result.graph.contains_key("pkg.util"));
    assert!(result.graph["pkg"].child_modules.contains("pkg.mod"));
    assert_eq!(result.graph["pkg.mod"].ancestors, vec!["pkg".to_string()]);
}

#[test]
fn partial_stub_packages_silence_missing_submodules()  {
    let project = TempProject::new().unwrap();
    project.add_source("pkg/__init__.pyi", "def __getattr__(name): ...\n");
    project.add_source("a.py", "import pkg.missing\n");

    let result = project.build(sources(&project, &["a"])).unwrap();

    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert!(result.graph["a"].suppressed.contains(&"pkg.missing".to_string()));
}

#[test]
fn follow_imports_error_skips_and_reports() {
    let mut project = TempProject::new().unwrap();
    project.options.per_module.push((
        "lib".to_string(),
        ModuleOverrides { follow_imports: Some(FollowImports::Error), ..Default::default() },
    ));
    project.add_source("lib.py", "x = 1\n");
    project.add_source("a.py", "import lib\n");

    let result = project.build(sources(&project, &["a"])).unwrap();

    assert!(result.graph["a"].suppressed.contains(&"lib".to_string()));
    assert!(!result.graph.contains_key("lib"));
    assert!(
        result.errors.iter().any(|m| m.contains("Import of 'lib' ignored")),
        "errors: {:?}",
        result.errors
    );
}

#[test]
fn silenced_modules_swallow_their_diagnostics() {
    let mut project = TempProject::new().unwrap();
    project.silence("vendored.*");
    project.add_source("vendored/__init__.py", "");
    project.add_source("vendored/bad.py", "y = None + 1\n");
    project.add_source("a.py", "import vendored.bad\n");

    let result = project.build(sources(&project, &["a"])).unwrap();
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert!(result.graph["vendored.bad"].ignore_all);
}

#[test]
fn second_pass_iterates_the_whole_component_to_a_fixpoint() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\n");
    project.add_source("b.py", "def f():\n    import a\n");

    let frontend = project.frontend().with_second_pass_rounds("a", 2);
    project.build_with(sources(&project, &["a", "b"]), frontend).unwrap();

    // Rounds run across the whole SCC until nothing requests more work:
    // round 1 (a requests more), round 2 (a again), round 3 (quiescent).
    let log = project.log_entries();
    let count =
        |entry: &str| log.iter().filter(|x| x.as_str() == entry).count();
    assert_eq!(count("check2:a"), 3, "log: {log:?}");
    assert_eq!(count("check2:b"), 3, "log: {log:?}");
}

#[test]
fn indirect_references_become_low_priority_dependencies() {
    let project = TempProject::new().unwrap();
    project.add_source("a.py", "import b\n");
    project.add_source("b.py", "y = 2\n");
    project.add_source("c.py", "z = 3\n");

    // The checker claims to have encountered c while checking a, even though
    // a never imports it.
    let frontend = project.frontend().with_indirect_refs("a", &["c"]);
    project.build_with(sources(&project, &["a", "c"]), frontend).unwrap();

    let meta = read_meta(&project, "a.meta.json");
    assert!(meta.dependencies.contains(&"c".to_string()), "meta: {meta:?}");
    let pos = meta.dependencies.iter().position(|d| d == "c").unwrap();
    assert_eq!(meta.dep_prios[pos], 30, "indirect deps carry the synthetic priority");
}

#[test]
fn buffered_cache_publishes_at_the_end_of_the_build() {
    let mut project = TempProject::new().unwrap();
    project.options.buffered_cache = true;
    project.add_source("a.py", "x = 1\n");

    project.build(sources(&project, &["a"])).unwrap();
    let names: Vec<String> =
        project.cache_files().iter().map(|f| f.to_string_lossy().into_owned()).collect();
    assert!(names.iter().any(|name| name.ends_with("a.meta.json")), "cache: {names:?}");

    // And the published batch validates on the next run.
    project.clear_log();
    let warm = project.build(sources(&project, &["a"])).unwrap();
    assert!(warm.stale_modules.is_empty());
    assert!(project.log_entries().iter().all(|entry| !entry.starts_with("parse:")));
}

#[test]
fn fine_grained_caching_writes_deps_and_protocol_files() {
    let mut project = TempProject::new().unwrap();
    project.options.cache_fine_grained = true;
    project.add_source("a.py", "import b\n");
    project.add_source("b.py", "y = 2\n");

    project.build(sources(&project, &["a"])).unwrap();

    let names: Vec<String> =
        project.cache_files().iter().map(|f| f.to_string_lossy().into_owned()).collect();
    assert!(names.iter().any(|name| name.ends_with("a.deps.json")), "cache: {names:?}");
    assert!(names.iter().any(|name| name.ends_with("@proto_deps.data.json")), "cache: {names:?}");
    assert!(names.iter().any(|name| name.ends_with("@proto_deps.meta.json")), "cache: {names:?}");

    // A warm fine-grained load pulls everything from cache, deps included.
    project.options.use_fine_grained_cache = true;
    project.clear_log();
    let warm = project.build(sources(&project, &["a"])).unwrap();
    assert!(project.log_entries().iter().all(|entry| !entry.starts_with("parse:")));
    assert!(warm.graph["a"].fine_grained_deps.contains_key("b"));
}
