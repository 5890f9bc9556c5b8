//! Drives the analysis of a loaded module graph.
//!
//! Processing happens per strongly connected component, in topological order
//! from leaves to roots. Because components are visited in that order, the
//! immediate dependencies are sufficient for staleness decisions; nothing
//! needs to look at dependencies recursively.
//!
//! Fresh components are queued and only materialized (in bulk) once a stale
//! component actually needs its dependencies loaded. A fully warm build may
//! therefore finish with the queue undrained, leaving those trees unloaded;
//! that is intentional and only observable as an emptier module map.
//!
//! Within one stale component every phase runs to completion for all nodes
//! before the next phase begins: parse, semantic analysis passes, patch
//! application, and the two type-checking passes, the second iterated to a
//! fixpoint across the whole component.

use crate::{
    analysis::{Analysis, PRI_ALL},
    cache,
    error::CompileError,
    graph::{sorted_components, sorted_components_all},
    resolver::load_graph,
    state::Graph,
    BuildSource, Manager,
};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Load the graph for the given sources and process it.
///
/// This is the whole build after manager construction: graph load (with the
/// fine-grained fallbacks), protocol-cache validation, SCC scheduling, and
/// the plugin-snapshot rewrite.
#[instrument(skip_all, name = "dispatch")]
pub(crate) fn dispatch<A: Analysis>(
    sources: &[BuildSource],
    manager: &mut Manager<A>,
) -> Result<Graph, CompileError> {
    debug!("sift version {}", manager.version_id);
    let mut graph = load_graph(sources, manager, None)?;

    // If less than half of the requested sources loaded from a fine-grained
    // cache, the cache is more of a liability than a help: turn it off
    // entirely and load the graph honestly, so we never end up with some
    // modules loaded and some from cache.
    if manager.use_fine_grained_cache() && graph.len() * 2 < sources.len() {
        debug!("redoing load_graph without cache because too much was missing");
        manager.cache_enabled = false;
        graph = load_graph(sources, manager, None)?;
    }

    if graph.is_empty() {
        debug!("nothing to do");
        return Ok(graph);
    }
    debug!("loaded graph with {} nodes", graph.len());

    // Protocol dependencies are serialized per build, so they are read after
    // the whole graph (and all per-module records) have been loaded.
    if (manager.options.cache_fine_grained || manager.use_fine_grained_cache())
        && manager.options.cache_dir.is_some()
    {
        match cache::read_protocol_cache(manager, &graph) {
            Some(proto_deps) => manager.proto_deps = Some(proto_deps),
            None if manager.stats.get("fresh_metas").copied().unwrap_or(0) > 0 => {
                // Some records were read but the protocol cache is unusable:
                // the caches are inconsistent with each other, so fall back
                // to a full run. Clear the stats first so this cannot loop.
                manager.stats.clear();
                debug!("error reading protocol dependencies cache -- aborting cache load");
                manager.cache_enabled = false;
                debug!("falling back to full run -- reloading graph");
                return dispatch(sources, manager);
            }
            None => {}
        }
    }

    if manager.use_fine_grained_cache() {
        process_fine_grained_cache_graph(&mut graph, manager)?;
    } else {
        process_graph(&mut graph, manager)?;
        if manager.options.cache_dir.is_some() {
            cache::write_plugins_snapshot(manager);
            manager.old_plugins_snapshot = Some(manager.plugins_snapshot.clone());
        }
        if manager.options.cache_fine_grained || manager.options.fine_grained_incremental {
            // Collect protocol dependencies now that the whole program has
            // been checked; they are a global property of it.
            if let Some(proto_deps) = manager.analysis.protocol_deps() {
                if !manager.options.fine_grained_incremental
                    && manager.options.cache_dir.is_some()
                {
                    cache::write_protocol_deps_cache(&proto_deps, manager, &graph);
                }
                manager.proto_deps = Some(proto_deps);
            }
        }
    }
    Ok(graph)
}

/// Finish loading everything for use as a fine-grained incremental cache:
/// only the recorded fine-grained deps are needed, no reprocessing happens.
fn process_fine_grained_cache_graph<A: Analysis>(
    graph: &mut Graph,
    manager: &mut Manager<A>,
) -> Result<(), CompileError> {
    let ids: Vec<String> = graph.keys().cloned().collect();
    for id in ids {
        graph.get_mut(&id).expect("listed id").load_fine_grained_deps(manager)?;
    }
    Ok(())
}

/// Process everything in dependency order.
#[instrument(skip_all, name = "process-graph")]
pub(crate) fn process_graph<A: Analysis>(
    graph: &mut Graph,
    manager: &mut Manager<A>,
) -> Result<(), CompileError> {
    let sccs = sorted_components_all(graph)
        .map_err(|err| CompileError::from_message(format!("sift: {err}")))?;
    debug!(
        "found {} SCCs; largest has {} nodes",
        sccs.len(),
        sccs.iter().map(HashSet::len).max().unwrap_or(0)
    );

    let mut fresh_scc_queue: Vec<Vec<String>> = Vec::new();

    // SCCs are processed from leaves (no further dependencies) to roots.
    for ascc in sccs {
        let mut scc = order_ascc(graph, &ascc, PRI_ALL);
        // If builtins is in the cycle, move it last: builtins sits in a small
        // cycle with the core stub modules and must be processed after them
        // or some built-in objects end up incompletely processed.
        if ascc.contains("builtins") {
            scc.retain(|id| id != "builtins");
            scc.push("builtins".to_string());
        }

        let stale_scc: BTreeSet<String> =
            scc.iter().filter(|id| !graph[id.as_str()].is_fresh()).cloned().collect();
        let mut fresh = stale_scc.is_empty();

        let mut deps: HashSet<String> = HashSet::new();
        for id in &scc {
            deps.extend(graph[id.as_str()].dependencies.iter().cloned());
        }
        for id in &ascc {
            deps.remove(id);
        }
        let stale_deps: BTreeSet<String> = deps
            .iter()
            .filter(|id| graph.get(*id).is_some_and(|dep| !dep.is_interface_fresh()))
            .cloned()
            .collect();
        if !manager.options.mixed_freshness {
            fresh = fresh && stale_deps.is_empty();
        }

        // Dependencies that were suppressed according to the cache but exist
        // in this run's graph. (Newly suppressed ones are caught by
        // `is_fresh`.)
        let mut undeps: BTreeSet<String> = BTreeSet::new();
        if fresh {
            for id in &scc {
                undeps.extend(graph[id.as_str()].suppressed.iter().cloned());
            }
            undeps.retain(|id| graph.contains_key(id));
            if !undeps.is_empty() {
                fresh = false;
            }
        }

        let fresh_msg = if fresh {
            // All records validated individually; but a dependency whose data
            // file was rewritten after ours may carry a newer interface we
            // have not reconciled, so compare data mtimes across the edge.
            let oldest_in_scc =
                scc.iter().map(|id| graph[id.as_str()].xmeta().data_mtime).min().unwrap_or(0);
            let viable: Vec<&String> = stale_deps
                .iter()
                .filter(|id| graph[id.as_str()].meta.is_some())
                .collect();
            let newest_in_deps =
                viable.iter().map(|id| graph[id.as_str()].xmeta().data_mtime).max().unwrap_or(0);
            if manager.options.mixed_freshness && !stale_deps.is_empty() {
                "fresh(ish)".to_string()
            } else if oldest_in_scc < newest_in_deps {
                // Equal mtimes get the benefit of the doubt: several
                // platforms only have one-second granularity.
                fresh = false;
                format!("out of date by {} seconds", newest_in_deps - oldest_in_scc)
            } else {
                "fresh".to_string()
            }
        } else if !undeps.is_empty() {
            format!("stale due to changed suppression ({})", join(&undeps))
        } else if !stale_scc.is_empty() {
            let mut msg = "inherently stale".to_string();
            if stale_scc.len() != ascc.len() {
                msg.push_str(&format!(" ({})", join(&stale_scc)));
            }
            if !stale_deps.is_empty() {
                msg.push_str(&format!(" with stale deps ({})", join(&stale_deps)));
            }
            msg
        } else {
            format!("stale due to deps ({})", join(&stale_deps))
        };

        // Initialize transitive_error for all SCC members from the union of
        // the dependencies' flags.
        if deps.iter().any(|dep| graph.get(dep).is_some_and(|d| d.transitive_error)) {
            for id in &scc {
                graph.get_mut(id).expect("scc member").transitive_error = true;
            }
        }

        let scc_str = scc.join(" ");
        if fresh {
            trace!("queuing {fresh_msg} SCC ({scc_str})");
            fresh_scc_queue.push(scc);
        } else {
            if !fresh_scc_queue.is_empty() {
                debug!("processing {} queued fresh SCCs", fresh_scc_queue.len());
                // Fresh SCCs are deferred until a stale one actually needs
                // the earlier modules loaded. Transitive errors need no
                // handling here: modules with them are never written to the
                // cache, so they cannot be part of a fresh SCC.
                for prev_scc in std::mem::take(&mut fresh_scc_queue) {
                    process_fresh_modules(graph, &prev_scc, manager)?;
                }
            }
            if scc.len() == 1 {
                debug!("processing SCC singleton ({scc_str}) as {fresh_msg}");
            } else {
                debug!("processing SCC of size {} ({scc_str}) as {fresh_msg}", scc.len());
            }
            process_stale_scc(graph, &scc, manager)?;
        }
    }

    let sccs_left = fresh_scc_queue.len();
    let nodes_left: usize = fresh_scc_queue.iter().map(Vec::len).sum();
    manager.add_stats("sccs_left", sccs_left as u64);
    manager.add_stats("nodes_left", nodes_left as u64);
    if sccs_left > 0 {
        debug!(
            "{sccs_left} fresh SCCs ({nodes_left} nodes) left in queue (and will remain unprocessed)"
        );
    } else {
        debug!("no fresh SCCs left in queue");
    }
    Ok(())
}

fn join(ids: &BTreeSet<String>) -> String {
    ids.iter().cloned().collect::<Vec<_>>().join(" ")
}

/// Come up with the ideal processing order within an SCC.
///
/// Using the priorities assigned to imports, try to reduce the cycle to a
/// DAG by omitting arcs of lower priority: for `A <--> B` where A has a
/// top-level `import B` but B only imports A inside a function, dropping the
/// low-priority `B -> A` arc leaves `A -> B`, so B is processed first.
///
/// When arcs of different priorities are present, all arcs at the maximum
/// priority are dropped, SCCs are recomputed on the reduced graph, and the
/// procedure recurses into each of them; the recursion is bounded because
/// the priority spread shrinks every round. With uniform priorities, nodes
/// are ordered by reverse global discovery order.
pub(crate) fn order_ascc(graph: &Graph, ascc: &HashSet<String>, pri_max: u8) -> Vec<String> {
    if ascc.len() == 1 {
        return ascc.iter().cloned().collect();
    }
    let mut pri_spread = BTreeSet::new();
    for id in ascc {
        let state = &graph[id.as_str()];
        for dep in &state.dependencies {
            if ascc.contains(dep) {
                let pri = state.priority(dep);
                if pri < pri_max {
                    pri_spread.insert(pri);
                }
            }
        }
    }
    if pri_spread.len() <= 1 {
        let mut scc: Vec<String> = ascc.iter().cloned().collect();
        scc.sort_by_key(|id| std::cmp::Reverse(graph[id.as_str()].order));
        return scc;
    }
    let pri_max = *pri_spread.iter().next_back().expect("spread is non-empty");
    let sccs = sorted_components(graph, Some(ascc), pri_max)
        .expect("a subcomponent ordering cannot be cyclic");
    sccs.iter().flat_map(|sub| order_ascc(graph, sub, pri_max)).collect()
}

/// Process one group of modules from their cached data: load the trees, fix
/// cross-references against the module map, and patch parent-package
/// namespaces.
pub(crate) fn process_fresh_modules<A: Analysis>(
    graph: &mut Graph,
    modules: &[String],
    manager: &mut Manager<A>,
) -> Result<(), CompileError> {
    for id in modules {
        graph.get_mut(id).expect("fresh module").load_tree(manager)?;
    }
    for id in modules {
        graph[id.as_str()].fix_cross_refs(manager);
    }
    for id in modules {
        graph[id.as_str()].patch_dependency_parents(manager);
    }
    Ok(())
}

/// Process the modules of one SCC from source.
///
/// In mixed-freshness mode, individually fresh modules inside the SCC are
/// loaded from cache instead of re-analyzed.
pub(crate) fn process_stale_scc<A: Analysis>(
    graph: &mut Graph,
    scc: &[String],
    manager: &mut Manager<A>,
) -> Result<(), CompileError> {
    let (fresh, stale): (Vec<String>, Vec<String>) = if manager.options.mixed_freshness {
        let fresh: Vec<String> =
            scc.iter().filter(|id| graph[id.as_str()].is_fresh()).cloned().collect();
        let fresh_set: HashSet<&String> = fresh.iter().collect();
        let stale: Vec<String> =
            scc.iter().filter(|id| !fresh_set.contains(id)).cloned().collect();
        if !fresh.is_empty() {
            debug!("  fresh ids: {}", fresh.join(", "));
        }
        if !stale.is_empty() {
            debug!("  stale ids: {}", stale.join(", "));
        }
        (fresh, stale)
    } else {
        (Vec::new(), scc.to_vec())
    };

    for id in &fresh {
        graph.get_mut(id).expect("scc member").load_tree(manager)?;
    }

    let graph_ids: HashSet<String> = graph.keys().cloned().collect();
    let entry_points = manager.source_set.source_modules.clone();
    for id in &stale {
        let state = graph.get_mut(id).expect("scc member");
        // May already have been parsed during discovery, in which case this
        // is a no-op.
        state.parse_file(manager)?;
        state.fix_suppressed_dependencies(&graph_ids, &entry_points);
    }

    if scc.iter().any(|id| id == "typing") {
        // The aliases for built-in generic collections need to be added to
        // the typing namespace by hand before anything resolves names in it.
        let Manager { analysis, modules, .. } = manager;
        analysis.inject_typing_aliases(modules);
    }

    for id in &fresh {
        graph[id.as_str()].fix_cross_refs(manager);
    }

    let mut patches: HashMap<String, Vec<(u32, A::Patch)>> = HashMap::new();
    for id in &stale {
        let collected = graph.get_mut(id).expect("scc member").semantic_analysis(manager)?;
        patches.insert(id.clone(), collected);
    }
    for id in &stale {
        let mut third =
            graph.get_mut(id).expect("scc member").semantic_analysis_pass_three(manager)?;
        // Pass-three patches come before pass-two patches of equal priority.
        let entry = patches.entry(id.clone()).or_default();
        third.append(entry);
        *entry = third;
    }
    for id in &stale {
        let mut collected = patches.remove(id).unwrap_or_default();
        collected.sort_by_key(|(priority, _)| *priority);
        let items: Vec<A::Patch> = collected.into_iter().map(|(_, patch)| patch).collect();
        let Manager { analysis, modules, .. } = manager;
        analysis.apply_patches(id, items, modules);
    }

    for id in &stale {
        graph.get_mut(id).expect("scc member").type_check_first_pass(manager)?;
    }
    let mut more = true;
    while more {
        more = false;
        for id in &stale {
            if graph.get_mut(id).expect("scc member").type_check_second_pass(manager)? {
                more = true;
            }
        }
    }

    for id in &stale {
        graph[id.as_str()].generate_unused_ignore_notes(manager);
    }
    if stale.iter().any(|id| manager.reporter.is_errors_for_file(&graph[id.as_str()].xpath)) {
        for id in &stale {
            graph.get_mut(id).expect("scc member").transitive_error = true;
        }
    }
    for id in &stale {
        let state = graph.get_mut(id).expect("scc member");
        state.finish_passes(manager)?;
        if manager.options.cache_fine_grained || manager.options.fine_grained_incremental {
            state.compute_fine_grained_deps(manager);
        }
        let messages = manager.reporter.file_messages(&state.xpath);
        manager.flush_errors(messages, false);
        state.write_cache(manager);
        state.mark_as_rechecked(manager);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[test]
    fn uniform_priorities_order_by_reverse_discovery() {
        let mut graph = Graph::new();
        graph.insert("a".into(), State::new_for_tests("a", 1, &[("b", 10)]));
        graph.insert("b".into(), State::new_for_tests("b", 2, &[("a", 10)]));
        let ascc: HashSet<String> = graph.keys().cloned().collect();

        assert_eq!(order_ascc(&graph, &ascc, PRI_ALL), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn low_priority_arcs_are_dropped_first() {
        // a imports b at the top level; b imports a inside a function. The
        // b -> a arc is dropped, so b must be processed before a.
        let mut graph = Graph::new();
        graph.insert("a".into(), State::new_for_tests("a", 1, &[("b", 10)]));
        graph.insert("b".into(), State::new_for_tests("b", 2, &[("a", 20)]));
        let ascc: HashSet<String> = graph.keys().cloned().collect();

        assert_eq!(order_ascc(&graph, &ascc, PRI_ALL), vec!["b".to_string(), "a".to_string()]);

        // Swap the priorities and the order flips with them.
        let mut graph = Graph::new();
        graph.insert("a".into(), State::new_for_tests("a", 1, &[("b", 20)]));
        graph.insert("b".into(), State::new_for_tests("b", 2, &[("a", 10)]));
        let ascc: HashSet<String> = graph.keys().cloned().collect();

        assert_eq!(order_ascc(&graph, &ascc, PRI_ALL), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn nested_priority_reduction_flattens() {
        // {a, b} cycle at medium priority, plus c attached to it with a
        // function-level back edge: dropping the low arc isolates c.
        let mut graph = Graph::new();
        graph.insert("a".into(), State::new_for_tests("a", 1, &[("b", 10), ("c", 10)]));
        graph.insert("b".into(), State::new_for_tests("b", 2, &[("a", 10)]));
        graph.insert("c".into(), State::new_for_tests("c", 3, &[("a", 20)]));
        let ascc: HashSet<String> = graph.keys().cloned().collect();

        let order = order_ascc(&graph, &ascc, PRI_ALL);
        // c has no low-priority importers left, so it is scheduled before
        // the {a, b} cycle it depends on is finished.
        assert_eq!(order.len(), 3);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
    }
}
