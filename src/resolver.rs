//! Resolution of the full module graph for a build.
//!
//! Starting from the root sources, discovery walks breadth-first over each
//! new module's ancestors, direct dependencies and previously suppressed
//! dependencies, constructing one state per reachable module. Imports that
//! cannot be located are moved into the referrer's suppressed list; a
//! suppressed module that turns out to exist after all is promoted back.
//! Breadth-first order keeps cycles balanced; it only affects tie-breaking.

use crate::{
    analysis::{Analysis, PRI_INDIRECT},
    error::CompileError,
    report::Severity,
    state::{find_module_simple, Graph, State, StateError},
    BuildSource, Manager,
};
use std::collections::HashSet;

/// Given the root sources, load the graph of all reachable modules.
///
/// An `old_graph` may be passed in as the starting point. As this may need to
/// parse files, it can fail with a blocking error when sources have syntax
/// errors.
pub(crate) fn load_graph<A: Analysis>(
    sources: &[BuildSource],
    manager: &mut Manager<A>,
    old_graph: Option<Graph>,
) -> Result<Graph, CompileError> {
    let mut graph = old_graph.unwrap_or_default();

    // Worklist of module IDs whose references still need walking; grows as
    // discovery proceeds.
    let mut new: Vec<String> = Vec::new();
    let mut entry_points: HashSet<String> = HashSet::new();

    // Seed the graph with the root sources.
    for source in sources {
        let state = match State::new(
            manager,
            source.module.as_deref(),
            source.path.clone(),
            source.text.clone(),
            None,
            None,
            true,
        ) {
            Ok(state) => state,
            Err(StateError::NotFound) => continue,
            Err(StateError::Compile(err)) => return Err(err),
        };
        if graph.contains_key(&state.id) {
            manager.reporter.set_file(state.xpath.clone(), Some(&state.id));
            manager.reporter.report(
                -1,
                format!("Duplicate module named '{}'", state.id),
                Severity::Error,
                true,
                false,
            );
            return Err(manager.reporter.compile_error());
        }
        entry_points.insert(state.id.clone());
        new.push(state.id.clone());
        graph.insert(state.id.clone(), state);
    }

    // Collect dependencies breadth-first.
    let mut next = 0;
    while next < new.len() {
        let st_id = new[next].clone();
        next += 1;

        let (ancestors, dependencies, suppressed, dep_lines) = {
            let state = &graph[&st_id];
            // Strip out indirect dependencies. They will be dealt with when
            // they show up as direct dependencies of something, and resolving
            // them here hurts: a stale record can name an indirect dependency
            // that was deleted since, even though the recorded direct
            // dependencies are still valid.
            let dependencies: Vec<String> = state
                .dependencies
                .iter()
                .filter(|dep| state.priority(dep) != PRI_INDIRECT)
                .cloned()
                .collect();
            (
                state.ancestors.clone(),
                dependencies,
                state.suppressed.clone(),
                state.dep_line_map.clone(),
            )
        };

        // Suppressed dependencies that exist again on disk: those must not be
        // recorded as missing. During a fine-grained cache load new modules
        // are deliberately not picked up; the fine-grained update handles
        // them.
        let added: HashSet<String> = if manager.use_fine_grained_cache() {
            HashSet::new()
        } else {
            suppressed
                .iter()
                .filter(|dep| find_module_simple(dep, manager).is_some())
                .cloned()
                .collect()
        };

        for dep in ancestors.iter().chain(dependencies.iter()).chain(suppressed.iter()) {
            let ignored =
                graph[&st_id].suppressed.contains(dep) && !entry_points.contains(dep);
            if ignored && !added.contains(dep) {
                manager.missing_modules.insert(dep.clone());
            } else if !graph.contains_key(dep) {
                let constructed = if ancestors.contains(dep) {
                    // Ancestors carry no import context.
                    State::new(
                        manager,
                        Some(dep.as_str()),
                        None,
                        None,
                        None,
                        Some(&graph[&st_id]),
                        false,
                    )
                } else {
                    let line = dep_lines.get(dep).copied().unwrap_or(1);
                    State::new(
                        manager,
                        Some(dep.as_str()),
                        None,
                        None,
                        Some((&graph[&st_id], line)),
                        None,
                        false,
                    )
                };
                match constructed {
                    Ok(newst) => {
                        debug_assert!(!graph.contains_key(&newst.id), "{} already loaded", newst.id);
                        new.push(newst.id.clone());
                        graph.insert(newst.id.clone(), newst);
                    }
                    Err(StateError::NotFound) => {
                        let state = graph.get_mut(&st_id).expect("referrer is in the graph");
                        if let Some(pos) = state.dependencies.iter().position(|d| d == dep) {
                            state.dependencies.remove(pos);
                            state.suppressed.push(dep.clone());
                        }
                    }
                    Err(StateError::Compile(err)) => return Err(err),
                }
            }
            if ancestors.contains(dep) {
                if let Some(ancestor) = graph.get_mut(dep) {
                    ancestor.child_modules.insert(st_id.clone());
                }
            }
            if graph.contains_key(dep) {
                // A previously suppressed file is now visible.
                let state = graph.get_mut(&st_id).expect("referrer is in the graph");
                if let Some(pos) = state.suppressed.iter().position(|d| d == dep) {
                    state.suppressed.remove(pos);
                    state.dependencies.push(dep.clone());
                }
            }
        }
    }
    Ok(graph)
}
