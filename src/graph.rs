//! Graph primitives: strongly connected components and topological sorting.
//!
//! These operate on the module graph purely through IDs; the scheduler
//! derives the SCC DAG here and orders it so that leaves (components without
//! further dependencies) come first.

use crate::{
    analysis::PRI_ALL,
    error::{BuildError, Result},
    state::Graph,
};
use std::collections::{HashMap, HashSet};

/// Compute the strongly connected components of a directed graph.
///
/// `edges` gives the target vertices of each vertex's outgoing edges; targets
/// outside `vertices` are ignored. Every input vertex occurs in exactly one
/// returned component; vertices not part of a cycle come back as singletons.
/// Emission order is arbitrary, topological ordering is established
/// separately.
///
/// Path-based algorithm with an explicit frame stack so that deep graphs
/// cannot overflow the call stack.
pub(crate) fn strongly_connected_components(
    vertices: &HashSet<String>,
    edges: &HashMap<String, Vec<String>>,
) -> Vec<HashSet<String>> {
    let mut identified: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut boundaries: Vec<usize> = Vec::new();
    let mut sccs: Vec<HashSet<String>> = Vec::new();

    // Deterministic traversal; the emitted partition is the same either way.
    let mut roots: Vec<&String> = vertices.iter().collect();
    roots.sort();

    for root in roots {
        if index.contains_key(root) {
            continue;
        }
        index.insert(root.clone(), stack.len());
        boundaries.push(stack.len());
        stack.push(root.clone());
        // (vertex, next outgoing edge to visit)
        let mut frames: Vec<(String, usize)> = vec![(root.clone(), 0)];

        while let Some(frame) = frames.last_mut() {
            let v = frame.0.clone();
            let out = edges.get(&v).map(Vec::as_slice).unwrap_or_default();
            if frame.1 < out.len() {
                let w = &out[frame.1];
                frame.1 += 1;
                if !vertices.contains(w) {
                    continue;
                }
                if !index.contains_key(w) {
                    index.insert(w.clone(), stack.len());
                    boundaries.push(stack.len());
                    stack.push(w.clone());
                    frames.push((w.clone(), 0));
                } else if !identified.contains(w) {
                    let w_index = index[w];
                    while w_index < *boundaries.last().expect("boundary stack never empty here") {
                        boundaries.pop();
                    }
                }
            } else {
                let v_index = index[&v];
                if boundaries.last() == Some(&v_index) {
                    boundaries.pop();
                    let scc: HashSet<String> = stack.split_off(v_index).into_iter().collect();
                    identified.extend(scc.iter().cloned());
                    sccs.push(scc);
                }
                frames.pop();
            }
        }
    }
    sccs
}

/// Topologically sort a dependency map, yielding batches of keys whose
/// orderings are equivalent.
///
/// Self-dependencies are discarded and entries are injected for dependencies
/// that have no entry of their own. Returns the still-blocked keys when no
/// progress can be made, which is impossible for input derived from an SCC
/// computation.
pub(crate) fn topsort(
    mut data: HashMap<usize, HashSet<usize>>,
) -> std::result::Result<Vec<HashSet<usize>>, Vec<usize>> {
    for (key, deps) in data.iter_mut() {
        deps.remove(key);
    }
    let orphans: Vec<usize> = data
        .values()
        .flatten()
        .copied()
        .filter(|dep| !data.contains_key(dep))
        .collect();
    for orphan in orphans {
        data.entry(orphan).or_default();
    }

    let mut batches = Vec::new();
    while !data.is_empty() {
        let ready: HashSet<usize> =
            data.iter().filter(|(_, deps)| deps.is_empty()).map(|(key, _)| *key).collect();
        if ready.is_empty() {
            let mut stuck: Vec<usize> = data.keys().copied().collect();
            stuck.sort_unstable();
            return Err(stuck);
        }
        data.retain(|key, _| !ready.contains(key));
        for deps in data.values_mut() {
            deps.retain(|dep| !ready.contains(dep));
        }
        batches.push(ready);
    }
    Ok(batches)
}

/// The dependencies of `id` that lie within `vertices` and whose import
/// priority is strictly below `pri_max`.
pub(crate) fn deps_filtered(
    graph: &Graph,
    vertices: &HashSet<String>,
    id: &str,
    pri_max: u8,
) -> Vec<String> {
    if !vertices.contains(id) {
        return Vec::new();
    }
    let state = &graph[id];
    state
        .dependencies
        .iter()
        .filter(|dep| vertices.contains(*dep) && state.priority(dep) < pri_max)
        .cloned()
        .collect()
}

/// The graph's SCCs, topologically sorted from leaves to roots.
///
/// Works on a subset of the graph too; dependencies outside `graph` (or the
/// given vertex set) are ignored. Batches of mutually unordered components
/// are ordered by reversed smallest discovery order so that modules
/// encountered later are processed earlier within a batch.
pub(crate) fn sorted_components(
    graph: &Graph,
    vertices: Option<&HashSet<String>>,
    pri_max: u8,
) -> Result<Vec<HashSet<String>>> {
    let all;
    let vertices = match vertices {
        Some(vertices) => vertices,
        None => {
            all = graph.keys().cloned().collect();
            &all
        }
    };
    let edges: HashMap<String, Vec<String>> = vertices
        .iter()
        .map(|id| (id.clone(), deps_filtered(graph, vertices, id, pri_max)))
        .collect();
    let sccs = strongly_connected_components(vertices, &edges);

    let mut scc_of: HashMap<&str, usize> = HashMap::new();
    for (idx, scc) in sccs.iter().enumerate() {
        for id in scc {
            scc_of.insert(id.as_str(), idx);
        }
    }
    let data: HashMap<usize, HashSet<usize>> = sccs
        .iter()
        .enumerate()
        .map(|(idx, scc)| {
            let deps = scc
                .iter()
                .flat_map(|id| deps_filtered(graph, vertices, id, pri_max))
                .map(|dep| scc_of[dep.as_str()])
                .collect();
            (idx, deps)
        })
        .collect();

    let batches = topsort(data).map_err(|stuck| {
        BuildError::CyclicDependency(
            stuck.into_iter().flat_map(|idx| sccs[idx].iter().cloned()).collect(),
        )
    })?;

    let mut res = Vec::new();
    for ready in batches {
        let mut batch: Vec<usize> = ready.into_iter().collect();
        batch.sort_by_key(|&idx| {
            std::cmp::Reverse(
                sccs[idx].iter().map(|id| graph[id.as_str()].order).min().unwrap_or_default(),
            )
        });
        res.extend(batch.into_iter().map(|idx| sccs[idx].clone()));
    }
    Ok(res)
}

/// Convenience wrapper for ordering the whole graph.
pub(crate) fn sorted_components_all(graph: &Graph) -> Result<Vec<HashSet<String>>> {
    sorted_components(graph, None, PRI_ALL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn edges(pairs: &[(&str, &[&str])]) -> (HashSet<String>, HashMap<String, Vec<String>>) {
        let vertices = pairs.iter().map(|(v, _)| v.to_string()).collect();
        let edges = pairs
            .iter()
            .map(|(v, deps)| (v.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect();
        (vertices, edges)
    }

    #[test]
    fn scc_emission_is_a_partition() {
        let (vertices, edges) = edges(&[
            ("a", &["b"]),
            ("b", &["c", "d"]),
            ("c", &["a"]),
            ("d", &[]),
            ("e", &["e"]),
        ]);
        let sccs = strongly_connected_components(&vertices, &edges);

        let mut seen = HashSet::new();
        for scc in &sccs {
            assert!(!scc.is_empty());
            for id in scc {
                assert!(seen.insert(id.clone()), "{id} appeared in two components");
            }
        }
        assert_eq!(seen, vertices);

        let cycle: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert!(sccs.contains(&cycle));
    }

    #[test]
    fn topsort_emits_dependencies_first() {
        // {0: {1, 2}, 1: {3}, 2: {3}} with 3 injected as an orphan.
        let data = HashMap::from([
            (0, HashSet::from([1, 2])),
            (1, HashSet::from([3])),
            (2, HashSet::from([3])),
        ]);
        let batches = topsort(data).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], HashSet::from([3]));
        assert_eq!(batches[1], HashSet::from([1, 2]));
        assert_eq!(batches[2], HashSet::from([0]));
    }

    #[test]
    fn topsort_reports_leftover_cycles() {
        let data = HashMap::from([(0, HashSet::from([1])), (1, HashSet::from([0]))]);
        assert_eq!(topsort(data).unwrap_err(), vec![0, 1]);
    }

    #[test]
    fn components_come_out_leaves_first() {
        let mut graph = Graph::new();
        graph.insert("a".into(), State::new_for_tests("a", 1, &[("b", 10)]));
        graph.insert("b".into(), State::new_for_tests("b", 2, &[("c", 10)]));
        graph.insert("c".into(), State::new_for_tests("c", 3, &[("b", 10)]));

        let sccs = sorted_components_all(&graph).unwrap();
        assert_eq!(sccs.len(), 2);
        assert_eq!(sccs[0], ["b", "c"].iter().map(|s| s.to_string()).collect());
        assert_eq!(sccs[1], HashSet::from(["a".to_string()]));
    }

    #[test]
    fn priority_filter_drops_low_arcs() {
        let mut graph = Graph::new();
        graph.insert("a".into(), State::new_for_tests("a", 1, &[("b", 10)]));
        graph.insert("b".into(), State::new_for_tests("b", 2, &[("a", 20)]));
        let vertices: HashSet<String> = graph.keys().cloned().collect();

        assert_eq!(deps_filtered(&graph, &vertices, "b", 20), Vec::<String>::new());
        assert_eq!(deps_filtered(&graph, &vertices, "a", 20), vec!["b".to_string()]);

        // With the low arc removed the cycle falls apart.
        let sccs = sorted_components(&graph, Some(&vertices), 20).unwrap();
        assert_eq!(sccs.len(), 2);
        assert_eq!(sccs[0], HashSet::from(["b".to_string()]));
    }
}
