//! Dependency-graph algorithms over service names.
//!
//! Edges point from a service to the services it depends on. The callers pass a lookup
//! closure so the same code runs against the live table and against a table plus one
//! not-yet-installed descriptor.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::service::ServiceName;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White, // unvisited
    Gray,  // on the current path
    Black, // finished
}

/// DFS from `start` following dependency edges; returns the cycle path if one is reachable.
///
/// The returned path is closed: its last element repeats the node where the cycle starts.
pub(crate) fn find_cycle<'a, F>(start: &'a ServiceName, deps_of: F) -> Option<Vec<ServiceName>>
where
    F: Fn(&ServiceName) -> Option<&'a BTreeSet<ServiceName>>,
{
    fn dfs<'a, F>(
        node: &'a ServiceName,
        deps_of: &F,
        colors: &mut HashMap<&'a ServiceName, Color>,
        path: &mut Vec<&'a ServiceName>,
    ) -> Option<Vec<ServiceName>>
    where
        F: Fn(&ServiceName) -> Option<&'a BTreeSet<ServiceName>>,
    {
        colors.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = deps_of(node) {
            for dep in deps {
                match colors.get(dep).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        // back edge
                        if let Some(cycle_start) = path.iter().position(|n| *n == dep) {
                            let mut cycle: Vec<ServiceName> =
                                path[cycle_start..].iter().map(|n| (*n).clone()).collect();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                    }
                    Color::White => {
                        if let Some(cycle) = dfs(dep, deps_of, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    let mut colors = HashMap::new();
    let mut path = Vec::new();
    dfs(start, &deps_of, &mut colors, &mut path)
}

/// Order `names` so that every service comes before the services it depends on.
///
/// Only edges between members of `names` matter. Kahn's algorithm runs in dependency-first
/// order seeded by the input order, and the result is reversed, so independent services come
/// out in reverse input order.
pub(crate) fn removal_order<'a, F>(names: &[ServiceName], deps_of: F) -> Vec<ServiceName>
where
    F: Fn(&ServiceName) -> Option<&'a BTreeSet<ServiceName>>,
{
    let mut seen = HashSet::new();
    let nodes: Vec<&ServiceName> = names.iter().filter(|n| seen.insert(*n)).collect();
    let idx: HashMap<&ServiceName, usize> =
        nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    // edge dep -> dependent (dependency first)
    let mut adj = vec![Vec::<usize>::new(); nodes.len()];
    let mut indeg = vec![0usize; nodes.len()];
    for (u, name) in nodes.iter().enumerate() {
        if let Some(deps) = deps_of(*name) {
            for d in deps {
                if let Some(&v) = idx.get(d) {
                    if v != u {
                        adj[v].push(u);
                        indeg[u] += 1;
                    }
                }
            }
        }
    }

    let mut q: VecDeque<usize> = (0..nodes.len()).filter(|&i| indeg[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(u) = q.pop_front() {
        order.push(u);
        for &w in &adj[u] {
            indeg[w] -= 1;
            if indeg[w] == 0 {
                q.push_back(w);
            }
        }
    }

    // The container rejects cycles on install; keep any leftovers rather than dropping them.
    if order.len() < nodes.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        order.extend((0..nodes.len()).filter(|i| !placed.contains(i)));
    }

    order.into_iter().rev().map(|i| nodes[i].clone()).collect()
}
