// mulewatch/src/analyzer/algorithms.rs
//
// Batch graph algorithms over the account projection. The projection is
// rebuilt from TRANSFERRED_TO edges each cycle; node identity is the
// account id and edge weight is the aggregated transfer total.
//
// Louvain and the centrality passes are deterministic: nodes are visited
// in sorted-id order so repeated cycles over an unchanged graph write
// identical values.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::store::TransferEdgeView;

pub struct Projection {
    pub graph: DiGraph<String, f64>,
    pub index: HashMap<String, NodeIndex>,
}

impl Projection {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.index.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// Build the directed account projection from the transfer edges.
pub fn build_projection(edges: &[TransferEdgeView]) -> Projection {
    let mut graph = DiGraph::new();
    let mut index: HashMap<String, NodeIndex> = HashMap::new();

    let mut names: HashSet<&str> = HashSet::new();
    for e in edges {
        names.insert(&e.from);
        names.insert(&e.to);
    }
    let mut sorted: Vec<&str> = names.into_iter().collect();
    sorted.sort();
    for name in sorted {
        let idx = graph.add_node(name.to_string());
        index.insert(name.to_string(), idx);
    }
    for e in edges {
        let (Some(&a), Some(&b)) = (index.get(&e.from), index.get(&e.to)) else { continue };
        graph.add_edge(a, b, e.total);
    }
    Projection { graph, index }
}

// ── PageRank ──────────────────────────────────────────────────────────────────

/// Weighted PageRank with dangling-mass redistribution.
pub fn pagerank(proj: &Projection, damping: f64, iterations: usize) -> HashMap<String, f64> {
    let n = proj.node_count();
    if n == 0 { return HashMap::new(); }

    let mut rank = vec![1.0 / n as f64; n];
    let out_weight: Vec<f64> = proj.graph.node_indices()
        .map(|v| proj.graph.edges(v).map(|e| *e.weight()).sum())
        .collect();

    for _ in 0..iterations {
        let mut next = vec![(1.0 - damping) / n as f64; n];
        let mut dangling = 0.0;
        for v in proj.graph.node_indices() {
            let i = v.index();
            if out_weight[i] <= 0.0 {
                dangling += rank[i];
                continue;
            }
            for e in proj.graph.edges(v) {
                next[e.target().index()] += damping * rank[i] * *e.weight() / out_weight[i];
            }
        }
        let share = damping * dangling / n as f64;
        for r in next.iter_mut() {
            *r += share;
        }
        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < 1e-9 { break; }
    }

    proj.graph.node_indices()
        .map(|v| (proj.graph[v].clone(), rank[v.index()]))
        .collect()
}

// ── Betweenness centrality (Brandes, unweighted, directed) ────────────────────

pub fn betweenness(proj: &Projection) -> HashMap<String, f64> {
    let n = proj.node_count();
    let mut centrality = vec![0.0f64; n];

    for s in proj.graph.node_indices() {
        let mut stack: Vec<NodeIndex> = Vec::new();
        let mut preds: Vec<Vec<NodeIndex>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist  = vec![-1i64; n];
        sigma[s.index()] = 1.0;
        dist[s.index()]  = 0;

        let mut queue = VecDeque::new();
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for e in proj.graph.edges(v) {
                let w = e.target();
                if dist[w.index()] < 0 {
                    dist[w.index()] = dist[v.index()] + 1;
                    queue.push_back(w);
                }
                if dist[w.index()] == dist[v.index()] + 1 {
                    sigma[w.index()] += sigma[v.index()];
                    preds[w.index()].push(v);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w.index()] {
                delta[v.index()] +=
                    sigma[v.index()] / sigma[w.index()] * (1.0 + delta[w.index()]);
            }
            if w != s {
                centrality[w.index()] += delta[w.index()];
            }
        }
    }

    // Directed normalization over (n-1)(n-2) source/target pairs.
    let norm = if n > 2 { ((n - 1) * (n - 2)) as f64 } else { 1.0 };
    proj.graph.node_indices()
        .map(|v| (proj.graph[v].clone(), centrality[v.index()] / norm))
        .collect()
}

// ── Local clustering coefficient (undirected view) ────────────────────────────

pub fn clustering_coefficients(proj: &Projection) -> HashMap<String, f64> {
    let n = proj.node_count();
    let mut neighbours: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for e in proj.graph.edge_references() {
        let (a, b) = (e.source().index(), e.target().index());
        if a == b { continue; }
        neighbours[a].insert(b);
        neighbours[b].insert(a);
    }

    proj.graph.node_indices()
        .map(|v| {
            let ns = &neighbours[v.index()];
            let k = ns.len();
            if k < 2 {
                return (proj.graph[v].clone(), 0.0);
            }
            let mut links = 0usize;
            let ns_vec: Vec<usize> = ns.iter().copied().collect();
            for (i, &a) in ns_vec.iter().enumerate() {
                for &b in &ns_vec[i + 1..] {
                    if neighbours[a].contains(&b) {
                        links += 1;
                    }
                }
            }
            let possible = k * (k - 1) / 2;
            (proj.graph[v].clone(), links as f64 / possible as f64)
        })
        .collect()
}

// ── Weakly connected components ───────────────────────────────────────────────

/// Component ids assigned in sorted-name order, so labels are stable for
/// an unchanged graph.
pub fn weakly_connected_components(proj: &Projection) -> HashMap<String, i64> {
    let n = proj.node_count();
    let mut undirected: Vec<Vec<usize>> = vec![Vec::new(); n];
    for e in proj.graph.edge_references() {
        let (a, b) = (e.source().index(), e.target().index());
        undirected[a].push(b);
        undirected[b].push(a);
    }

    let mut component = vec![-1i64; n];
    let mut next_id = 0i64;
    for name in proj.names() {
        let Some(&start) = proj.index.get(name) else { continue };
        if component[start.index()] >= 0 { continue; }
        let id = next_id;
        next_id += 1;
        let mut queue = VecDeque::from([start.index()]);
        component[start.index()] = id;
        while let Some(v) = queue.pop_front() {
            for &w in &undirected[v] {
                if component[w] < 0 {
                    component[w] = id;
                    queue.push_back(w);
                }
            }
        }
    }

    proj.graph.node_indices()
        .map(|v| (proj.graph[v].clone(), component[v.index()]))
        .collect()
}

// ── Louvain community detection ───────────────────────────────────────────────

/// Louvain over the undirected, weight-symmetrized projection. Returns
/// compact community ids keyed by account.
pub fn louvain_communities(proj: &Projection) -> HashMap<String, i64> {
    let n = proj.node_count();
    if n == 0 { return HashMap::new(); }

    // symmetrized adjacency, self-loops dropped
    let mut adj: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n];
    for e in proj.graph.edge_references() {
        let (a, b) = (e.source().index(), e.target().index());
        if a == b { continue; }
        *adj[a].entry(b).or_insert(0.0) += *e.weight();
        *adj[b].entry(a).or_insert(0.0) += *e.weight();
    }

    // membership[level] maps the previous level's super-nodes
    let mut membership: Vec<usize> = (0..n).collect();
    let mut level_adj = adj;

    loop {
        let (assignment, improved) = louvain_level(&level_adj);
        // compose into the flat membership
        for slot in membership.iter_mut() {
            *slot = assignment[*slot];
        }
        if !improved {
            break;
        }
        level_adj = aggregate(&level_adj, &assignment);
        if level_adj.len() <= 1 {
            break;
        }
    }

    // compact ids in sorted-name order
    let mut remap: HashMap<usize, i64> = HashMap::new();
    let mut out = HashMap::with_capacity(n);
    for name in proj.names() {
        let idx = proj.index[name].index();
        let next = remap.len() as i64;
        let id = *remap.entry(membership[idx]).or_insert(next);
        out.insert(name.to_string(), id);
    }
    out
}

/// One Louvain level: greedy modularity moves until stable.
fn louvain_level(adj: &[HashMap<usize, f64>]) -> (Vec<usize>, bool) {
    let n = adj.len();
    let strength: Vec<f64> = adj.iter().map(|ns| ns.values().sum()).collect();
    let m2: f64 = strength.iter().sum(); // 2m
    if m2 <= 0.0 {
        return ((0..n).collect(), false);
    }

    let mut community: Vec<usize> = (0..n).collect();
    let mut tot = strength.clone(); // total strength per community
    let mut improved_any = false;

    loop {
        let mut moved = false;
        for node in 0..n {
            let current = community[node];
            tot[current] -= strength[node];

            // weight from node to each neighbouring community; the
            // node's own self-loop moves with it and cancels out
            let mut links: HashMap<usize, f64> = HashMap::new();
            links.insert(current, 0.0);
            for (&peer, &w) in &adj[node] {
                if peer == node { continue; }
                *links.entry(community[peer]).or_insert(0.0) += w;
            }

            let mut best = current;
            let mut best_gain = links.get(&current).copied().unwrap_or(0.0)
                - tot[current] * strength[node] / m2;
            let mut candidates: Vec<&usize> = links.keys().collect();
            candidates.sort();
            for &c in candidates {
                let gain = links[&c] - tot[c] * strength[node] / m2;
                if gain > best_gain + 1e-12 {
                    best_gain = gain;
                    best = c;
                }
            }

            tot[best] += strength[node];
            if best != current {
                community[node] = best;
                moved = true;
                improved_any = true;
            }
        }
        if !moved {
            break;
        }
    }

    // relabel communities compactly
    let mut remap: HashMap<usize, usize> = HashMap::new();
    let assignment: Vec<usize> = community.iter()
        .map(|c| {
            let next = remap.len();
            *remap.entry(*c).or_insert(next)
        })
        .collect();
    (assignment, improved_any)
}

/// Collapse communities into super-nodes, summing edge weights. Intra-
/// community weight becomes a self-loop so higher levels see the full
/// strength of each super-node.
fn aggregate(adj: &[HashMap<usize, f64>], assignment: &[usize]) -> Vec<HashMap<usize, f64>> {
    let n_comm = assignment.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut out: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n_comm];
    for (node, ns) in adj.iter().enumerate() {
        let a = assignment[node];
        for (&peer, &w) in ns {
            let b = assignment[peer];
            *out[a].entry(b).or_insert(0.0) += w;
        }
    }
    out
}
