//! Matching of live sub-streams to the peer channels that deliver them.
//!
//! This is a max-flow problem on the graph `source -> streams -> channels -> sink`: every
//!  stream has capacity 1 (it is delivered by at most one channel), every channel has the number
//!  of streams it can carry as its capacity toward the sink. Edmonds-Karp (BFS augmenting paths)
//!  finds a maximum matching. The candidates of a stream are explored in preference order (the
//!  currently assigned channel first, then by ascending lag), so ties resolve to the preferred
//!  channel.

use std::collections::VecDeque;

use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Assignment {
    pub stream: usize,
    pub channel: usize,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    channel: usize,
    lag: i64,
    current: bool,
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    to: usize,
    capacity: i64,
}

/// residual graph as an edge list where edge `i ^ 1` is the reverse of edge `i`
struct Graph {
    edges: Vec<Edge>,
    adjacency: Vec<Vec<usize>>,
}

impl Graph {
    fn new(node_count: usize) -> Graph {
        Graph {
            edges: Vec::new(),
            adjacency: vec![Vec::new(); node_count],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, capacity: i64) -> usize {
        let id = self.edges.len();
        self.edges.push(Edge { to, capacity });
        self.adjacency[from].push(id);
        self.edges.push(Edge { to: from, capacity: 0 });
        self.adjacency[to].push(id + 1);
        id
    }

    /// shortest path with residual capacity as a list of edge ids, if there is one
    fn augmenting_path(&self, source: usize, sink: usize) -> Option<Vec<usize>> {
        let mut via: Vec<Option<usize>> = vec![None; self.adjacency.len()];
        let mut visited = vec![false; self.adjacency.len()];
        let mut queue = VecDeque::new();
        visited[source] = true;
        queue.push_back(source);

        while let Some(node) = queue.pop_front() {
            if node == sink {
                break;
            }
            for &e in &self.adjacency[node] {
                let edge = self.edges[e];
                if edge.capacity > 0 && !visited[edge.to] {
                    visited[edge.to] = true;
                    via[edge.to] = Some(e);
                    queue.push_back(edge.to);
                }
            }
        }

        if !visited[sink] {
            return None;
        }

        let mut path = Vec::new();
        let mut node = sink;
        while let Some(e) = via[node] {
            path.push(e);
            node = self.edges[e ^ 1].to;
        }
        path.reverse();
        Some(path)
    }
}

pub struct StreamAssigner {
    stream_count: usize,
    channel_capacities: Vec<i64>,
    candidates: Vec<Vec<Candidate>>,
}

impl StreamAssigner {
    pub fn new(stream_count: usize, channel_capacities: Vec<i64>) -> StreamAssigner {
        StreamAssigner {
            stream_count,
            channel_capacities,
            candidates: vec![Vec::new(); stream_count],
        }
    }

    /// Registers `channel` as a possible source of `stream`. `lag` is the mean delay with which
    ///  the channel announced the stream's chunks, `current` marks the existing assignment.
    pub fn add_candidate(&mut self, stream: usize, channel: usize, lag: i64, current: bool) {
        if stream >= self.stream_count || channel >= self.channel_capacities.len() {
            return;
        }
        self.candidates[stream].push(Candidate { channel, lag, current });
    }

    /// Returns the total flow (number of assigned streams) and the assignments
    pub fn run(&self) -> (i64, Vec<Assignment>) {
        let channel_count = self.channel_capacities.len();
        let source = 0;
        let sink = 1 + self.stream_count + channel_count;
        let stream_node = |s: usize| 1 + s;
        let channel_node = |c: usize| 1 + self.stream_count + c;

        let mut graph = Graph::new(sink + 1);
        let mut stream_edges = Vec::new();

        for (stream, candidates) in self.candidates.iter().enumerate() {
            if candidates.is_empty() {
                continue;
            }
            graph.add_edge(source, stream_node(stream), 1);

            let mut ordered = candidates.clone();
            ordered.sort_by_key(|c| (!c.current, c.lag, c.channel));
            for c in ordered {
                let e = graph.add_edge(stream_node(stream), channel_node(c.channel), 1);
                stream_edges.push((e, Assignment { stream, channel: c.channel }));
            }
        }
        for (channel, &capacity) in self.channel_capacities.iter().enumerate() {
            if capacity > 0 {
                graph.add_edge(channel_node(channel), sink, capacity);
            }
        }

        let mut flow = 0;
        while let Some(path) = graph.augmenting_path(source, sink) {
            let bottleneck = path.iter()
                .map(|&e| graph.edges[e].capacity)
                .min()
                .unwrap_or(0);
            if bottleneck == 0 {
                break;
            }
            for e in path {
                graph.edges[e].capacity -= bottleneck;
                graph.edges[e ^ 1].capacity += bottleneck;
            }
            flow += bottleneck;
        }

        let assignments: Vec<Assignment> = stream_edges.into_iter()
            .filter(|(e, _)| graph.edges[*e].capacity == 0)
            .map(|(_, a)| a)
            .collect();
        trace!(flow, ?assignments, "stream assignment");
        (flow, assignments)
    }
}
