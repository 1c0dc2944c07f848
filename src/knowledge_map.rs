//! Concept graphs for knowledge maps.
//!
//! SQLite stays the source of truth for nodes and edges. A map is loaded
//! into a petgraph `StableUnGraph` when an operation needs graph
//! algorithms: centrality, neighbourhoods, subject filtering and layout.
//! Concepts are identified by name. Adding a name that already exists keeps
//! the attributes it was first added with.

use crate::errors::AppError;
use crate::models::{ConceptEdge, ConceptNode, KnowledgeMapRow};
use petgraph::stable_graph::{NodeIndex, StableUnGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Subjects offered when creating a map.
pub const SUBJECTS: [&str; 7] = ["수학", "물리", "화학", "생물", "지구과학", "국어", "영어"];

/// Display colour for a subject's nodes.
pub fn subject_color(subject: &str) -> &'static str {
    match subject {
        "수학" => "#FF6B6B",
        "물리" => "#4ECDC4",
        "화학" => "#45B7D1",
        "생물" => "#96CEB4",
        "지구과학" => "#FFEEAD",
        "국어" => "#D4A5A5",
        "영어" => "#9FA4C4",
        _ => "#888888",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown concept '{0}'")]
    UnknownConcept(String),
    #[error("concept '{0}' cannot be linked to itself")]
    SelfLoop(String),
}

impl From<GraphError> for AppError {
    fn from(err: GraphError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub subject: String,
    pub level: i64,
    /// Row id when the concept was loaded from storage.
    pub node_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub weight: f64,
    pub relationship: Option<String>,
}

/// A stored map as it is cached and returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub map: KnowledgeMapRow,
    pub nodes: Vec<ConceptNode>,
    pub edges: Vec<ConceptEdge>,
}

/// Degree centrality plus per-subject counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMetrics {
    pub node_count: usize,
    pub edge_count: usize,
    pub degree_centrality: BTreeMap<String, f64>,
    pub subject_counts: BTreeMap<String, usize>,
    /// Concept with the highest centrality, ties broken by name.
    pub hub: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub concept: String,
    pub subject: String,
    pub color: String,
    pub node_id: Option<i64>,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutEdge {
    pub source: String,
    pub target: String,
    pub weight: f64,
}

/// Node coordinates in [-1, 1] and the edges to draw between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapLayout {
    pub nodes: Vec<NodePosition>,
    pub edges: Vec<LayoutEdge>,
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    graph: StableUnGraph<Concept, Relation>,
    index: HashMap<String, NodeIndex>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for a stored map. Edges that point at unknown node
    /// ids are rejected.
    pub fn from_records(nodes: &[ConceptNode], edges: &[ConceptEdge]) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        let mut names_by_id: HashMap<i64, String> = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let idx = graph.add_concept(&node.concept, &node.subject, node.level);
            if graph.graph[idx].node_id.is_none() {
                graph.graph[idx].node_id = Some(node.node_id);
            }
            names_by_id.insert(node.node_id, node.concept.clone());
        }

        for edge in edges {
            let source = names_by_id
                .get(&edge.source_node_id)
                .ok_or_else(|| GraphError::UnknownConcept(format!("node {}", edge.source_node_id)))?;
            let target = names_by_id
                .get(&edge.target_node_id)
                .ok_or_else(|| GraphError::UnknownConcept(format!("node {}", edge.target_node_id)))?;
            if source == target {
                tracing::debug!("Skipping edge {} between duplicate concepts", edge.edge_id);
                continue;
            }
            graph.connect(source, target, edge.strength, edge.relationship_type.clone())?;
        }

        Ok(graph)
    }

    pub fn from_snapshot(snapshot: &MapSnapshot) -> Result<Self, GraphError> {
        Self::from_records(&snapshot.nodes, &snapshot.edges)
    }

    /// Adds a concept unless one with the same name exists already.
    pub fn add_concept(&mut self, name: &str, subject: &str, level: i64) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(Concept {
            name: name.to_string(),
            subject: subject.to_string(),
            level,
            node_id: None,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Links two existing concepts; linking them again replaces the attributes.
    pub fn connect(
        &mut self,
        a: &str,
        b: &str,
        weight: f64,
        relationship: Option<String>,
    ) -> Result<(), GraphError> {
        if a == b {
            return Err(GraphError::SelfLoop(a.to_string()));
        }
        let ia = self.lookup(a)?;
        let ib = self.lookup(b)?;
        self.graph.update_edge(
            ia,
            ib,
            Relation {
                weight,
                relationship,
            },
        );
        Ok(())
    }

    pub fn disconnect(&mut self, a: &str, b: &str) -> bool {
        let (Some(&ia), Some(&ib)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        match self.graph.find_edge(ia, ib) {
            Some(edge) => self.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// Removes a concept and all of its links.
    pub fn remove_concept(&mut self, name: &str) -> bool {
        match self.index.remove(name) {
            Some(idx) => self.graph.remove_node(idx).is_some(),
            None => false,
        }
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownConcept(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn concept(&self, name: &str) -> Option<&Concept> {
        self.index.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn edge_between(&self, a: &str, b: &str) -> Option<&Relation> {
        let ia = *self.index.get(a)?;
        let ib = *self.index.get(b)?;
        self.graph.find_edge(ia, ib).map(|edge| &self.graph[edge])
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn degree(&self, name: &str) -> usize {
        self.index
            .get(name)
            .map(|&idx| self.graph.edges(idx).count())
            .unwrap_or(0)
    }

    /// Sorted names of the concepts linked to `name`.
    pub fn neighbors(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors(idx)
            .map(|n| self.graph[n].name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sorted names of the concepts belonging to `subject`.
    pub fn concepts_by_subject(&self, subject: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .graph
            .node_weights()
            .filter(|c| c.subject == subject)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn subject_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for concept in self.graph.node_weights() {
            *counts.entry(concept.subject.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Degree divided by `n - 1`; a lone concept scores 0.
    pub fn degree_centrality(&self) -> BTreeMap<String, f64> {
        let n = self.graph.node_count();
        let scale = if n > 1 { 1.0 / (n as f64 - 1.0) } else { 0.0 };
        self.graph
            .node_indices()
            .map(|idx| {
                let degree = self.graph.edges(idx).count() as f64;
                (self.graph[idx].name.clone(), degree * scale)
            })
            .collect()
    }

    pub fn metrics(&self) -> MapMetrics {
        let degree_centrality = self.degree_centrality();
        let hub = degree_centrality
            .iter()
            .fold(None::<(&String, f64)>, |best, (name, &score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((name, score)),
            })
            .map(|(name, _)| name.clone());

        MapMetrics {
            node_count: self.node_count(),
            edge_count: self.edge_count(),
            degree_centrality,
            subject_counts: self.subject_counts(),
            hub,
        }
    }

    /// Fruchterman-Reingold force layout.
    ///
    /// Starts from evenly spaced points on the unit circle (concepts in name
    /// order), so the same graph always produces the same picture.
    pub fn spring_layout(&self, iterations: usize) -> MapLayout {
        let mut order: Vec<NodeIndex> = self.graph.node_indices().collect();
        order.sort_by(|a, b| self.graph[*a].name.cmp(&self.graph[*b].name));
        let n = order.len();
        let slot: HashMap<NodeIndex, usize> = order.iter().enumerate().map(|(i, &idx)| (idx, i)).collect();

        let mut pos: Vec<[f64; 2]> = (0..n)
            .map(|i| {
                let angle = 2.0 * std::f64::consts::PI * i as f64 / n.max(1) as f64;
                [angle.cos(), angle.sin()]
            })
            .collect();

        // Weighted neighbours per slot; attraction only acts along edges.
        let neighbours: Vec<Vec<(usize, f64)>> = order
            .iter()
            .map(|&idx| {
                self.graph
                    .edges(idx)
                    .map(|edge| {
                        let other = if edge.source() == idx {
                            edge.target()
                        } else {
                            edge.source()
                        };
                        (slot[&other], edge.weight().weight)
                    })
                    .collect()
            })
            .collect();

        if n > 1 {
            let k = (1.0 / n as f64).sqrt();
            let mut temperature = 0.1;
            let cooling = temperature / (iterations as f64 + 1.0);

            for _ in 0..iterations {
                let mut displacement = vec![[0.0_f64; 2]; n];
                for i in 0..n {
                    for j in 0..n {
                        if i == j {
                            continue;
                        }
                        let (dx, dy, distance) = offset(&pos, i, j);
                        let force = k * k / (distance * distance);
                        displacement[i][0] += dx * force;
                        displacement[i][1] += dy * force;
                    }
                    for &(j, weight) in &neighbours[i] {
                        let (dx, dy, distance) = offset(&pos, i, j);
                        let force = weight * distance / k;
                        displacement[i][0] -= dx * force;
                        displacement[i][1] -= dy * force;
                    }
                }
                for i in 0..n {
                    let [dx, dy] = displacement[i];
                    let length = (dx * dx + dy * dy).sqrt().max(0.01);
                    pos[i][0] += dx * temperature / length;
                    pos[i][1] += dy * temperature / length;
                }
                temperature -= cooling;
            }
        }

        rescale(&mut pos);

        let nodes = order
            .iter()
            .zip(pos.iter())
            .map(|(&idx, p)| {
                let concept = &self.graph[idx];
                NodePosition {
                    concept: concept.name.clone(),
                    subject: concept.subject.clone(),
                    color: subject_color(&concept.subject).to_string(),
                    node_id: concept.node_id,
                    x: p[0],
                    y: p[1],
                }
            })
            .collect();

        let mut edges: Vec<LayoutEdge> = self
            .graph
            .edge_references()
            .map(|edge| LayoutEdge {
                source: self.graph[edge.source()].name.clone(),
                target: self.graph[edge.target()].name.clone(),
                weight: edge.weight().weight,
            })
            .collect();
        edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));

        MapLayout { nodes, edges }
    }
}

/// Vector from node `j` to node `i` and its length, floored at 0.01.
fn offset(pos: &[[f64; 2]], i: usize, j: usize) -> (f64, f64, f64) {
    let dx = pos[i][0] - pos[j][0];
    let dy = pos[i][1] - pos[j][1];
    (dx, dy, (dx * dx + dy * dy).sqrt().max(0.01))
}

/// Centres positions on the origin and scales the largest coordinate to 1.
fn rescale(pos: &mut [[f64; 2]]) {
    if pos.is_empty() {
        return;
    }
    let n = pos.len() as f64;
    let cx = pos.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pos.iter().map(|p| p[1]).sum::<f64>() / n;
    for p in pos.iter_mut() {
        p[0] -= cx;
        p[1] -= cy;
    }
    let limit = pos
        .iter()
        .flat_map(|p| [p[0].abs(), p[1].abs()])
        .fold(0.0_f64, f64::max);
    if limit > 0.0 {
        for p in pos.iter_mut() {
            p[0] /= limit;
            p[1] /= limit;
        }
    }
}
