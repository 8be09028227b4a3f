//! Section graph and scheduling.
//!
//! Builds a directed graph over sections from their dependency edges,
//! validates acyclicity (three-color DFS; a back edge yields the actual
//! cycle path), produces the deterministic topological order, and
//! partitions sections into *workstreams*: connected components of the
//! undirected projection, each independently executable.
//!
//! Task-level eligibility (locks, dependency-met sections, the
//! single-task pick) is SQL -- see
//! [`steroids_db::queries::tasks::next_eligible_task`]; this module
//! owns the pure graph math.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

use steroids_db::models::{Section, SectionDependency};

/// Errors from graph validation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle; `path` lists the section
    /// ids along it, first == last.
    #[error("section dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("dependency references unknown section {0}")]
    UnknownSection(String),
}

/// Sort key for deterministic tie-breaking: smaller priority wins, then
/// position, then id.
type OrderKey = (i64, i64, String);

/// The section dependency graph.
#[derive(Debug, Clone)]
pub struct SectionGraph {
    /// Sort key per node.
    keys: HashMap<String, OrderKey>,
    /// Edges `a -> b`: `a` must complete before `b`.
    dependents: HashMap<String, Vec<String>>,
    /// Reverse edges: per node, who it depends on.
    dependencies: HashMap<String, Vec<String>>,
}

impl SectionGraph {
    /// Build a graph from section rows and dependency edges.
    ///
    /// Fails if an edge references a section that does not exist.
    pub fn build(
        sections: &[Section],
        dependencies: &[SectionDependency],
    ) -> Result<Self, GraphError> {
        let mut keys = HashMap::new();
        for section in sections {
            keys.insert(
                section.id.clone(),
                (section.priority, section.position, section.id.clone()),
            );
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for edge in dependencies {
            if !keys.contains_key(&edge.section_id) {
                return Err(GraphError::UnknownSection(edge.section_id.clone()));
            }
            if !keys.contains_key(&edge.depends_on_section_id) {
                return Err(GraphError::UnknownSection(edge.depends_on_section_id.clone()));
            }
            dependents
                .entry(edge.depends_on_section_id.clone())
                .or_default()
                .push(edge.section_id.clone());
            deps.entry(edge.section_id.clone())
                .or_default()
                .push(edge.depends_on_section_id.clone());
        }

        Ok(Self {
            keys,
            dependents,
            dependencies: deps,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.contains_key(id)
    }

    /// Validate acyclicity via three-color DFS.
    ///
    /// White = unvisited, gray = on the current DFS stack, black =
    /// done. Hitting a gray node is a back edge; the cycle is the stack
    /// suffix from that node, closed back on itself.
    pub fn validate(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            self.keys.keys().map(|id| (id.as_str(), Color::White)).collect();

        // Iterative DFS keeping an explicit path so the cycle can be
        // reported. Roots are visited in sorted order for determinism.
        let mut roots: Vec<&String> = self.keys.keys().collect();
        roots.sort();

        for root in roots {
            if colors[root.as_str()] != Color::White {
                continue;
            }

            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            let mut path: Vec<&str> = vec![root.as_str()];
            colors.insert(root.as_str(), Color::Gray);

            while let Some((node, child_idx)) = stack.last_mut() {
                let node = *node;
                let children = self
                    .dependents
                    .get(node)
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);

                if *child_idx < children.len() {
                    let child = children[*child_idx].as_str();
                    *child_idx += 1;

                    match colors[child] {
                        Color::Gray => {
                            // Back edge: slice the path from the first
                            // occurrence of `child` and close the loop.
                            let start = path.iter().position(|&p| p == child).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(child.to_string());
                            return Err(GraphError::Cycle { path: cycle });
                        }
                        Color::White => {
                            colors.insert(child, Color::Gray);
                            stack.push((child, 0));
                            path.push(child);
                        }
                        Color::Black => {}
                    }
                } else {
                    colors.insert(node, Color::Black);
                    stack.pop();
                    path.pop();
                }
            }
        }

        Ok(())
    }

    /// Deterministic topological order over `filter` (or all nodes).
    ///
    /// Among simultaneously-ready nodes the smallest
    /// `(priority, position, id)` goes first, so the result is the
    /// lexicographically smallest valid order on that key.
    pub fn topo_order(&self, filter: Option<&HashSet<String>>) -> Result<Vec<String>, GraphError> {
        self.validate()?;

        let in_scope = |id: &str| filter.is_none_or(|f| f.contains(id));

        // In-degree restricted to the filtered subgraph.
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for id in self.keys.keys() {
            if in_scope(id) {
                indegree.insert(id.as_str(), 0);
            }
        }
        for (dep, dependents) in &self.dependents {
            if !in_scope(dep) {
                continue;
            }
            for dependent in dependents {
                if let Some(count) = indegree.get_mut(dependent.as_str()) {
                    *count += 1;
                }
            }
        }

        // Ready set ordered by the canonical key.
        let mut ready: BTreeSet<(&OrderKey, &str)> = BTreeSet::new();
        for (&id, &count) in &indegree {
            if count == 0 {
                ready.insert((&self.keys[id], id));
            }
        }

        let mut order = Vec::with_capacity(indegree.len());
        while let Some(&(key, id)) = ready.iter().next() {
            ready.remove(&(key, id));
            order.push(id.to_string());

            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if let Some(count) = indegree.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert((&self.keys[dependent.as_str()], dependent.as_str()));
                        }
                    }
                }
            }
        }

        Ok(order)
    }

    /// Partition into workstreams: connected components of the
    /// undirected projection, each internally in topological order,
    /// components sorted by their minimum internal position.
    pub fn workstreams(&self) -> Result<Vec<Workstream>, GraphError> {
        self.validate()?;

        // Union via undirected flood fill from each unvisited node,
        // in sorted order for determinism.
        let mut component_of: HashMap<&str, usize> = HashMap::new();
        let mut components: Vec<Vec<&str>> = Vec::new();

        let mut nodes: Vec<&String> = self.keys.keys().collect();
        nodes.sort();

        for node in nodes {
            if component_of.contains_key(node.as_str()) {
                continue;
            }
            let idx = components.len();
            let mut members = Vec::new();
            let mut queue = vec![node.as_str()];
            component_of.insert(node.as_str(), idx);

            while let Some(current) = queue.pop() {
                members.push(current);
                let forward = self.dependents.get(current).into_iter().flatten();
                let backward = self.dependencies.get(current).into_iter().flatten();
                for neighbor in forward.chain(backward) {
                    if !component_of.contains_key(neighbor.as_str()) {
                        component_of.insert(neighbor.as_str(), idx);
                        queue.push(neighbor.as_str());
                    }
                }
            }
            components.push(members);
        }

        let mut workstreams = Vec::with_capacity(components.len());
        for members in components {
            let filter: HashSet<String> = members.iter().map(|s| s.to_string()).collect();
            let sections = self.topo_order(Some(&filter))?;
            let min_position = members
                .iter()
                .map(|id| self.keys[*id].1)
                .min()
                .unwrap_or(0);
            workstreams.push(Workstream {
                sections,
                min_position,
            });
        }

        workstreams.sort_by_key(|w| (w.min_position, w.sections.first().cloned()));
        Ok(workstreams)
    }
}

/// One independently executable group of sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workstream {
    /// Section ids in topological order.
    pub sections: Vec<String>,
    /// Minimum `position` across members; partition order key.
    pub min_position: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn section(id: &str, position: i64, priority: i64) -> Section {
        Section {
            id: id.to_string(),
            name: id.to_string(),
            position,
            priority,
            skipped: false,
            source_file: None,
            created_at: Utc::now(),
        }
    }

    fn edge(section_id: &str, depends_on: &str) -> SectionDependency {
        SectionDependency {
            section_id: section_id.to_string(),
            depends_on_section_id: depends_on.to_string(),
        }
    }

    #[test]
    fn topo_order_respects_edges() {
        let sections = vec![
            section("a", 0, 50),
            section("b", 1, 50),
            section("c", 2, 50),
        ];
        let deps = vec![edge("b", "a"), edge("c", "b")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();

        let order = graph.topo_order(None).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_order_ties_break_on_priority_then_position() {
        // All independent; ordering is purely the canonical key.
        let sections = vec![
            section("z-first", 9, 10),
            section("a-late", 5, 50),
            section("m-early", 1, 50),
        ];
        let graph = SectionGraph::build(&sections, &[]).unwrap();

        let order = graph.topo_order(None).unwrap();
        assert_eq!(order, vec!["z-first", "m-early", "a-late"]);
    }

    #[test]
    fn topo_order_is_lexicographically_smallest() {
        // Diamond: a -> {b, c} -> d. b and c become ready together;
        // c has the smaller key.
        let sections = vec![
            section("a", 0, 50),
            section("b", 2, 50),
            section("c", 1, 50),
            section("d", 3, 50),
        ];
        let deps = vec![edge("b", "a"), edge("c", "a"), edge("d", "b"), edge("d", "c")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();

        let order = graph.topo_order(None).unwrap();
        assert_eq!(order, vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn every_edge_is_respected_in_larger_graph() {
        let sections: Vec<Section> = (0..10)
            .map(|i| section(&format!("s{i}"), i, 50))
            .collect();
        let deps = vec![
            edge("s3", "s0"),
            edge("s3", "s1"),
            edge("s4", "s3"),
            edge("s7", "s2"),
            edge("s8", "s7"),
            edge("s9", "s4"),
            edge("s9", "s8"),
        ];
        let graph = SectionGraph::build(&sections, &deps).unwrap();
        let order = graph.topo_order(None).unwrap();

        let index: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for dep in &deps {
            assert!(
                index[dep.depends_on_section_id.as_str()] < index[dep.section_id.as_str()],
                "{} must precede {}",
                dep.depends_on_section_id,
                dep.section_id
            );
        }
    }

    #[test]
    fn cycle_is_detected_with_genuine_path() {
        let sections = vec![section("a", 0, 50), section("b", 1, 50), section("c", 2, 50)];
        let deps = vec![edge("b", "a"), edge("c", "b"), edge("a", "c")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();

        let err = graph.validate().unwrap_err();
        let GraphError::Cycle { path } = err else {
            panic!("expected cycle error");
        };

        // The reported path is a closed walk along real edges.
        assert!(path.len() >= 3);
        assert_eq!(path.first(), path.last());
        for pair in path.windows(2) {
            let from = &pair[0];
            let to = &pair[1];
            let has_edge = deps
                .iter()
                .any(|d| &d.depends_on_section_id == from && &d.section_id == to);
            assert!(has_edge, "reported cycle edge {from} -> {to} not in graph");
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let sections = vec![section("a", 0, 50)];
        let deps = vec![edge("a", "a")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn unknown_section_in_edge_is_rejected() {
        let sections = vec![section("a", 0, 50)];
        let deps = vec![edge("a", "ghost")];
        let result = SectionGraph::build(&sections, &deps);
        assert!(matches!(result, Err(GraphError::UnknownSection(_))));
    }

    #[test]
    fn workstreams_are_undirected_components_in_position_order() {
        // Two chains and an isolated node. Edges point within chains
        // only; the undirected projection groups each chain.
        let sections = vec![
            section("a1", 4, 50),
            section("a2", 5, 50),
            section("b1", 0, 50),
            section("b2", 1, 50),
            section("lone", 2, 50),
        ];
        let deps = vec![edge("a2", "a1"), edge("b2", "b1")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();

        let workstreams = graph.workstreams().unwrap();
        assert_eq!(workstreams.len(), 3);

        // Sorted by minimum internal position: b-chain (0), lone (2), a-chain (4).
        assert_eq!(workstreams[0].sections, vec!["b1", "b2"]);
        assert_eq!(workstreams[1].sections, vec!["lone"]);
        assert_eq!(workstreams[2].sections, vec!["a1", "a2"]);
    }

    #[test]
    fn fan_in_joins_components() {
        // c depends on both a and b: one component despite two roots.
        let sections = vec![section("a", 0, 50), section("b", 1, 50), section("c", 2, 50)];
        let deps = vec![edge("c", "a"), edge("c", "b")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();

        let workstreams = graph.workstreams().unwrap();
        assert_eq!(workstreams.len(), 1);
        assert_eq!(workstreams[0].sections, vec!["a", "b", "c"]);
    }

    #[test]
    fn filtered_topo_order_ignores_out_of_scope_nodes() {
        let sections = vec![section("a", 0, 50), section("b", 1, 50), section("c", 2, 50)];
        let deps = vec![edge("b", "a"), edge("c", "b")];
        let graph = SectionGraph::build(&sections, &deps).unwrap();

        let filter: HashSet<String> = ["b".to_string(), "c".to_string()].into();
        let order = graph.topo_order(Some(&filter)).unwrap();
        assert_eq!(order, vec!["b", "c"]);
    }
}
