//! Dependency graph over the tasks of one taskset.
//!
//! Provides cycle detection, reverse-dependent lookup, topological layering
//! by longest-path depth, and dot/mermaid rendering for operators.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::task::{Task, TaskState};

/// A node in the dependency graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub task_id: String,
    pub title: String,
    pub state: TaskState,
    pub is_optional: bool,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

/// Dependency graph built from a task list. Edges point dependency → dependent.
#[derive(Debug, Clone)]
pub struct DepGraph {
    pub nodes: BTreeMap<String, GraphNode>,
}

impl DepGraph {
    /// Build the graph. Dependencies referencing unknown ids are kept on the
    /// node (creation-time validation rejects them) but grow no edges.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut nodes: BTreeMap<String, GraphNode> = tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    GraphNode {
                        task_id: t.id.clone(),
                        title: t.title.clone(),
                        state: t.state,
                        is_optional: t.is_optional,
                        dependencies: t.dependencies.clone(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        for task in tasks {
            for dep in &task.dependencies {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.push(task.id.clone());
                }
            }
        }

        Self { nodes }
    }

    /// Detect a dependency cycle via DFS over every edge. Returns one example
    /// cycle path, dependency-first, if any exists.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        self.find_cycle_filtered(false)
    }

    /// Cycle detection over the *blocking* subgraph: edges into optional
    /// tasks are skipped, since optional dependencies never gate readiness.
    /// Admission uses this form so mutually-optional pairs are accepted.
    pub fn find_blocking_cycle(&self) -> Option<Vec<String>> {
        self.find_cycle_filtered(true)
    }

    fn find_cycle_filtered(&self, skip_optional: bool) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        // Iterate in id order so the reported cycle is deterministic.
        for start in self.nodes.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            if let Some(cycle) =
                self.dfs_cycle(start, skip_optional, &mut visited, &mut stack, &mut on_stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node_id: &'a str,
        skip_optional: bool,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node_id);
        stack.push(node_id);
        on_stack.insert(node_id);

        if let Some(node) = self.nodes.get(node_id) {
            for dep in &node.dependencies {
                let Some(dep_node) = self.nodes.get(dep) else {
                    continue;
                };
                if skip_optional && dep_node.is_optional {
                    continue;
                }
                if on_stack.contains(dep.as_str()) {
                    let from = stack.iter().position(|&s| s == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..].iter().map(|s| (*s).to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) =
                        self.dfs_cycle(dep, skip_optional, visited, stack, on_stack)
                    {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(node_id);
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Ids of tasks that directly depend on `task_id`.
    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        self.nodes
            .get(task_id)
            .map(|n| n.dependents.clone())
            .unwrap_or_default()
    }

    /// Topological layering: level *k* holds every task whose longest
    /// *blocking* dependency path has depth *k*. Optional-target edges are
    /// excluded, matching admission's cycle rule. Fails on a blocking cycle.
    pub fn execution_order(&self) -> Result<Vec<Vec<String>>, Vec<String>> {
        if let Some(cycle) = self.find_blocking_cycle() {
            return Err(cycle);
        }

        let blocking = |dep: &str| self.nodes.get(dep).map(|n| !n.is_optional).unwrap_or(false);

        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        for (id, node) in &self.nodes {
            let deps_in_graph = node
                .dependencies
                .iter()
                .filter(|d| blocking(d))
                .count();
            in_degree.insert(id.as_str(), deps_in_graph);
            if deps_in_graph == 0 {
                depth.insert(id.as_str(), 0);
                queue.push_back(id.as_str());
            }
        }

        while let Some(id) = queue.pop_front() {
            let d = depth[id];
            let node = &self.nodes[id];
            if node.is_optional {
                // Edges out of an optional dependency were never counted.
                continue;
            }
            for dependent in &node.dependents {
                let entry = depth.entry(dependent.as_str()).or_insert(0);
                *entry = (*entry).max(d + 1);
                let deg = in_degree.get_mut(dependent.as_str()).expect("dependent in graph");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent.as_str());
                }
            }
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); if self.nodes.is_empty() { 0 } else { max_depth + 1 }];
        // BTreeMap iteration keeps level contents id-sorted.
        for id in self.nodes.keys() {
            levels[depth[id.as_str()]].push(id.clone());
        }
        Ok(levels)
    }

    /// Render as Graphviz dot. Nodes are colored by state; optional tasks get
    /// a dashed border.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph tasks {\n  rankdir=LR;\n  node [shape=box, style=filled];\n");
        for node in self.nodes.values() {
            let color = state_color(node.state);
            let style = if node.is_optional { "filled,dashed" } else { "filled" };
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\", fillcolor=\"{}\", style=\"{}\"];\n",
                node.task_id,
                node.task_id,
                escape_label(&node.title),
                color,
                style
            ));
        }
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if self.nodes.contains_key(dep) {
                    out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, node.task_id));
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Render as a mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart LR\n");
        let mut classes: BTreeSet<&'static str> = BTreeSet::new();
        for node in self.nodes.values() {
            let id = mermaid_id(&node.task_id);
            out.push_str(&format!("  {}[\"{} {}\"]\n", id, node.task_id, escape_label(&node.title)));
            let class = node.state.as_str();
            classes.insert(class);
            out.push_str(&format!("  class {} {}\n", id, class));
            if node.is_optional {
                out.push_str(&format!("  style {} stroke-dasharray: 5 5\n", id));
            }
        }
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if self.nodes.contains_key(dep) {
                    out.push_str(&format!("  {} --> {}\n", mermaid_id(dep), mermaid_id(&node.task_id)));
                }
            }
        }
        for class in classes {
            let color = state_color(TaskState::from_str(class).unwrap_or_default());
            out.push_str(&format!("  classDef {} fill:{}\n", class, color));
        }
        out
    }
}

fn state_color(state: TaskState) -> &'static str {
    match state {
        TaskState::Ready => "#b3d9ff",
        TaskState::Running => "#ffe6b3",
        TaskState::Blocked => "#e0e0e0",
        TaskState::Done => "#b3ffb3",
        TaskState::Failed => "#ffb3b3",
    }
}

fn escape_label(s: &str) -> String {
    s.replace('"', "'").replace('\n', " ")
}

/// Mermaid node ids cannot contain dots.
fn mermaid_id(task_id: &str) -> String {
    format!("t{}", task_id.replace('.', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, format!("Task {id}"), "d");
        for dep in deps {
            t = t.with_dependency(*dep);
        }
        t
    }

    #[test]
    fn linear_chain_has_no_cycle() {
        let g = DepGraph::from_tasks(&[task("1", &[]), task("2", &["1"]), task("3", &["2"])]);
        assert!(!g.has_cycle());
        assert_eq!(g.dependents_of("1"), vec!["2".to_string()]);
    }

    #[test]
    fn cycle_is_detected_and_reported() {
        let g = DepGraph::from_tasks(&[task("1", &["3"]), task("2", &["1"]), task("3", &["2"])]);
        let cycle = g.find_cycle().expect("cycle expected");
        // The reported path closes on itself.
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() >= 4);
    }

    #[test]
    fn execution_order_layers_by_longest_path() {
        //  1 ── 2 ── 4
        //  3 ───────┘
        let g = DepGraph::from_tasks(&[
            task("1", &[]),
            task("2", &["1"]),
            task("3", &[]),
            task("4", &["2", "3"]),
        ]);
        let levels = g.execution_order().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["1".to_string(), "3".to_string()]);
        assert_eq!(levels[1], vec!["2".to_string()]);
        // 4 sits at its longest-path depth even though "3" is at level 0
        assert_eq!(levels[2], vec!["4".to_string()]);
    }

    #[test]
    fn blocking_cycle_skips_optional_targets() {
        let mut a = task("1", &["2"]);
        a.is_optional = true;
        let mut b = task("2", &["1"]);
        b.is_optional = true;
        let g = DepGraph::from_tasks(&[a, b]);
        assert!(g.has_cycle());
        assert!(g.find_blocking_cycle().is_none());
        // Both sit at level 0 of the blocking order.
        assert_eq!(g.execution_order().unwrap(), vec![vec!["1".to_string(), "2".to_string()]]);
    }

    #[test]
    fn execution_order_fails_on_cycle() {
        let g = DepGraph::from_tasks(&[task("1", &["2"]), task("2", &["1"])]);
        assert!(g.execution_order().is_err());
    }

    #[test]
    fn dot_output_marks_optional_dashed() {
        let mut opt = task("2", &["1"]);
        opt.is_optional = true;
        let g = DepGraph::from_tasks(&[task("1", &[]), opt]);
        let dot = g.to_dot();
        assert!(dot.contains("digraph tasks"));
        assert!(dot.contains("\"1\" -> \"2\""));
        assert!(dot.contains("filled,dashed"));
    }

    #[test]
    fn mermaid_output_has_edges_and_classes() {
        let g = DepGraph::from_tasks(&[task("1.1", &[]), task("1.2", &["1.1"])]);
        let mmd = g.to_mermaid();
        assert!(mmd.contains("flowchart LR"));
        assert!(mmd.contains("t1_1 --> t1_2"));
        assert!(mmd.contains("classDef ready"));
    }

    #[test]
    fn unknown_dependency_grows_no_edge() {
        let g = DepGraph::from_tasks(&[task("2", &["9"])]);
        assert!(!g.has_cycle());
        let levels = g.execution_order().unwrap();
        assert_eq!(levels, vec![vec!["2".to_string()]]);
    }
}
