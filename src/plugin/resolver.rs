//! Dependency Resolver
//!
//! Orders plugins so that each plugin follows its required dependencies, and
//! reports dependency cycles. Ordering is deterministic: ties are broken by
//! plugin id.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PluginError, PluginResult};
use crate::plugin::metadata::PluginId;

/// Outcome of ordering a dependency graph that may contain cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Orderable plugins, dependencies first
    pub order: Vec<PluginId>,
    /// Each detected cycle, as a closed path (`a -> b -> a`)
    pub cycles: Vec<Vec<PluginId>>,
    /// Plugins that are in a cycle or depend (transitively) on one
    pub blocked: BTreeSet<PluginId>,
}

/// Dependency graph over a set of plugins.
///
/// Dependencies on ids outside the graph do not affect ordering; their
/// satisfaction is checked by the caller.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    graph: BTreeMap<PluginId, BTreeSet<PluginId>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin and its required dependencies
    pub fn add<I, S>(&mut self, id: &str, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deps = self.graph.entry(id.to_string()).or_default();
        deps.extend(dependencies.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Dependencies restricted to plugins in the graph
    fn edges<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a PluginId> + 'a {
        let graph = &self.graph;
        graph
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter())
            .filter(move |dep| graph.contains_key(dep.as_str()))
    }

    /// Topological order, or `DependencyCycle` naming the first cycle found
    pub fn resolve(&self) -> PluginResult<Vec<PluginId>> {
        let resolution = self.partition();
        match resolution.cycles.first() {
            Some(cycle) => Err(PluginError::dependency_cycle(cycle)),
            None => Ok(resolution.order),
        }
    }

    /// Order everything that can be ordered and set aside cycles
    pub fn partition(&self) -> Resolution {
        let components = self.strongly_connected();
        let mut cycles = Vec::new();
        let mut cyclic = BTreeSet::new();
        for component in components {
            let first = match component.iter().next() {
                Some(first) => first.clone(),
                None => continue,
            };
            let self_loop = self.edges(&first).any(|d| *d == first);
            if component.len() > 1 || self_loop {
                cycles.push(self.cycle_path(&first, &component));
                cyclic.extend(component);
            }
        }
        cycles.sort();

        let mut blocked = cyclic.clone();
        let mut memo: BTreeMap<&str, bool> = BTreeMap::new();
        for id in self.graph.keys() {
            if self.reaches_blocked(id, &cyclic, &mut memo) {
                blocked.insert(id.clone());
            }
        }

        let mut order = Vec::with_capacity(self.graph.len());
        let mut visited = BTreeSet::new();
        for id in self.graph.keys() {
            self.visit(id, &blocked, &mut visited, &mut order);
        }

        Resolution {
            order,
            cycles,
            blocked,
        }
    }

    /// Every plugin that transitively depends on `id`, excluding `id`
    pub fn dependents_closure(&self, id: &str) -> BTreeSet<PluginId> {
        let mut result = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for (candidate, deps) in &self.graph {
                if deps.contains(&current) && candidate != id && result.insert(candidate.clone()) {
                    frontier.push(candidate.clone());
                }
            }
        }
        result
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        blocked: &BTreeSet<PluginId>,
        visited: &mut BTreeSet<&'a str>,
        order: &mut Vec<PluginId>,
    ) {
        if blocked.contains(id) || !visited.insert(id) {
            return;
        }
        for dep in self.edges(id) {
            self.visit(dep, blocked, visited, order);
        }
        order.push(id.to_string());
    }

    fn reaches_blocked<'a>(
        &'a self,
        id: &'a str,
        cyclic: &BTreeSet<PluginId>,
        memo: &mut BTreeMap<&'a str, bool>,
    ) -> bool {
        if cyclic.contains(id) {
            return true;
        }
        if let Some(known) = memo.get(id) {
            return *known;
        }
        // provisional answer guards against revisiting while in progress
        memo.insert(id, false);
        let result = self
            .edges(id)
            .any(|dep| self.reaches_blocked(dep, cyclic, memo));
        memo.insert(id, result);
        result
    }

    /// Closed path from `start` back to itself inside one component
    fn cycle_path(&self, start: &str, component: &BTreeSet<PluginId>) -> Vec<PluginId> {
        let mut path = vec![start.to_string()];
        let mut seen = BTreeSet::new();
        if self.walk_back(start, start, component, &mut path, &mut seen) {
            path
        } else {
            vec![start.to_string(), start.to_string()]
        }
    }

    fn walk_back(
        &self,
        current: &str,
        target: &str,
        component: &BTreeSet<PluginId>,
        path: &mut Vec<PluginId>,
        seen: &mut BTreeSet<PluginId>,
    ) -> bool {
        for dep in self.edges(current) {
            if !component.contains(dep) {
                continue;
            }
            if dep == target {
                path.push(dep.clone());
                return true;
            }
            if seen.insert(dep.clone()) {
                path.push(dep.clone());
                if self.walk_back(dep, target, component, path, seen) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    /// Tarjan's algorithm over the in-graph edges
    fn strongly_connected(&self) -> Vec<BTreeSet<PluginId>> {
        struct Tarjan<'a> {
            resolver: &'a DependencyResolver,
            index: usize,
            indices: BTreeMap<&'a str, usize>,
            lowlink: BTreeMap<&'a str, usize>,
            stack: Vec<&'a str>,
            on_stack: BTreeSet<&'a str>,
            components: Vec<BTreeSet<PluginId>>,
        }

        impl<'a> Tarjan<'a> {
            fn connect(&mut self, id: &'a str) {
                self.indices.insert(id, self.index);
                self.lowlink.insert(id, self.index);
                self.index += 1;
                self.stack.push(id);
                self.on_stack.insert(id);

                let resolver = self.resolver;
                for dep in resolver.edges(id) {
                    let dep = dep.as_str();
                    if !self.indices.contains_key(dep) {
                        self.connect(dep);
                        let low = self.lowlink[id].min(self.lowlink[dep]);
                        self.lowlink.insert(id, low);
                    } else if self.on_stack.contains(dep) {
                        let low = self.lowlink[id].min(self.indices[dep]);
                        self.lowlink.insert(id, low);
                    }
                }

                if self.lowlink[id] == self.indices[id] {
                    let mut component = BTreeSet::new();
                    while let Some(member) = self.stack.pop() {
                        self.on_stack.remove(member);
                        component.insert(member.to_string());
                        if member == id {
                            break;
                        }
                    }
                    self.components.push(component);
                }
            }
        }

        let mut tarjan = Tarjan {
            resolver: self,
            index: 0,
            indices: BTreeMap::new(),
            lowlink: BTreeMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        };
        for id in self.graph.keys() {
            if !tarjan.indices.contains_key(id.as_str()) {
                tarjan.connect(id);
            }
        }
        tarjan.components
    }
}
