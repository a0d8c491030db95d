//! Graph construction and ordering.
//!
//! The builder collects resource declarations, turns references into edges,
//! and rejects duplicate identities, dangling references and cycles before
//! anything else in a run happens.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::StackConfig;
use crate::error::{GraphError, Result};

use super::resource::{Resource, ResourceId};

/// Collects resource declarations into a [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Declarations in the order they were added.
    resources: Vec<Resource>,
}

/// An immutable, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    /// Resources keyed by identity.
    resources: HashMap<ResourceId, Resource>,
    /// Identities in dependency order.
    order: Vec<ResourceId>,
    /// Direct dependencies of each resource.
    dependencies: HashMap<ResourceId, BTreeSet<ResourceId>>,
    /// Direct dependents of each resource.
    dependents: HashMap<ResourceId, BTreeSet<ResourceId>>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Creates a builder holding every resource declared in a stack.
    #[must_use]
    pub fn from_config(config: &StackConfig) -> Self {
        let mut builder = Self::new();
        for resource in &config.resources {
            builder.add(resource.to_resource());
        }
        builder
    }

    /// Adds a declaration.
    pub fn add(&mut self, resource: Resource) -> &mut Self {
        self.resources.push(resource);
        self
    }

    /// Adds a declaration, builder style.
    #[must_use]
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] on duplicate identities, references to
    /// undeclared resources, or dependency cycles.
    pub fn build(self) -> Result<ResourceGraph> {
        let mut position: HashMap<ResourceId, usize> = HashMap::new();
        for (idx, resource) in self.resources.iter().enumerate() {
            if position.insert(resource.id.clone(), idx).is_some() {
                return Err(GraphError::DuplicateIdentity {
                    identity: resource.id.to_string(),
                }
                .into());
            }
        }

        let mut dependencies: HashMap<ResourceId, BTreeSet<ResourceId>> = HashMap::new();
        let mut dependents: HashMap<ResourceId, BTreeSet<ResourceId>> = HashMap::new();

        for resource in &self.resources {
            let deps = resource.dependencies();
            for dep in &deps {
                if !position.contains_key(dep) {
                    return Err(GraphError::UnknownReference {
                        from: resource.id.to_string(),
                        to: dep.to_string(),
                    }
                    .into());
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(resource.id.clone());
            }
            dependencies.insert(resource.id.clone(), deps);
        }

        let order = topological_order(&self.resources, &position, &dependencies, &dependents)?;

        debug!("Built resource graph with {} resources", order.len());

        let resources = self
            .resources
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        Ok(ResourceGraph {
            resources,
            order,
            dependencies,
            dependents,
        })
    }
}

/// Kahn's algorithm; ties are broken by declaration order.
fn topological_order(
    resources: &[Resource],
    position: &HashMap<ResourceId, usize>,
    dependencies: &HashMap<ResourceId, BTreeSet<ResourceId>>,
    dependents: &HashMap<ResourceId, BTreeSet<ResourceId>>,
) -> Result<Vec<ResourceId>> {
    let mut in_degree: Vec<usize> = resources
        .iter()
        .map(|r| dependencies.get(&r.id).map_or(0, BTreeSet::len))
        .collect();

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut order = Vec::with_capacity(resources.len());

    while let Some(idx) = ready.pop_first() {
        let id = &resources[idx].id;
        order.push(id.clone());

        for dependent in dependents.get(id).into_iter().flatten() {
            let dep_idx = position[dependent];
            in_degree[dep_idx] -= 1;
            if in_degree[dep_idx] == 0 {
                ready.insert(dep_idx);
            }
        }
    }

    if order.len() == resources.len() {
        return Ok(order);
    }

    let remaining: BTreeMap<usize, &ResourceId> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree > 0)
        .map(|(idx, _)| (idx, &resources[idx].id))
        .collect();

    Err(GraphError::Cycle {
        cycle: describe_cycle(&remaining, dependencies),
    }
    .into())
}

/// Walks dependencies among the unsorted nodes until one repeats.
///
/// Every unsorted node has at least one unsorted dependency, so the walk
/// always closes a loop.
fn describe_cycle(
    remaining: &BTreeMap<usize, &ResourceId>,
    dependencies: &HashMap<ResourceId, BTreeSet<ResourceId>>,
) -> String {
    let unsorted: BTreeSet<&ResourceId> = remaining.values().copied().collect();
    let Some(start) = unsorted.iter().next().copied() else {
        return String::from("<unknown>");
    };

    let mut path: Vec<&ResourceId> = vec![start];
    let mut current = start;

    loop {
        let next = dependencies
            .get(current)
            .and_then(|deps| deps.iter().find(|d| unsorted.contains(d)));

        let Some(next) = next else {
            break;
        };

        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return cycle.join(" -> ");
        }

        path.push(next);
        current = next;
    }

    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl ResourceGraph {
    /// Returns the resource with the given identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Returns true if the graph declares `id`.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph declares no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Identities in dependency order: every resource follows its dependencies.
    #[must_use]
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Iterates over resources in dependency order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(|id| self.resources.get(id))
    }

    /// Direct dependencies of `id`.
    #[must_use]
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.dependencies
            .get(id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.dependents
            .get(id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Every resource that depends on `id`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalldyllError;
    use crate::graph::Reference;
    use serde_json::json;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("thing", name)
    }

    fn node(name: &str, deps: &[&str]) -> Resource {
        deps.iter().fold(Resource::new("thing", name), |r, dep| {
            r.with_property(format!("from_{dep}"), Reference::new(id(dep), "id"))
        })
    }

    #[test]
    fn test_orders_dependencies_first() {
        let graph = GraphBuilder::new()
            .resource(node("app", &["db", "net"]))
            .resource(node("db", &["net"]))
            .resource(node("net", &[]))
            .build()
            .expect("acyclic graph");

        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(order, vec!["net", "db", "app"]);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let graph = GraphBuilder::new()
            .resource(node("b", &[]))
            .resource(node("a", &[]))
            .resource(node("c", &[]))
            .build()
            .expect("graph");

        let order: Vec<&str> = graph.iter().map(|r| r.id.name.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_three_node_cycle() {
        let err = GraphBuilder::new()
            .resource(node("a", &["c"]))
            .resource(node("b", &["a"]))
            .resource(node("c", &["b"]))
            .build()
            .expect_err("cycle must be rejected");

        let HalldyllError::Graph(GraphError::Cycle { cycle }) = err else {
            unreachable!("expected a cycle error");
        };
        assert!(cycle.contains("thing.a"));
        assert!(cycle.contains("thing.b"));
        assert!(cycle.contains("thing.c"));
        assert_eq!(cycle.matches("->").count(), 3);
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = GraphBuilder::new()
            .resource(node("a", &["a"]))
            .build()
            .expect_err("self reference");
        assert!(matches!(err, HalldyllError::Graph(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_duplicate_identity() {
        let err = GraphBuilder::new()
            .resource(Resource::new("bucket", "logs"))
            .resource(Resource::new("bucket", "logs").with_property("acl", json!("private")))
            .build()
            .expect_err("duplicate");
        assert!(matches!(
            err,
            HalldyllError::Graph(GraphError::DuplicateIdentity { .. })
        ));
    }

    #[test]
    fn test_same_name_different_type_is_fine() {
        let graph = GraphBuilder::new()
            .resource(Resource::new("bucket", "logs"))
            .resource(Resource::new("policy", "logs"))
            .build()
            .expect("distinct identities");
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_unknown_reference() {
        let err = GraphBuilder::new()
            .resource(node("a", &["ghost"]))
            .build()
            .expect_err("dangling reference");
        assert!(matches!(
            err,
            HalldyllError::Graph(GraphError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_explicit_depends_on() {
        let graph = GraphBuilder::new()
            .resource(Resource::new("thing", "late").with_dependency(id("early")))
            .resource(Resource::new("thing", "early"))
            .build()
            .expect("graph");

        assert_eq!(graph.topological_order()[0], id("early"));
        assert_eq!(graph.dependents_of(&id("early")), vec![&id("late")]);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = GraphBuilder::new()
            .resource(node("a", &[]))
            .resource(node("b", &["a"]))
            .resource(node("c", &["b"]))
            .resource(node("d", &[]))
            .build()
            .expect("graph");

        let deps = graph.transitive_dependents(&id("a"));
        assert!(deps.contains(&id("b")));
        assert!(deps.contains(&id("c")));
        assert!(!deps.contains(&id("d")));
    }
}
