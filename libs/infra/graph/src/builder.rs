use std::collections::{BTreeMap, HashMap};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use tracing::{debug, instrument};

use crate::error::{GraphError, GraphResult};
use crate::manifest::{EdgeKind, Manifest};
use crate::resource::{LogicalId, Output, Resource};

/// Single-pass builder accumulating resource declarations.
///
/// Nothing is inferred from declaration order: edges come from explicit
/// [`add_dependency`](Self::add_dependency) calls, `depends_on` sets and
/// references inside properties. [`build`](Self::build) validates the graph
/// and freezes it into a [`Manifest`].
#[derive(Debug)]
pub struct StackBuilder {
    stack_name: String,
    description: Option<String>,
    resources: BTreeMap<LogicalId, Resource>,
    outputs: BTreeMap<String, Output>,
}

impl StackBuilder {
    pub fn new(stack_name: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            description: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn contains(&self, id: &LogicalId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn resource(&self, id: &LogicalId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Declare a resource. Logical ids are unique per stack.
    pub fn add_resource(&mut self, resource: Resource) -> GraphResult<LogicalId> {
        let id = resource.logical_id.clone();
        if self.resources.contains_key(&id) {
            return Err(GraphError::DuplicateResource(id));
        }
        debug!(logical_id = %id, resource_type = %resource.resource_type, "Declared resource");
        self.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Make `dependent` wait for `dependency`. Both must already be declared.
    pub fn add_dependency(
        &mut self,
        dependent: &LogicalId,
        dependency: &LogicalId,
    ) -> GraphResult<()> {
        if dependent == dependency {
            return Err(GraphError::SelfDependency(dependent.clone()));
        }
        if !self.resources.contains_key(dependency) {
            return Err(GraphError::UnknownDependency {
                resource: dependent.clone(),
                dependency: dependency.clone(),
            });
        }
        let resource = self
            .resources
            .get_mut(dependent)
            .ok_or_else(|| GraphError::ResourceNotFound(dependent.clone()))?;
        resource.depends_on.insert(dependency.clone());
        debug!(%dependent, %dependency, "Added explicit dependency");
        Ok(())
    }

    pub fn add_output(&mut self, output: Output) -> GraphResult<()> {
        if self.outputs.contains_key(&output.id) {
            return Err(GraphError::DuplicateOutput(output.id));
        }
        self.outputs.insert(output.id.clone(), output);
        Ok(())
    }

    /// Validate and freeze the declared graph
    #[instrument(skip(self), fields(stack = %self.stack_name, resources = self.resources.len()))]
    pub fn build(self) -> GraphResult<Manifest> {
        let mut graph = StableDiGraph::<LogicalId, EdgeKind>::new();
        let mut node_index_map: HashMap<LogicalId, NodeIndex> = HashMap::new();

        // 1. nodes
        for id in self.resources.keys() {
            let idx = graph.add_node(id.clone());
            node_index_map.insert(id.clone(), idx);
        }

        // 2. edges: dependency -> dependent
        for (id, resource) in &self.resources {
            let target = node_index_map[id];

            for dependency in &resource.depends_on {
                if dependency == id {
                    return Err(GraphError::SelfDependency(id.clone()));
                }
                let source = node_index_map.get(dependency).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        resource: id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.update_edge(*source, target, EdgeKind::Explicit);
            }

            for reference in resource.references() {
                if &reference == id {
                    return Err(GraphError::SelfDependency(id.clone()));
                }
                let source = node_index_map.get(&reference).ok_or_else(|| {
                    GraphError::UnknownReference {
                        owner: id.to_string(),
                        reference: reference.clone(),
                    }
                })?;
                if graph.find_edge(*source, target).is_none() {
                    graph.add_edge(*source, target, EdgeKind::Reference);
                }
            }
        }

        // 3. outputs may only point at declared resources
        for output in self.outputs.values() {
            for reference in crate::intrinsic::references(&output.value) {
                if !node_index_map.contains_key(&reference) {
                    return Err(GraphError::UnknownReference {
                        owner: format!("Output {}", output.id),
                        reference,
                    });
                }
            }
        }

        // 4. DAG check
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::CycleDetected(graph[cycle.node_id()].clone()));
        }

        debug!(edges = graph.edge_count(), "Resource graph validated");

        Ok(Manifest::new(
            self.stack_name,
            self.description,
            self.resources,
            self.outputs,
            graph,
            node_index_map,
        ))
    }
}
