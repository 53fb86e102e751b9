use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde_json::{Map, Value};

use crate::error::{GraphError, GraphResult};
use crate::resource::{LogicalId, Output, RemovalPolicy, Resource};

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Why an edge exists between two resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared through `depends_on` / `add_dependency`
    Explicit,
    /// Implied by a `Ref` or `Fn::GetAtt` in the dependent's properties
    Reference,
}

/// Immutable, validated stack. Edges point from dependency to dependent.
#[derive(Debug)]
pub struct Manifest {
    stack_name: String,
    description: Option<String>,
    resources: BTreeMap<LogicalId, Resource>,
    outputs: BTreeMap<String, Output>,
    graph: StableDiGraph<LogicalId, EdgeKind>,
    node_index_map: HashMap<LogicalId, NodeIndex>,
}

impl Manifest {
    pub(crate) fn new(
        stack_name: String,
        description: Option<String>,
        resources: BTreeMap<LogicalId, Resource>,
        outputs: BTreeMap<String, Output>,
        graph: StableDiGraph<LogicalId, EdgeKind>,
        node_index_map: HashMap<LogicalId, NodeIndex>,
    ) -> Self {
        Self {
            stack_name,
            description,
            resources,
            outputs,
            graph,
            node_index_map,
        }
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn resource(&self, id: &LogicalId) -> GraphResult<&Resource> {
        self.resources
            .get(id)
            .ok_or_else(|| GraphError::ResourceNotFound(id.clone()))
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources_of_type<'a>(&'a self, resource_type: &'a str) -> Vec<&'a Resource> {
        self.resources
            .values()
            .filter(|r| r.resource_type == resource_type)
            .collect()
    }

    pub fn output(&self, id: &str) -> Option<&Output> {
        self.outputs.get(id)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    fn index(&self, id: &LogicalId) -> GraphResult<NodeIndex> {
        self.node_index_map
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::ResourceNotFound(id.clone()))
    }

    fn neighbors(&self, id: &LogicalId, direction: Direction) -> GraphResult<BTreeSet<LogicalId>> {
        let idx = self.index(id)?;
        Ok(self
            .graph
            .neighbors_directed(idx, direction)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect())
    }

    /// Direct dependencies, explicit and referenced
    pub fn dependencies(&self, id: &LogicalId) -> GraphResult<BTreeSet<LogicalId>> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependencies declared through `depends_on` only
    pub fn explicit_dependencies(&self, id: &LogicalId) -> GraphResult<BTreeSet<LogicalId>> {
        Ok(self.resource(id)?.depends_on.clone())
    }

    /// Direct dependents
    pub fn dependents(&self, id: &LogicalId) -> GraphResult<BTreeSet<LogicalId>> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Everything that must exist before `id` can be created
    pub fn transitive_dependencies(&self, id: &LogicalId) -> GraphResult<BTreeSet<LogicalId>> {
        let start = self.index(id)?;
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);

        while let Some(idx) = queue.pop_front() {
            for pred in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if let Some(pred_id) = self.graph.node_weight(pred) {
                    if seen.insert(pred_id.clone()) {
                        queue.push_back(pred);
                    }
                }
            }
        }

        Ok(seen)
    }

    pub fn depends_on(&self, dependent: &LogicalId, dependency: &LogicalId) -> GraphResult<bool> {
        Ok(self.transitive_dependencies(dependent)?.contains(dependency))
    }

    /// Kahn levels. Resources in one wave have no edges between them and can
    /// be provisioned in parallel; each wave waits for the previous one.
    /// Waves are sorted by logical id so output is stable.
    pub fn creation_waves(&self) -> Vec<Vec<LogicalId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph.neighbors_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut current: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| *idx)
            .collect();

        let mut waves = Vec::new();
        while !current.is_empty() {
            let mut next = Vec::new();
            for idx in &current {
                for succ in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&succ) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(succ);
                        }
                    }
                }
            }

            let mut wave: Vec<LogicalId> = current
                .iter()
                .filter_map(|idx| self.graph.node_weight(*idx).cloned())
                .collect();
            wave.sort();
            waves.push(wave);
            current = next;
        }

        waves
    }

    /// Topological creation order (waves flattened)
    pub fn creation_order(&self) -> Vec<LogicalId> {
        self.creation_waves().into_iter().flatten().collect()
    }

    /// Teardown order: dependents go before their dependencies
    pub fn deletion_order(&self) -> Vec<LogicalId> {
        self.creation_waves().into_iter().rev().flatten().collect()
    }

    /// Resources left behind when the stack is torn down
    pub fn retained_on_teardown(&self) -> Vec<&Resource> {
        self.resources
            .values()
            .filter(|r| {
                matches!(
                    r.removal_policy,
                    Some(RemovalPolicy::Retain) | Some(RemovalPolicy::Snapshot)
                )
            })
            .collect()
    }

    /// Render the CloudFormation template
    pub fn to_template(&self) -> Value {
        let mut template = Map::new();
        template.insert(
            "AWSTemplateFormatVersion".into(),
            Value::String(TEMPLATE_FORMAT_VERSION.into()),
        );
        if let Some(description) = &self.description {
            template.insert("Description".into(), Value::String(description.clone()));
        }

        let resources: Map<String, Value> = self
            .resources
            .iter()
            .map(|(id, resource)| (id.to_string(), resource.to_template()))
            .collect();
        template.insert("Resources".into(), Value::Object(resources));

        if !self.outputs.is_empty() {
            let outputs: Map<String, Value> = self
                .outputs
                .iter()
                .map(|(id, output)| (id.clone(), output.to_template()))
                .collect();
            template.insert("Outputs".into(), Value::Object(outputs));
        }

        Value::Object(template)
    }
}
