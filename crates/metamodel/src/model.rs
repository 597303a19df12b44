//! Compiled metamodel.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;

use itertools::Itertools;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use drover_core::{Error, Phase, Result, TypeId};
use drover_objectbase::Scheme;

use crate::spec::MetaModelSpec;

/// An internal type with its ordered phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalType {
    name: String,
    phases: Vec<Phase>,
}

impl InternalType {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

/// An external type bound to its triggering element type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalType {
    name: String,
    trigger: TypeId,
    foreign_controlled: bool,
}

impl ExternalType {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn trigger(&self) -> &TypeId {
        &self.trigger
    }

    #[must_use]
    pub const fn is_foreign_controlled(&self) -> bool {
        self.foreign_controlled
    }
}

/// One phase of one internal type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementType {
    id: TypeId,
    dependencies: Vec<TypeId>,
    triggered_by: Vec<String>,
}

impl ElementType {
    #[must_use]
    pub const fn id(&self) -> &TypeId {
        &self.id
    }

    /// Element types this one consumes, in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> &[TypeId] {
        &self.dependencies
    }

    /// External types triggering this element type, sorted.
    #[must_use]
    pub fn triggered_by(&self) -> &[String] {
        &self.triggered_by
    }
}

/// Validated, immutable type dependency graph.
///
/// Edges point from an element type to the element types it depends on.
#[derive(Debug, Clone)]
pub struct MetaModel {
    name: String,
    namespace_type: String,
    update_request_type: Option<String>,
    internal: BTreeMap<String, InternalType>,
    external: BTreeMap<String, ExternalType>,
    element_types: BTreeMap<TypeId, ElementType>,
    graph: DiGraph<TypeId, ()>,
    node_map: HashMap<TypeId, NodeIndex>,
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::invalid_metamodel(reason)
}

impl MetaModel {
    /// Validate a specification against the object scheme and compile it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetaModel` naming the first violated rule.
    pub fn new(name: impl Into<String>, spec: &MetaModelSpec, scheme: &Scheme) -> Result<Self> {
        let name = name.into();
        let registered = |kind: &str, role: &str| {
            if scheme.knows(kind) {
                Ok(())
            } else {
                Err(invalid(format!("{role} type '{kind}' has no object encoding")))
            }
        };

        if spec.namespace_type.is_empty() {
            return Err(invalid("namespace type missing"));
        }
        registered(&spec.namespace_type, "namespace")?;
        if let Some(kind) = &spec.update_request_type {
            registered(kind, "update request")?;
        }

        let mut internal = BTreeMap::new();
        let mut element_types = BTreeMap::new();
        for def in &spec.internal_types {
            registered(&def.name, "internal")?;
            if def.phases.is_empty() {
                return Err(invalid(format!("internal type '{}' has no phases", def.name)));
            }
            let mut phases = Vec::with_capacity(def.phases.len());
            for phase in &def.phases {
                if phases.contains(&phase.name) {
                    return Err(invalid(format!(
                        "phase '{}' declared twice for internal type '{}'",
                        phase.name, def.name
                    )));
                }
                phases.push(phase.name.clone());
                let id = TypeId::new(def.name.clone(), phase.name.clone());
                element_types.insert(
                    id.clone(),
                    ElementType {
                        id,
                        dependencies: phase.dependencies.clone(),
                        triggered_by: Vec::new(),
                    },
                );
            }
            let previous = internal.insert(
                def.name.clone(),
                InternalType {
                    name: def.name.clone(),
                    phases,
                },
            );
            if previous.is_some() {
                return Err(invalid(format!("internal type '{}' declared twice", def.name)));
            }
        }

        let mut external = BTreeMap::new();
        for def in &spec.external_types {
            registered(&def.name, "external")?;
            if internal.contains_key(&def.name) {
                return Err(invalid(format!(
                    "type '{}' is declared internal and external",
                    def.name
                )));
            }
            let element = element_types.get_mut(&def.trigger).ok_or_else(|| {
                invalid(format!(
                    "external type '{}' triggers undeclared element type '{}'",
                    def.name, def.trigger
                ))
            })?;
            element.triggered_by.push(def.name.clone());
            let previous = external.insert(
                def.name.clone(),
                ExternalType {
                    name: def.name.clone(),
                    trigger: def.trigger.clone(),
                    foreign_controlled: def.foreign_controlled,
                },
            );
            if previous.is_some() {
                return Err(invalid(format!("external type '{}' declared twice", def.name)));
            }
        }

        for kind in internal.keys() {
            let triggered = element_types
                .values()
                .any(|e| e.id.kind() == kind.as_str() && !e.triggered_by.is_empty());
            if !triggered {
                return Err(invalid(format!(
                    "internal type '{kind}' is not triggered by any external type"
                )));
            }
        }
        for element in element_types.values_mut() {
            element.triggered_by.sort();
        }

        let mut graph = DiGraph::new();
        let node_map: HashMap<TypeId, NodeIndex> = element_types
            .keys()
            .map(|id| (id.clone(), graph.add_node(id.clone())))
            .collect();
        for element in element_types.values() {
            let from = node_map
                .get(&element.id)
                .copied()
                .ok_or_else(|| invalid(format!("element type '{}' not indexed", element.id)))?;
            for dependency in &element.dependencies {
                let to = node_map.get(dependency).copied().ok_or_else(|| {
                    invalid(format!(
                        "element type '{}' depends on undeclared element type '{dependency}'",
                        element.id
                    ))
                })?;
                graph.update_edge(from, to, ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            let at = graph
                .node_weight(cycle.node_id())
                .map_or_else(String::new, ToString::to_string);
            return Err(invalid(format!("dependency cycle through element type '{at}'")));
        }

        debug!(
            metamodel = %name,
            internal_types = internal.len(),
            external_types = external.len(),
            element_types = element_types.len(),
            "Metamodel compiled"
        );

        Ok(Self {
            name,
            namespace_type: spec.namespace_type.clone(),
            update_request_type: spec.update_request_type.clone(),
            internal,
            external,
            element_types,
            graph,
            node_map,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn namespace_type(&self) -> &str {
        &self.namespace_type
    }

    #[must_use]
    pub fn update_request_type(&self) -> Option<&str> {
        self.update_request_type.as_deref()
    }

    /// Phases of an internal type in processing order.
    #[must_use]
    pub fn phases(&self, kind: &str) -> Option<&[Phase]> {
        self.internal.get(kind).map(InternalType::phases)
    }

    #[must_use]
    pub fn internal_type(&self, kind: &str) -> Option<&InternalType> {
        self.internal.get(kind)
    }

    #[must_use]
    pub fn external_type(&self, kind: &str) -> Option<&ExternalType> {
        self.external.get(kind)
    }

    #[must_use]
    pub fn element_type(&self, id: &TypeId) -> Option<&ElementType> {
        self.element_types.get(id)
    }

    /// All element types, sorted by id.
    pub fn element_types(&self) -> impl Iterator<Item = &ElementType> {
        self.element_types.values()
    }

    /// Whether `from` directly depends on `to`.
    #[must_use]
    pub fn has_dependency(&self, from: &TypeId, to: &TypeId) -> bool {
        match (self.node_map.get(from), self.node_map.get(to)) {
            (Some(&from), Some(&to)) => self.graph.contains_edge(from, to),
            _ => false,
        }
    }

    /// Phases of the same internal type that transitively depend on the given
    /// phase, in declaration order.
    #[must_use]
    pub fn dependent_type_phases(&self, id: &TypeId) -> Vec<Phase> {
        let Some(&start) = self.node_map.get(id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut todo = VecDeque::from([start]);
        while let Some(node) = todo.pop_front() {
            for dependent in self.graph.neighbors_directed(node, Direction::Incoming) {
                let Some(dependent_id) = self.graph.node_weight(dependent) else {
                    continue;
                };
                if dependent_id.kind() == id.kind() && seen.insert(dependent_id.phase().clone()) {
                    todo.push_back(dependent);
                }
            }
        }
        self.phases(id.kind())
            .map(|phases| {
                phases
                    .iter()
                    .filter(|phase| seen.contains(*phase))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The element type an external type triggers.
    #[must_use]
    pub fn trigger_for(&self, external: &str) -> Option<&TypeId> {
        self.external.get(external).map(ExternalType::trigger)
    }

    /// External types triggering an element type.
    #[must_use]
    pub fn triggered_by(&self, id: &TypeId) -> &[String] {
        self.element_types
            .get(id)
            .map(ElementType::triggered_by)
            .unwrap_or_default()
    }

    /// External types whose objects feed the given internal type.
    #[must_use]
    pub fn external_types_for(&self, kind: &str) -> Vec<&ExternalType> {
        self.external
            .values()
            .filter(|e| e.trigger.kind() == kind)
            .collect()
    }

    #[must_use]
    pub fn is_external(&self, kind: &str) -> bool {
        self.external.contains_key(kind)
    }

    #[must_use]
    pub fn is_internal(&self, kind: &str) -> bool {
        self.internal.contains_key(kind)
    }

    /// External type names, sorted.
    pub fn external_types(&self) -> impl Iterator<Item = &str> {
        self.external.keys().map(String::as_str)
    }

    /// Internal type names, sorted.
    pub fn internal_types(&self) -> impl Iterator<Item = &str> {
        self.internal.keys().map(String::as_str)
    }

    /// Deterministic textual description of the type graph.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "metamodel {}", self.name);
        let _ = writeln!(out, "  namespace type: {}", self.namespace_type);
        if let Some(kind) = &self.update_request_type {
            let _ = writeln!(out, "  update request type: {kind}");
        }
        let _ = writeln!(out, "  external types:");
        for external in self.external.values() {
            let marker = if external.foreign_controlled {
                " (foreign controlled)"
            } else {
                ""
            };
            let _ = writeln!(out, "    {} -> {}{marker}", external.name, external.trigger);
        }
        let _ = writeln!(out, "  internal types:");
        for internal in self.internal.values() {
            let _ = writeln!(out, "    {}", internal.name);
            for phase in &internal.phases {
                let _ = writeln!(out, "      {phase}");
                let id = TypeId::new(internal.name.clone(), phase.clone());
                let Some(element) = self.element_types.get(&id) else {
                    continue;
                };
                if !element.triggered_by.is_empty() {
                    let _ = writeln!(
                        out,
                        "        triggered by: {}",
                        element.triggered_by.iter().join(", ")
                    );
                }
                if !element.dependencies.is_empty() {
                    let _ = writeln!(
                        out,
                        "        depends on: {}",
                        element.dependencies.iter().join(", ")
                    );
                }
            }
        }
        out
    }
}
