//! Entity graph - the shared, cross-thread knowledge base
//!
//! The agent edits this graph through tool calls during a turn, and the
//! summarizer folds in entities it extracts from recent messages.
//! It is never scoped to a thread.
//!
//! Invariants held by every mutation:
//! - node ids are unique (map keys)
//! - every relationship targets a node that exists
//! - relationship strength lies in [0, 1]

use crate::store::{self, DocumentStore, ENTITY_MEMORY_KEY};
use crate::{Result, ThreadmindError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Strength used when a relationship is added without one
pub const DEFAULT_STRENGTH: f64 = 0.5;

/// Kind of entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum EntityType {
    Person,
    Place,
    Concept,
    Event,
    Task,
    Other,
}

impl EntityType {
    pub const ALL: [&'static str; 6] = ["person", "place", "concept", "event", "task", "other"];

    /// Strict parse, used when validating tool arguments
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "person" => Some(Self::Person),
            "place" => Some(Self::Place),
            "concept" => Some(Self::Concept),
            "event" => Some(Self::Event),
            "task" => Some(Self::Task),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Lenient conversion: anything unknown becomes `Other`
impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self::parse(&s).unwrap_or(Self::Other)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Person => write!(f, "person"),
            Self::Place => write!(f, "place"),
            Self::Concept => write!(f, "concept"),
            Self::Event => write!(f, "event"),
            Self::Task => write!(f, "task"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A directed, labeled, weighted edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub target_id: String,
    pub relationship: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
}

fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

/// Clamp a strength into [0, 1]. NaN is treated as the default.
pub fn clamp_strength(strength: f64) -> f64 {
    if strength.is_nan() {
        DEFAULT_STRENGTH
    } else {
        strength.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityNode {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl EntityNode {
    pub fn new(
        id: impl Into<String>,
        entity_type: EntityType,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            name: name.into(),
            description: description.into(),
            properties: Map::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    /// Insert or update the `(target, label)` edge. Returns true if it was new.
    fn upsert_relationship(&mut self, target_id: &str, label: &str, strength: f64) -> bool {
        let strength = clamp_strength(strength);
        if let Some(existing) = self
            .relationships
            .iter_mut()
            .find(|r| r.target_id == target_id && r.relationship == label)
        {
            existing.strength = strength;
            false
        } else {
            self.relationships.push(Relationship {
                target_id: target_id.to_string(),
                relationship: label.to_string(),
                strength,
            });
            true
        }
    }
}

/// Partial update for an existing node. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub entity_type: Option<EntityType>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: Option<Map<String, Value>>,
}

impl EntityPatch {
    fn apply_to(self, node: &mut EntityNode) {
        if let Some(entity_type) = self.entity_type {
            node.entity_type = entity_type;
        }
        if let Some(name) = self.name.filter(|n| !n.trim().is_empty()) {
            node.name = name;
        }
        if let Some(description) = self.description.filter(|d| !d.trim().is_empty()) {
            node.description = description;
        }
        if let Some(properties) = self.properties {
            for (key, value) in properties {
                node.properties.insert(key, value);
            }
        }
    }
}

/// Outcome of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

/// Counts reported by a bulk merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub merged: usize,
    pub pruned_edges: usize,
}

/// The shared entity graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityGraph {
    #[serde(default)]
    pub nodes: BTreeMap<String, EntityNode>,
    pub last_updated: DateTime<Utc>,
}

impl Default for EntityGraph {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the graph from the store, or start empty
    pub async fn load(store: &dyn DocumentStore) -> Result<Self> {
        match store::read_json::<Self>(store, ENTITY_MEMORY_KEY).await? {
            Some(graph) => {
                info!("Loaded entity graph with {} nodes", graph.nodes.len());
                Ok(graph)
            }
            None => Ok(Self::new()),
        }
    }

    /// Persist the whole graph
    pub async fn save(&self, store: &dyn DocumentStore) -> Result<()> {
        store::write_json(store, ENTITY_MEMORY_KEY, self).await?;
        debug!("Saved entity graph ({} nodes)", self.nodes.len());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&EntityNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Upsert a node. Existing nodes keep their relationships; name and
    /// description are only overwritten when non-empty, properties merge.
    pub fn create_or_update(&mut self, node: EntityNode) -> Upsert {
        let outcome = match self.nodes.get_mut(&node.id) {
            Some(existing) => {
                EntityPatch {
                    entity_type: Some(node.entity_type),
                    name: Some(node.name),
                    description: Some(node.description),
                    properties: Some(node.properties),
                }
                .apply_to(existing);
                Upsert::Updated
            }
            None => {
                let node = EntityNode {
                    relationships: Vec::new(),
                    ..node
                };
                self.nodes.insert(node.id.clone(), node);
                Upsert::Created
            }
        };
        self.touch();
        outcome
    }

    /// Merge supplied fields into an existing node
    pub fn update(&mut self, id: &str, patch: EntityPatch) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ThreadmindError::EntityNotFound(id.to_string()))?;
        patch.apply_to(node);
        self.touch();
        Ok(())
    }

    /// Remove a node and every edge pointing at it. Returns the number of
    /// edges removed from other nodes.
    pub fn delete(&mut self, id: &str) -> Result<usize> {
        if self.nodes.remove(id).is_none() {
            return Err(ThreadmindError::EntityNotFound(id.to_string()));
        }

        let mut removed = 0;
        for node in self.nodes.values_mut() {
            let before = node.relationships.len();
            node.relationships.retain(|r| r.target_id != id);
            removed += before - node.relationships.len();
        }
        self.touch();
        Ok(removed)
    }

    /// Add an edge, or update the strength of the existing `(target, label)`
    /// edge. Returns true if a new edge was created.
    pub fn add_relationship(
        &mut self,
        source_id: &str,
        target_id: &str,
        label: &str,
        strength: Option<f64>,
    ) -> Result<bool> {
        if !self.nodes.contains_key(source_id) {
            return Err(ThreadmindError::EntityNotFound(source_id.to_string()));
        }
        if !self.nodes.contains_key(target_id) {
            return Err(ThreadmindError::EntityNotFound(target_id.to_string()));
        }

        let strength = strength.unwrap_or(DEFAULT_STRENGTH);
        let created = match self.nodes.get_mut(source_id) {
            Some(source) => source.upsert_relationship(target_id, label, strength),
            None => return Err(ThreadmindError::EntityNotFound(source_id.to_string())),
        };
        self.touch();
        Ok(created)
    }

    /// Remove a matching edge. Returns false when there was nothing to remove.
    pub fn remove_relationship(&mut self, source_id: &str, target_id: &str, label: &str) -> bool {
        let Some(source) = self.nodes.get_mut(source_id) else {
            return false;
        };
        let before = source.relationships.len();
        source
            .relationships
            .retain(|r| !(r.target_id == target_id && r.relationship == label));
        let removed = source.relationships.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Fold a batch of proposed nodes into the graph.
    ///
    /// Unknown ids are inserted. Known ids are merged field by field (same
    /// rules as `create_or_update`), except that a proposed `other` type never
    /// replaces a specific one. Proposed relationships are upserted by
    /// `(target, label)` in both cases. Edges whose target does not exist once
    /// the batch is applied are pruned.
    pub fn merge_nodes(&mut self, proposed: Vec<EntityNode>) -> MergeReport {
        let mut report = MergeReport::default();

        for mut node in proposed {
            if node.id.trim().is_empty() {
                continue;
            }
            let relationships = std::mem::take(&mut node.relationships);
            let target = match self.nodes.entry(node.id.clone()) {
                Entry::Occupied(entry) => {
                    let existing = entry.into_mut();
                    // `Other` may stand for a type name that failed to parse
                    let entity_type = Some(node.entity_type).filter(|t| {
                        *t != EntityType::Other || existing.entity_type == EntityType::Other
                    });
                    EntityPatch {
                        entity_type,
                        name: Some(node.name),
                        description: Some(node.description),
                        properties: Some(node.properties),
                    }
                    .apply_to(existing);
                    report.merged += 1;
                    existing
                }
                Entry::Vacant(entry) => {
                    report.added += 1;
                    entry.insert(node)
                }
            };
            for rel in relationships {
                target.upsert_relationship(&rel.target_id, &rel.relationship, rel.strength);
            }
        }

        report.pruned_edges = self.prune_dangling();
        if report.added + report.merged > 0 {
            self.touch();
        }
        report
    }

    /// Drop every edge whose target is missing
    fn prune_dangling(&mut self) -> usize {
        let ids: std::collections::HashSet<String> = self.nodes.keys().cloned().collect();
        let mut pruned = 0;
        for node in self.nodes.values_mut() {
            let before = node.relationships.len();
            node.relationships.retain(|r| ids.contains(&r.target_id));
            pruned += before - node.relationships.len();
        }
        pruned
    }

    /// Compact `id | name | type` listing for the system prompt
    pub fn index_string(&self) -> String {
        self.nodes
            .values()
            .map(|n| format!("- {} | {} | {}", n.id, n.name, n.entity_type))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full node list as pretty JSON, for the summarizer prompt
    pub fn to_prompt_json(&self) -> String {
        let nodes: Vec<&EntityNode> = self.nodes.values().collect();
        serde_json::to_string_pretty(&nodes).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn person(id: &str, name: &str) -> EntityNode {
        EntityNode::new(id, EntityType::Person, name, "")
    }

    #[test]
    fn test_repeated_create_keeps_one_node() {
        let mut graph = EntityGraph::new();
        assert_eq!(graph.create_or_update(person("x", "X")), Upsert::Created);
        assert_eq!(graph.create_or_update(person("x", "X2")), Upsert::Updated);
        assert_eq!(graph.create_or_update(person("x", "")), Upsert::Updated);

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get("x").unwrap().name, "X2");
    }

    #[test]
    fn test_upsert_merges_properties_and_keeps_edges() {
        let mut graph = EntityGraph::new();
        let mut props = Map::new();
        props.insert("age".into(), json!(30));
        graph.create_or_update(person("a", "Alice").with_properties(props));
        graph.create_or_update(person("b", "Bob"));
        graph.add_relationship("a", "b", "knows", None).unwrap();

        let mut more = Map::new();
        more.insert("city".into(), json!("SF"));
        graph.create_or_update(
            EntityNode::new("a", EntityType::Person, "", "a friend").with_properties(more),
        );

        let alice = graph.get("a").unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.description, "a friend");
        assert_eq!(alice.properties.get("age"), Some(&json!(30)));
        assert_eq!(alice.properties.get("city"), Some(&json!("SF")));
        assert_eq!(alice.relationships.len(), 1);
    }

    #[test]
    fn test_update_missing_entity() {
        let mut graph = EntityGraph::new();
        let err = graph.update("ghost", EntityPatch::default()).unwrap_err();
        assert!(matches!(err, ThreadmindError::EntityNotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_delete_cascades_edges() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(person("a", "A"));
        graph.create_or_update(person("b", "B"));
        graph.create_or_update(person("c", "C"));
        graph.add_relationship("a", "c", "knows", None).unwrap();
        graph.add_relationship("b", "c", "likes", None).unwrap();
        graph.add_relationship("a", "b", "knows", None).unwrap();

        assert_eq!(graph.delete("c").unwrap(), 2);
        assert!(!graph.contains("c"));
        for node in graph.nodes.values() {
            assert!(node.relationships.iter().all(|r| r.target_id != "c"));
        }
        assert_eq!(graph.get("a").unwrap().relationships.len(), 1);

        assert!(matches!(
            graph.delete("c"),
            Err(ThreadmindError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_relationship_upsert_updates_strength() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(person("a", "A"));
        graph.create_or_update(person("b", "B"));

        assert!(graph.add_relationship("a", "b", "knows", None).unwrap());
        assert!(!graph.add_relationship("a", "b", "knows", Some(0.9)).unwrap());

        let edges = &graph.get("a").unwrap().relationships;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].strength, 0.9);
    }

    #[test]
    fn test_strength_is_clamped() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(person("a", "A"));
        graph.create_or_update(person("b", "B"));

        graph.add_relationship("a", "b", "high", Some(5.0)).unwrap();
        graph.add_relationship("a", "b", "low", Some(-2.0)).unwrap();

        let edges = &graph.get("a").unwrap().relationships;
        assert_eq!(edges[0].strength, 1.0);
        assert_eq!(edges[1].strength, 0.0);
    }

    #[test]
    fn test_add_relationship_names_missing_target() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(EntityNode::new(
            "person-alice",
            EntityType::Person,
            "Alice",
            "friend",
        ));
        let before = graph.get("person-alice").cloned();

        let err = graph
            .add_relationship("person-alice", "place-sf", "lives_in", None)
            .unwrap_err();
        assert!(matches!(err, ThreadmindError::EntityNotFound(ref id) if id == "place-sf"));
        assert_eq!(graph.get("person-alice").cloned(), before);
    }

    #[test]
    fn test_remove_relationship_reports_absence() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(person("a", "A"));
        graph.create_or_update(person("b", "B"));
        graph.add_relationship("a", "b", "knows", None).unwrap();

        assert!(graph.remove_relationship("a", "b", "knows"));
        assert!(!graph.remove_relationship("a", "b", "knows"));
        assert!(!graph.remove_relationship("nobody", "b", "knows"));
    }

    #[test]
    fn test_merge_nodes_keeps_existing_properties() {
        let mut graph = EntityGraph::new();
        let mut props = Map::new();
        props.insert("phone".into(), json!("555"));
        graph.create_or_update(person("a", "Alice").with_properties(props));

        let mut restated = person("a", "Alice Smith");
        restated.relationships.push(Relationship {
            target_id: "b".into(),
            relationship: "knows".into(),
            strength: 3.0,
        });
        let report = graph.merge_nodes(vec![restated, person("b", "Bob")]);

        assert_eq!(report.added, 1);
        assert_eq!(report.merged, 1);
        let alice = graph.get("a").unwrap();
        assert_eq!(alice.name, "Alice Smith");
        assert_eq!(alice.properties.get("phone"), Some(&json!("555")));
        assert_eq!(alice.relationships[0].strength, 1.0);
    }

    #[test]
    fn test_merge_new_node_collapses_duplicate_edges() {
        let mut graph = EntityGraph::new();
        let mut node = person("a", "A");
        for strength in [0.2, 0.8] {
            node.relationships.push(Relationship {
                target_id: "b".into(),
                relationship: "knows".into(),
                strength,
            });
        }
        graph.merge_nodes(vec![node, person("b", "B")]);

        let edges = &graph.get("a").unwrap().relationships;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].strength, 0.8);
    }

    #[test]
    fn test_merge_keeps_known_type_over_unparsed_one() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(person("person-alice", "Alice"));

        let proposed: Vec<EntityNode> = serde_json::from_value(json!([
            {"id": "person-alice", "type": "human", "name": "Alice"}
        ]))
        .unwrap();
        graph.merge_nodes(proposed);
        assert_eq!(graph.get("person-alice").unwrap().entity_type, EntityType::Person);

        let retyped = EntityNode::new("person-alice", EntityType::Concept, "Alice", "");
        graph.merge_nodes(vec![retyped]);
        assert_eq!(graph.get("person-alice").unwrap().entity_type, EntityType::Concept);
    }

    #[test]
    fn test_merge_nodes_prunes_dangling_edges() {
        let mut graph = EntityGraph::new();
        let mut node = person("a", "A");
        node.relationships.push(Relationship {
            target_id: "missing".into(),
            relationship: "knows".into(),
            strength: 0.5,
        });
        let report = graph.merge_nodes(vec![node]);
        assert_eq!(report.pruned_edges, 1);
        assert!(graph.get("a").unwrap().relationships.is_empty());
    }

    #[test]
    fn test_entity_type_lenient_deserialize() {
        let node: EntityNode = serde_json::from_value(json!({
            "id": "x", "type": "animal", "name": "Rex"
        }))
        .unwrap();
        assert_eq!(node.entity_type, EntityType::Other);
        assert_eq!(EntityType::parse("Person"), Some(EntityType::Person));
        assert_eq!(EntityType::parse("animal"), None);
    }

    #[test]
    fn test_index_string() {
        let mut graph = EntityGraph::new();
        graph.create_or_update(person("person-alice", "Alice"));
        assert_eq!(graph.index_string(), "- person-alice | Alice | person");
    }
}
