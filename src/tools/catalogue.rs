//! Entity tool catalogue: names, JSON schemas, and typed arguments

use crate::llm::ToolDefinition;
use crate::memory::EntityType;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub const CREATE_ENTITY: &str = "create_entity";
pub const UPDATE_ENTITY: &str = "update_entity";
pub const DELETE_ENTITY: &str = "delete_entity";
pub const ADD_RELATIONSHIP: &str = "add_relationship";
pub const REMOVE_RELATIONSHIP: &str = "remove_relationship";

#[derive(Debug, Deserialize)]
pub struct CreateEntityArgs {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntityArgs {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteEntityArgs {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRelationshipArgs {
    pub source_id: String,
    pub target_id: String,
    pub relationship: String,
    #[serde(default)]
    pub strength: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRelationshipArgs {
    pub source_id: String,
    pub target_id: String,
    pub relationship: String,
}

/// The fixed set of tools offered to the model every turn
pub fn entity_tools() -> Vec<ToolDefinition> {
    let properties_schema = json!({
        "type": "object",
        "description": "Free-form key/value facts about the entity",
        "additionalProperties": true
    });

    vec![
        ToolDefinition {
            name: CREATE_ENTITY.to_string(),
            description: "Create an entity in long-term memory, or update it if the id already exists. \
                Use stable ids like 'person-alice' or 'place-paris'."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Unique id, e.g. person-alice"},
                    "type": {"type": "string", "enum": EntityType::ALL},
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "properties": properties_schema
                },
                "required": ["id", "type", "name", "description"]
            }),
        },
        ToolDefinition {
            name: UPDATE_ENTITY.to_string(),
            description: "Update fields of an existing entity. Only supplied fields change; \
                properties are merged."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "properties": properties_schema
                },
                "required": ["id"]
            }),
        },
        ToolDefinition {
            name: DELETE_ENTITY.to_string(),
            description: "Delete an entity and every relationship pointing to it.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"}
                },
                "required": ["id"]
            }),
        },
        ToolDefinition {
            name: ADD_RELATIONSHIP.to_string(),
            description: "Add a directed relationship between two existing entities, or update \
                its strength if it already exists."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "sourceId": {"type": "string"},
                    "targetId": {"type": "string"},
                    "relationship": {"type": "string", "description": "Label, e.g. lives_in, works_with"},
                    "strength": {"type": "number", "minimum": 0, "maximum": 1, "default": 0.5}
                },
                "required": ["sourceId", "targetId", "relationship"]
            }),
        },
        ToolDefinition {
            name: REMOVE_RELATIONSHIP.to_string(),
            description: "Remove a relationship between two entities.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "sourceId": {"type": "string"},
                    "targetId": {"type": "string"},
                    "relationship": {"type": "string"}
                },
                "required": ["sourceId", "targetId", "relationship"]
            }),
        },
    ]
}
