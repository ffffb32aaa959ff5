//! Tool execution bridge.
//!
//! Every entity tool call the model issues goes through [`execute`]. The
//! outcome, success or failure, comes back as a short status line that is
//! fed to the model as the tool result. Nothing here returns an error to the
//! caller, so one bad call cannot abort a turn.

mod catalogue;

pub use catalogue::{
    entity_tools, ADD_RELATIONSHIP, CREATE_ENTITY, DELETE_ENTITY, REMOVE_RELATIONSHIP,
    UPDATE_ENTITY,
};

use crate::llm::ToolCall;
use crate::memory::{EntityGraph, EntityNode, EntityPatch, EntityType, Upsert};
use crate::{Result, ThreadmindError};
use catalogue::{
    AddRelationshipArgs, CreateEntityArgs, DeleteEntityArgs, RemoveRelationshipArgs,
    UpdateEntityArgs,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Result of one tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub output: String,
    pub success: bool,
}

/// Normalize a raw argument payload into a JSON object.
///
/// Providers deliver arguments either as an object or as a JSON-encoded
/// string. `null` and blank strings mean "no arguments".
pub fn normalize_arguments(raw: &Value) -> Result<Map<String, Value>> {
    match raw {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ThreadmindError::ParseFailure(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(ThreadmindError::ParseFailure(format!(
                "arguments are not valid JSON: {}",
                e
            ))),
        },
        other => Err(ThreadmindError::ParseFailure(format!(
            "expected a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validate normalized arguments against a tool's typed schema
fn parse_args<T: DeserializeOwned>(tool: &str, raw: &Value) -> Result<T> {
    let map = normalize_arguments(raw)?;
    serde_json::from_value(Value::Object(map))
        .map_err(|e| ThreadmindError::ParseFailure(format!("{}: {}", tool, e)))
}

fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ThreadmindError::ParseFailure(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Execute one tool call against the graph
pub fn execute(graph: &mut EntityGraph, call: &ToolCall) -> ToolOutcome {
    let result = dispatch(graph, call);
    let (output, success) = match result {
        Ok(output) => (output, true),
        Err(e) => {
            warn!("Tool {} failed: {}", call.name, e);
            (format!("Error: {}", e), false)
        }
    };
    info!("Tool {} -> {}", call.name, output);
    ToolOutcome {
        tool_call_id: call.id.clone(),
        output,
        success,
    }
}

fn dispatch(graph: &mut EntityGraph, call: &ToolCall) -> Result<String> {
    match call.name.as_str() {
        CREATE_ENTITY => {
            let args: CreateEntityArgs = parse_args(CREATE_ENTITY, &call.arguments)?;
            require_id("id", &args.id)?;
            let entity_type = EntityType::parse(&args.entity_type).ok_or_else(|| {
                ThreadmindError::ParseFailure(format!(
                    "unknown entity type '{}', expected one of {}",
                    args.entity_type,
                    EntityType::ALL.join(", ")
                ))
            })?;
            let node = EntityNode::new(&args.id, entity_type, args.name, args.description)
                .with_properties(args.properties.unwrap_or_default());
            Ok(match graph.create_or_update(node) {
                Upsert::Created => format!("Created entity {} ({})", args.id, entity_type),
                Upsert::Updated => format!("Updated existing entity {}", args.id),
            })
        }
        UPDATE_ENTITY => {
            let args: UpdateEntityArgs = parse_args(UPDATE_ENTITY, &call.arguments)?;
            require_id("id", &args.id)?;
            graph.update(
                &args.id,
                EntityPatch {
                    entity_type: None,
                    name: args.name,
                    description: args.description,
                    properties: args.properties,
                },
            )?;
            Ok(format!("Updated entity {}", args.id))
        }
        DELETE_ENTITY => {
            let args: DeleteEntityArgs = parse_args(DELETE_ENTITY, &call.arguments)?;
            require_id("id", &args.id)?;
            let removed = graph.delete(&args.id)?;
            Ok(format!(
                "Deleted entity {} and {} relationship(s) pointing to it",
                args.id, removed
            ))
        }
        ADD_RELATIONSHIP => {
            let args: AddRelationshipArgs = parse_args(ADD_RELATIONSHIP, &call.arguments)?;
            require_id("sourceId", &args.source_id)?;
            require_id("targetId", &args.target_id)?;
            require_id("relationship", &args.relationship)?;
            let created = graph.add_relationship(
                &args.source_id,
                &args.target_id,
                &args.relationship,
                args.strength,
            )?;
            let strength = graph
                .get(&args.source_id)
                .and_then(|n| {
                    n.relationships
                        .iter()
                        .find(|r| r.target_id == args.target_id && r.relationship == args.relationship)
                })
                .map(|r| r.strength)
                .unwrap_or_default();
            let verb = if created { "Added" } else { "Updated" };
            Ok(format!(
                "{} relationship {} -[{}]-> {} (strength {:.2})",
                verb, args.source_id, args.relationship, args.target_id, strength
            ))
        }
        REMOVE_RELATIONSHIP => {
            let args: RemoveRelationshipArgs = parse_args(REMOVE_RELATIONSHIP, &call.arguments)?;
            if graph.remove_relationship(&args.source_id, &args.target_id, &args.relationship) {
                Ok(format!(
                    "Removed relationship {} -[{}]-> {}",
                    args.source_id, args.relationship, args.target_id
                ))
            } else {
                Ok(format!(
                    "Relationship not found: {} -[{}]-> {}",
                    args.source_id, args.relationship, args.target_id
                ))
            }
        }
        other => Err(ThreadmindError::ParseFailure(format!("unknown tool '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall::new("call_1", name, arguments)
    }

    fn create(graph: &mut EntityGraph, id: &str) -> ToolOutcome {
        execute(
            graph,
            &call(
                CREATE_ENTITY,
                json!({"id": id, "type": "person", "name": id, "description": "test"}),
            ),
        )
    }

    #[test]
    fn test_normalize_object_and_string() {
        let obj = json!({"id": "a"});
        assert_eq!(normalize_arguments(&obj).unwrap()["id"], "a");

        let encoded = json!("{\"id\": \"a\"}");
        assert_eq!(normalize_arguments(&encoded).unwrap()["id"], "a");

        assert!(normalize_arguments(&json!("")).unwrap().is_empty());
        assert!(normalize_arguments(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        assert!(matches!(
            normalize_arguments(&json!("{not json")),
            Err(ThreadmindError::ParseFailure(_))
        ));
        assert!(matches!(
            normalize_arguments(&json!("[1, 2]")),
            Err(ThreadmindError::ParseFailure(_))
        ));
        assert!(matches!(
            normalize_arguments(&json!(42)),
            Err(ThreadmindError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_create_entity_from_string_arguments() {
        let mut graph = EntityGraph::new();
        let outcome = execute(
            &mut graph,
            &call(
                CREATE_ENTITY,
                json!(r#"{"id":"place-sf","type":"place","name":"San Francisco","description":"city"}"#),
            ),
        );
        assert!(outcome.success);
        assert_eq!(outcome.output, "Created entity place-sf (place)");
        assert_eq!(graph.get("place-sf").unwrap().entity_type, EntityType::Place);
    }

    #[test]
    fn test_repeated_create_is_idempotent() {
        let mut graph = EntityGraph::new();
        create(&mut graph, "x");
        let second = create(&mut graph, "x");
        assert!(second.success);
        assert!(second.output.starts_with("Updated"));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_missing_required_field_is_reported() {
        let mut graph = EntityGraph::new();
        let outcome = execute(&mut graph, &call(CREATE_ENTITY, json!({"id": "a"})));
        assert!(!outcome.success);
        assert!(outcome.output.starts_with("Error: Invalid arguments"));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_unknown_entity_type_is_rejected() {
        let mut graph = EntityGraph::new();
        let outcome = execute(
            &mut graph,
            &call(
                CREATE_ENTITY,
                json!({"id": "a", "type": "spaceship", "name": "A", "description": ""}),
            ),
        );
        assert!(!outcome.success);
        assert!(outcome.output.contains("spaceship"));
    }

    #[test]
    fn test_malformed_string_never_panics() {
        let mut graph = EntityGraph::new();
        let outcome = execute(&mut graph, &call(DELETE_ENTITY, json!("{oops")));
        assert!(!outcome.success);
        assert_eq!(outcome.tool_call_id, "call_1");
    }

    #[test]
    fn test_add_relationship_missing_target() {
        let mut graph = EntityGraph::new();
        create(&mut graph, "person-alice");
        let outcome = execute(
            &mut graph,
            &call(
                ADD_RELATIONSHIP,
                json!({"sourceId": "person-alice", "targetId": "place-sf", "relationship": "lives_in"}),
            ),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.output, "Error: Entity not found: place-sf");
        assert!(graph.get("person-alice").unwrap().relationships.is_empty());
    }

    #[test]
    fn test_add_relationship_then_update_strength() {
        let mut graph = EntityGraph::new();
        create(&mut graph, "a");
        create(&mut graph, "b");
        let args = json!({"sourceId": "a", "targetId": "b", "relationship": "knows"});
        let first = execute(&mut graph, &call(ADD_RELATIONSHIP, args));
        assert_eq!(first.output, "Added relationship a -[knows]-> b (strength 0.50)");

        let args = json!({"sourceId": "a", "targetId": "b", "relationship": "knows", "strength": 0.9});
        let second = execute(&mut graph, &call(ADD_RELATIONSHIP, args));
        assert_eq!(second.output, "Updated relationship a -[knows]-> b (strength 0.90)");
        assert_eq!(graph.get("a").unwrap().relationships.len(), 1);
    }

    #[test]
    fn test_remove_missing_relationship_is_not_fatal() {
        let mut graph = EntityGraph::new();
        let outcome = execute(
            &mut graph,
            &call(
                REMOVE_RELATIONSHIP,
                json!({"sourceId": "a", "targetId": "b", "relationship": "knows"}),
            ),
        );
        assert!(outcome.success);
        assert!(outcome.output.starts_with("Relationship not found"));
    }

    #[test]
    fn test_update_and_delete() {
        let mut graph = EntityGraph::new();
        create(&mut graph, "a");
        let outcome = execute(
            &mut graph,
            &call(UPDATE_ENTITY, json!({"id": "a", "properties": {"age": 40}})),
        );
        assert!(outcome.success);
        assert_eq!(graph.get("a").unwrap().properties["age"], 40);

        let missing = execute(&mut graph, &call(UPDATE_ENTITY, json!({"id": "zzz"})));
        assert_eq!(missing.output, "Error: Entity not found: zzz");

        let deleted = execute(&mut graph, &call(DELETE_ENTITY, json!({"id": "a"})));
        assert!(deleted.success);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_unknown_tool() {
        let mut graph = EntityGraph::new();
        let outcome = execute(&mut graph, &call("launch_rockets", json!({})));
        assert!(!outcome.success);
        assert!(outcome.output.contains("launch_rockets"));
    }
}
