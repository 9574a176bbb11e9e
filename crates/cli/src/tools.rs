//! Built-in tools offered to the model by the CLI.

use chrono::{Local, Utc};
use serde_json::{Value, json};
use switchyard_core::tool::{PropertyType, ToolDefinition, ToolProperty, ToolRegistry};

pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in [current_time()] {
        if let Err(e) = registry.register(tool) {
            tracing::warn!(error = %e, "Skipping built-in tool");
        }
    }
    registry
}

fn current_time() -> ToolDefinition {
    ToolDefinition::from_fn(
        "current_time",
        "Get the current date and time as an RFC 3339 timestamp",
        |args| {
            let zone = args.first().and_then(Value::as_str).unwrap_or("utc");
            let now = match zone {
                "utc" => Utc::now().to_rfc3339(),
                "local" => Local::now().to_rfc3339(),
                other => return Err(format!("unknown zone '{other}', use 'utc' or 'local'").into()),
            };
            Ok(json!({ "zone": zone, "now": now }))
        },
    )
    .with_property(
        ToolProperty::new("zone", PropertyType::String, "Time zone to report in")
            .with_enum(vec![json!("utc"), json!("local")]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn registry_exposes_current_time() {
        let registry = builtin_registry();
        assert_eq!(registry.names(), vec!["current_time"]);
        let schema = registry.get("current_time").unwrap().schema();
        assert!(schema.parameters.get("required").is_none());
    }

    #[tokio::test]
    async fn current_time_defaults_to_utc() {
        let tool = current_time();
        let value = tool.execute(&Map::new()).await.unwrap();
        assert_eq!(value["zone"], "utc");
        assert!(value["now"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn unknown_zone_fails() {
        let tool = current_time();
        let mut inputs = Map::new();
        inputs.insert("zone".into(), json!("mars"));
        assert!(tool.execute(&inputs).await.is_err());
    }
}
