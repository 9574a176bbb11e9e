//! Tool definitions: the capabilities the model may ask the agent to run.
//!
//! A [`ToolDefinition`] is immutable: a name, a description, an ordered list
//! of [`ToolProperty`] and the capability that does the work. Per-call state
//! (inputs, call id, outcome) lives in
//! [`ToolInvocation`](crate::message::ToolInvocation), never here.
//!
//! Capabilities receive their arguments **positionally, in property
//! declaration order**. A capability registered with properties
//! `[path, content]` is called with `vec![path, content]` no matter how the
//! model ordered its JSON object. Optional properties the model left out are
//! passed as `Value::Null` in their slot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ToolError;

/// Error type a capability may fail with. Its `Display` text is what the
/// circuit breaker compares.
pub type CapabilityError = Box<dyn std::error::Error + Send + Sync>;

/// The callable behind a tool.
#[async_trait]
pub trait ToolCapability: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> Result<Value, CapabilityError>;
}

/// Adapter for an immediate (synchronous) closure.
struct FnCapability<F>(F);

#[async_trait]
impl<F> ToolCapability for FnCapability<F>
where
    F: Fn(Vec<Value>) -> Result<Value, CapabilityError> + Send + Sync,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        (self.0)(args)
    }
}

/// Adapter for a deferred closure returning a future.
struct AsyncFnCapability<F>(F);

#[async_trait]
impl<F, Fut> ToolCapability for AsyncFnCapability<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        (self.0)(args).await
    }
}

/// JSON Schema type of a tool property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

/// One named parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProperty {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: PropertyType,

    pub description: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ToolProperty {
    pub fn new(name: impl Into<String>, kind: PropertyType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
            enum_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn schema(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".into(), serde_json::to_value(self.kind).unwrap_or(Value::Null));
        prop.insert("description".into(), Value::String(self.description.clone()));
        if let Some(values) = &self.enum_values {
            prop.insert("enum".into(), Value::Array(values.clone()));
        }
        Value::Object(prop)
    }
}

/// The provider-facing function schema of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// An immutable tool: schema plus the capability that runs it.
#[derive(Clone)]
pub struct ToolDefinition {
    name: String,
    description: String,
    properties: Vec<ToolProperty>,
    capability: Arc<dyn ToolCapability>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        capability: impl ToolCapability + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            properties: Vec::new(),
            capability: Arc::new(capability),
        }
    }

    /// Build a tool around a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, CapabilityError> + Send + Sync + 'static,
    {
        Self::new(name, description, FnCapability(f))
    }

    /// Build a tool around a closure returning a future.
    pub fn from_async_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        Self::new(name, description, AsyncFnCapability(f))
    }

    /// Append a property. Declaration order is argument order.
    pub fn with_property(mut self, property: ToolProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn properties(&self) -> &[ToolProperty] {
        &self.properties
    }

    /// The function-call schema sent to the provider.
    ///
    /// `required` is omitted entirely when no property is required.
    pub fn schema(&self) -> ToolSchema {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|p| (p.name.clone(), p.schema()))
            .collect();

        let required: Vec<Value> = self
            .properties
            .iter()
            .filter(|p| p.required)
            .map(|p| Value::String(p.name.clone()))
            .collect();

        let mut parameters = Map::new();
        parameters.insert("type".into(), Value::String("object".into()));
        parameters.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            parameters.insert("required".into(), Value::Array(required));
        }

        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: Value::Object(parameters),
        }
    }

    /// Arguments for the capability, ordered by property declaration.
    pub fn positional_arguments(&self, inputs: &Map<String, Value>) -> Vec<Value> {
        self.properties
            .iter()
            .map(|p| inputs.get(&p.name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Validate the inputs and run the capability.
    ///
    /// Missing required parameters are rejected before the capability is
    /// touched. Whatever the capability fails with is passed through as
    /// [`ToolError::ExecutionFailed`] carrying its message.
    pub async fn execute(&self, inputs: &Map<String, Value>) -> Result<Value, ToolError> {
        if let Some(missing) = self
            .properties
            .iter()
            .find(|p| p.required && !inputs.contains_key(&p.name))
        {
            return Err(ToolError::MissingParameter {
                tool_name: self.name.clone(),
                parameter: missing.name.clone(),
            });
        }

        let args = self.positional_arguments(inputs);
        debug!(tool = %self.name, args = args.len(), "Invoking tool capability");

        self.capability
            .call(args)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// A registry of available tools.
///
/// The agent uses this to:
/// 1. Get tool schemas to send to the LLM
/// 2. Look up tools by name when the LLM requests them
///
/// Registration order is preserved in [`schemas`](Self::schemas).
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique; a second tool with the same name
    /// is rejected.
    pub fn register(&mut self, tool: ToolDefinition) -> Result<(), ToolError> {
        if self.index.contains_key(tool.name()) {
            return Err(ToolError::Duplicate(tool.name().to_string()));
        }
        self.index.insert(tool.name().to_string(), self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Schemas of every registered tool, in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(ToolDefinition::schema).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(ToolDefinition::name).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
