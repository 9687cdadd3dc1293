use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::tools::{parse_tool_args, FunctionSchema, ToolCall, ToolError, ToolResult, ToolSchema};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError>;

    fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            schema_type: "function".to_string(),
            function: FunctionSchema {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: self.parameters_schema(),
            },
        }
    }
}

pub type SharedTool = Arc<dyn Tool>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool with name '{0}' already registered")]
    DuplicateTool(String),

    #[error("invalid tool: {0}")]
    InvalidTool(String),
}

struct RegisteredTool {
    tool: SharedTool,
    source: Option<String>,
}

/// Name-keyed tool table shared by the orchestrator and tool-server connections.
///
/// Lookups and listing share a read lock; every mutation takes the write lock.
/// Tools registered through [`ToolRegistry::register_from_source`] remember
/// their source so they can be dropped together.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<T>(&self, tool: T) -> Result<(), RegistryError>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&self, tool: SharedTool) -> Result<(), RegistryError> {
        let name = validated_name(&tool)?;
        let mut tools = self.tools.write();
        if tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        tools.insert(name, RegisteredTool { tool, source: None });
        Ok(())
    }

    /// Register a batch of tools owned by `source_id`. Returns how many were added.
    ///
    /// Names already owned by a different source (or registered directly) are
    /// skipped. Names already owned by the same source are replaced.
    pub fn register_from_source(&self, source_id: &str, tools: Vec<SharedTool>) -> usize {
        let mut table = self.tools.write();
        let mut added = 0;

        for tool in tools {
            let name = match validated_name(&tool) {
                Ok(name) => name,
                Err(error) => {
                    log::warn!("Skipping tool from source '{}': {}", source_id, error);
                    continue;
                }
            };

            if let Some(existing) = table.get(&name) {
                if existing.source.as_deref() != Some(source_id) {
                    log::warn!(
                        "Tool '{}' from source '{}' conflicts with an existing tool, skipping",
                        name,
                        source_id
                    );
                    continue;
                }
            }

            table.insert(
                name,
                RegisteredTool {
                    tool,
                    source: Some(source_id.to_string()),
                },
            );
            added += 1;
        }

        log::debug!("Registered {} tools from source '{}'", added, source_id);
        added
    }

    /// Remove every tool owned by `source_id`. Returns how many were removed.
    pub fn unregister_from_source(&self, source_id: &str) -> usize {
        let mut table = self.tools.write();
        let before = table.len();
        table.retain(|_, entry| entry.source.as_deref() != Some(source_id));
        let removed = before - table.len();
        log::debug!("Unregistered {} tools from source '{}'", removed, source_id);
        removed
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<SharedTool> {
        self.tools
            .read()
            .get(name)
            .map(|entry| Arc::clone(&entry.tool))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn source_of(&self, name: &str) -> Option<String> {
        self.tools
            .read()
            .get(name)
            .and_then(|entry| entry.source.clone())
    }

    pub fn list_tools(&self) -> Vec<ToolSchema> {
        let mut tools: Vec<ToolSchema> = self
            .tools
            .read()
            .values()
            .map(|entry| entry.tool.to_schema())
            .collect();
        tools.sort_by(|left, right| left.function.name.cmp(&right.function.name));
        tools
    }

    pub fn list_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Run one tool call. Every failure comes back as an error result.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        // Clone the handle so the lock is not held across the await.
        let Some(tool) = self.get(name) else {
            log::warn!("Model requested unknown tool '{}'", name);
            let error = ToolError::NotFound(name.to_string());
            return ToolResult::error(&call.id, error.to_result_text());
        };

        let args = match parse_tool_args(&call.function.arguments) {
            Ok(args) => args,
            Err(error) => return ToolResult::error(&call.id, error.to_result_text()),
        };

        match tool.execute(args).await {
            Ok(content) => ToolResult::success(&call.id, content),
            Err(error) => {
                log::debug!("Tool '{}' failed: {}", name, error);
                ToolResult::error(&call.id, error.to_result_text())
            }
        }
    }
}

fn validated_name(tool: &SharedTool) -> Result<String, RegistryError> {
    let name = tool.name().trim();
    if name.is_empty() {
        return Err(RegistryError::InvalidTool(
            "tool name cannot be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}
