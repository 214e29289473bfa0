//! Tool definitions and registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::Result;

/// Async tool body: parsed input in, JSON output out.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Where a tool runs, resolved once when the tool is defined.
#[derive(Clone)]
pub enum ToolKind {
    /// Runs on the server inside [`super::execute_tool_calls`].
    Server { execute: ToolHandler },
    /// Runs in the client when its input becomes available.
    Client { client_execute: ToolHandler },
    /// Known to the model, but results are supplied by hand.
    DefinitionOnly,
}

impl ToolKind {
    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server { .. })
    }
}

impl std::fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Server { .. } => "Server",
            Self::Client { .. } => "Client",
            Self::DefinitionOnly => "DefinitionOnly",
        })
    }
}

/// A tool the model may call.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub needs_approval: bool,
    pub kind: ToolKind,
}

fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |input| f(input).boxed())
}

impl ToolDefinition {
    fn with_kind(name: impl Into<String>, description: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            needs_approval: false,
            kind,
        }
    }

    /// A tool executed on the server.
    pub fn server<F, Fut>(name: impl Into<String>, description: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::with_kind(
            name,
            description,
            ToolKind::Server {
                execute: handler(execute),
            },
        )
    }

    /// A tool executed by the client.
    pub fn client<F, Fut>(name: impl Into<String>, description: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::with_kind(
            name,
            description,
            ToolKind::Client {
                client_execute: handler(execute),
            },
        )
    }

    pub fn definition(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_kind(name, description, ToolKind::DefinitionOnly)
    }

    pub fn with_needs_approval(mut self, needs_approval: bool) -> Self {
        self.needs_approval = needs_approval;
        self
    }
}

/// Tools by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: ToolDefinition) {
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    pub fn with(mut self, tool: ToolDefinition) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ToolDefinition>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl FromIterator<ToolDefinition> for ToolRegistry {
    fn from_iter<I: IntoIterator<Item = ToolDefinition>>(iter: I) -> Self {
        let mut registry = Self::new();
        for tool in iter {
            registry.register(tool);
        }
        registry
    }
}
