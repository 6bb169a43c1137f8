//! Tool registry: storage, capability search, and the function-calling
//! snapshot exposed to the LLM.
//!
//! Reads are concurrent; register/unregister take the write lock. Names
//! are unique and validated at registration, which fails loudly rather
//! than shadowing an existing tool silently.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use super::{Capability, Tool};
use crate::error::{DbRheoError, Result};

/// A registered tool with its discovery metadata.
#[derive(Clone)]
pub struct ToolRegistration {
    pub tool: Arc<dyn Tool>,
    pub capabilities: Vec<Capability>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub enabled: bool,
    pub metadata: serde_json::Value,
}

/// The function-calling snapshot entry handed to LLM services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

fn name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new("^[a-z][a-z0-9_]{0,63}$").expect("tool name pattern is valid")
    })
}

/// Thread-safe tool registry.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, ToolRegistration>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Re-registering an existing name replaces it
    /// atomically. Capabilities come from the tool itself; `tags`,
    /// `priority`, and `metadata` drive discovery and ordering.
    pub fn register(
        &self,
        tool: Arc<dyn Tool>,
        tags: Vec<String>,
        priority: i32,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let name = tool.name().to_string();
        if !name_pattern().is_match(&name) {
            return Err(DbRheoError::config(format!(
                "Invalid tool name '{name}': must match [a-z][a-z0-9_]{{0,63}}"
            )));
        }
        let registration = ToolRegistration {
            capabilities: tool.capabilities().to_vec(),
            tool,
            tags,
            priority,
            enabled: true,
            metadata,
        };
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(name, registration);
        Ok(())
    }

    /// Removes a tool by name. Returns true if it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Looks up an enabled tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .filter(|r| r.enabled)
            .map(|r| r.tool.clone())
    }

    /// Looks up the full registration.
    pub fn registration(&self, name: &str) -> Option<ToolRegistration> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All registrations, priority descending then name ascending.
    pub fn list(&self) -> Vec<ToolRegistration> {
        let mut entries: Vec<ToolRegistration> = self
            .inner
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.tool.name().cmp(b.tool.name()))
        });
        entries
    }

    /// Tools claiming exactly this capability.
    pub fn by_capability(&self, capability: Capability) -> Vec<Arc<dyn Tool>> {
        self.list()
            .into_iter()
            .filter(|r| r.enabled && r.capabilities.contains(&capability))
            .map(|r| r.tool)
            .collect()
    }

    /// Tools claiming all (or any) of the given capabilities.
    pub fn by_capabilities(&self, capabilities: &[Capability], match_all: bool) -> Vec<Arc<dyn Tool>> {
        self.list()
            .into_iter()
            .filter(|r| {
                r.enabled
                    && if match_all {
                        capabilities.iter().all(|c| r.capabilities.contains(c))
                    } else {
                        capabilities.iter().any(|c| r.capabilities.contains(c))
                    }
            })
            .map(|r| r.tool)
            .collect()
    }

    /// Substring search over name, description, and tags. Results sort by
    /// capability-intersection size (desc), then priority (desc), then
    /// name.
    pub fn search(&self, query: &str, capabilities: Option<&[Capability]>) -> Vec<Arc<dyn Tool>> {
        let needle = query.to_lowercase();
        let mut matches: Vec<(usize, i32, String, Arc<dyn Tool>)> = self
            .inner
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|r| r.enabled)
            .filter(|r| {
                r.tool.name().to_lowercase().contains(&needle)
                    || r.tool.description().to_lowercase().contains(&needle)
                    || r.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .map(|r| {
                let overlap = capabilities
                    .map(|caps| {
                        caps.iter()
                            .filter(|c| r.capabilities.contains(c))
                            .count()
                    })
                    .unwrap_or(0);
                (overlap, r.priority, r.tool.name().to_string(), r.tool.clone())
            })
            .collect();

        matches.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        matches.into_iter().map(|(_, _, _, tool)| tool).collect()
    }

    /// The snapshot sent to the LLM as function declarations.
    pub fn snapshot_for_llm(&self) -> Vec<ToolDeclaration> {
        self.list()
            .into_iter()
            .filter(|r| r.enabled)
            .map(|r| ToolDeclaration {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                parameters: r.tool.parameters(),
            })
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    /// True when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
