//! Configuration management for DbRheo.
//!
//! Configuration is resolved from layered YAML files plus environment
//! variables. Precedence, highest first: environment variables, system file
//! (`/etc/dbrheo/config.yaml`), workspace file (`./.dbrheo/config.yaml`),
//! user file (`~/.dbrheo/config.yaml`), built-in defaults. Unknown keys are
//! preserved verbatim so host front-ends can stash their own settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::error::{DbRheoError, Result};

/// Built-in defaults, lowest precedence layer.
const DEFAULT_CONFIG: &str = r#"
model: gemini-2.0-flash
max_turns: 10
debug: false
auto_execute: false
allow_dangerous: false
compression:
  threshold: 0.7
  keep_recent_fraction: 0.3
  context_window: 131072
scheduler:
  fan_out: 4
  cancel_grace_ms: 500
risk:
  confirmation_threshold: medium
retry:
  max_attempts: 3
  base_delay_ms: 500
  backoff_factor: 2.0
  max_delay_ms: 30000
llm:
  request_timeout_secs: 120
  max_output_tokens: 4096
tools:
  default_timeout_secs: 30
  file_max_bytes: 262144
  http_max_bytes: 262144
  code_interpreter: python3
shell:
  allow:
    - ls
    - cat
    - head
    - tail
    - wc
    - grep
    - find
    - echo
    - pwd
    - date
    - du
    - df
  deny:
    - 'rm\s+-rf'
    - '\bsudo\b'
    - '\bshutdown\b'
    - '\breboot\b'
    - '\bmkfs\b'
    - '\bdd\b'
    - '>\s*/dev/'
"#;

/// Which layer a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    System,
    Workspace,
    User,
}

/// File locations for the three writable layers.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub workspace: PathBuf,
    pub user: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        let user = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dbrheo")
            .join("config.yaml");
        Self {
            system: PathBuf::from("/etc/dbrheo/config.yaml"),
            workspace: PathBuf::from(".dbrheo/config.yaml"),
            user,
        }
    }
}

impl ConfigPaths {
    fn for_scope(&self, scope: ConfigScope) -> &Path {
        match scope {
            ConfigScope::System => &self.system,
            ConfigScope::Workspace => &self.workspace,
            ConfigScope::User => &self.user,
        }
    }
}

/// Resolved agent configuration.
///
/// Read-mostly: the merged view is computed at load time and only changes
/// through [`AgentConfig::set_value`], which re-merges.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    paths: ConfigPaths,
    /// Raw per-scope documents, kept unmerged so `save` writes back exactly
    /// what belongs to that scope.
    layers: HashMap<&'static str, Value>,
    merged: Value,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::for_tests(Value::Null)
    }
}

impl AgentConfig {
    /// Loads the layered configuration from the default paths, applying
    /// environment variables last.
    pub fn load() -> Result<Self> {
        Self::load_from(ConfigPaths::default(), true)
    }

    /// Loads from explicit paths. `read_env` controls whether environment
    /// variables are applied as the top layer (tests pass `false`).
    pub fn load_from(paths: ConfigPaths, read_env: bool) -> Result<Self> {
        let mut layers = HashMap::new();
        layers.insert("user", load_yaml_file(&paths.user)?);
        layers.insert("workspace", load_yaml_file(&paths.workspace)?);
        layers.insert("system", load_yaml_file(&paths.system)?);

        let env = if read_env { env_layer() } else { Value::Null };
        let merged = merge_layers(&layers, &env)?;

        Ok(Self {
            paths,
            layers,
            merged,
        })
    }

    /// Builds a config for tests: defaults overlaid with `overrides`, no
    /// file I/O and no environment.
    pub fn for_tests(overrides: Value) -> Self {
        let layers = HashMap::from([
            ("user", Value::Null),
            ("workspace", overrides),
            ("system", Value::Null),
        ]);
        let merged = merge_layers(&layers, &Value::Null)
            .expect("built-in default configuration must parse");
        Self {
            paths: ConfigPaths::default(),
            layers,
            merged,
        }
    }

    /// Looks up a value by dotted path (e.g. `"retry.max_attempts"`).
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut node = &self.merged;
        for segment in key.split('.') {
            node = node.get(segment)?;
        }
        Some(node)
    }

    /// Looks up a string, falling back to `default`.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// Looks up a boolean, accepting YAML booleans and common string forms.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => parse_bool(s).unwrap_or(default),
            _ => default,
        }
    }

    /// Looks up an unsigned integer.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Looks up a float.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Looks up a string list.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    // Typed conveniences.

    /// The configured model name.
    pub fn model(&self) -> String {
        self.get_str("model", "gemini-2.0-flash")
    }

    /// Hard cap on auto-continuations per user message.
    pub fn max_turns(&self) -> u32 {
        self.get_u64("max_turns", 10) as u32
    }

    /// Whether debug output (stack traces, verbose events) is enabled.
    pub fn debug(&self) -> bool {
        self.get_bool("debug", false)
    }

    /// When true the confirmation gate is bypassed entirely.
    pub fn allows_dangerous(&self) -> bool {
        self.get_bool("allow_dangerous", false)
    }

    /// When true, calls below the confirmation threshold skip the gate
    /// without consulting the host at all.
    pub fn auto_execute(&self) -> bool {
        self.get_bool("auto_execute", false)
    }

    /// Fraction of the context window at which history compression kicks
    /// in. Clamped to (0, 1].
    pub fn compression_threshold(&self) -> f64 {
        let raw = self.get_f64("compression.threshold", 0.7);
        if raw <= 0.0 {
            0.7
        } else {
            raw.min(1.0)
        }
    }

    /// Assumed model context window, in tokens.
    pub fn context_window(&self) -> u64 {
        self.get_u64("compression.context_window", 131_072)
    }

    /// Fraction of recent history the compressor always keeps.
    pub fn compression_keep_recent(&self) -> f64 {
        self.get_f64("compression.keep_recent_fraction", 0.3)
            .clamp(0.05, 0.95)
    }

    /// Concurrent fan-out for side-effect-free tool calls.
    pub fn scheduler_fan_out(&self) -> usize {
        self.get_u64("scheduler.fan_out", 4).max(1) as usize
    }

    /// Grace period an executing tool gets after an abort before the
    /// scheduler detaches it.
    pub fn cancel_grace_ms(&self) -> u64 {
        self.get_u64("scheduler.cancel_grace_ms", 500)
    }

    /// Risk level at or above which confirmation is required.
    pub fn confirmation_threshold(&self) -> String {
        self.get_str("risk.confirmation_threshold", "medium")
    }

    /// Default per-tool timeout.
    pub fn tool_default_timeout_secs(&self) -> u64 {
        self.get_u64("tools.default_timeout_secs", 30)
    }

    /// Shell command allowlist (program names).
    pub fn shell_allowlist(&self) -> Vec<String> {
        self.get_str_list("shell.allow")
    }

    /// Shell deny patterns (regular expressions).
    pub fn shell_denylist(&self) -> Vec<String> {
        self.get_str_list("shell.deny")
    }

    /// API key for the given provider key name, e.g. `"gemini_api_key"`.
    pub fn credential(&self, name: &str) -> Option<String> {
        self.get(&format!("credentials.{name}"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// The default connection URL, if one was configured.
    pub fn default_connection_url(&self) -> Option<String> {
        self.get("default_connection.url")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Sets a dotted key in the given scope's layer and re-merges.
    pub fn set_value(&mut self, scope: ConfigScope, key: &str, value: Value) -> Result<()> {
        let layer_name = match scope {
            ConfigScope::System => "system",
            ConfigScope::Workspace => "workspace",
            ConfigScope::User => "user",
        };
        let layer = self
            .layers
            .get_mut(layer_name)
            .expect("all layers are present");
        set_dotted(layer, key, value)?;
        self.merged = merge_layers(&self.layers, &Value::Null)?;
        Ok(())
    }

    /// Writes one scope's layer back to its file. Only called from explicit
    /// interactive commands.
    pub fn save(&self, scope: ConfigScope) -> Result<()> {
        let layer_name = match scope {
            ConfigScope::System => "system",
            ConfigScope::Workspace => "workspace",
            ConfigScope::User => "user",
        };
        let layer = &self.layers[layer_name];
        let path = self.paths.for_scope(scope);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbRheoError::config(format!("Cannot create {parent:?}: {e}")))?;
        }
        let text = serde_yaml::to_string(layer)
            .map_err(|e| DbRheoError::config(format!("Cannot serialize config: {e}")))?;
        std::fs::write(path, text)
            .map_err(|e| DbRheoError::config(format!("Cannot write {path:?}: {e}")))
    }

    /// The workspace root used by file tools and risk checks.
    pub fn workspace_root(&self) -> PathBuf {
        self.get("workspace_root")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn load_yaml_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Null);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| DbRheoError::config(format!("Failed to read {}: {e}", path.display())))?;
    if content.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_yaml::from_str(&content).map_err(|e| {
        DbRheoError::config(format!(
            "Configuration error in {}:\n  {e}",
            path.display()
        ))
    })
}

/// Builds the environment layer from recognized variables.
fn env_layer() -> Value {
    let mut pairs: Vec<(&str, String)> = Vec::new();

    let var = |names: &[&str]| -> Option<String> {
        names.iter().find_map(|n| std::env::var(n).ok())
    };

    if let Some(v) = var(&["GOOGLE_API_KEY", "GEMINI_API_KEY"]) {
        pairs.push(("credentials.gemini_api_key", v));
    }
    if let Some(v) = var(&["ANTHROPIC_API_KEY"]) {
        pairs.push(("credentials.anthropic_api_key", v));
    }
    if let Some(v) = var(&["OPENAI_API_KEY"]) {
        pairs.push(("credentials.openai_api_key", v));
    }
    if let Some(v) = var(&["OPENAI_API_BASE"]) {
        pairs.push(("credentials.openai_api_base", v));
    }
    if let Some(v) = var(&["DBRHEO_MODEL"]) {
        pairs.push(("model", v));
    }
    if let Some(v) = var(&["DBRHEO_MAX_TURNS"]) {
        pairs.push(("max_turns", v));
    }
    if let Some(v) = var(&["DBRHEO_AUTO_EXECUTE"]) {
        pairs.push(("auto_execute", v));
    }
    if let Some(v) = var(&["DBRHEO_ALLOW_DANGEROUS"]) {
        pairs.push(("allow_dangerous", v));
    }
    if let Some(v) = var(&["DBRHEO_DEBUG"]) {
        pairs.push(("debug", v));
    }
    if let Some(v) = var(&["DATABASE_URL"]) {
        pairs.push(("default_connection.url", v));
    }

    let mut layer = Value::Mapping(Default::default());
    for (key, raw) in pairs {
        let value = coerce_env_value(&raw);
        let _ = set_dotted(&mut layer, key, value);
    }
    layer
}

/// Environment values are strings; coerce obvious booleans and integers so
/// typed accessors behave the same regardless of layer.
fn coerce_env_value(raw: &str) -> Value {
    if let Some(b) = parse_bool(raw) {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<u64>() {
        return Value::Number(n.into());
    }
    Value::String(raw.to_string())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Merges all layers over the defaults. Later overlays win; mappings merge
/// recursively, scalars and sequences replace.
fn merge_layers(layers: &HashMap<&'static str, Value>, env: &Value) -> Result<Value> {
    let mut merged: Value = serde_yaml::from_str(DEFAULT_CONFIG)
        .map_err(|e| DbRheoError::internal(format!("built-in defaults are invalid: {e}")))?;
    // Precedence, lowest to highest: defaults, user, workspace, system, env.
    for name in ["user", "workspace", "system"] {
        overlay(&mut merged, &layers[name]);
    }
    overlay(&mut merged, env);
    Ok(merged)
}

fn overlay(base: &mut Value, over: &Value) {
    match (base, over) {
        (Value::Mapping(base_map), Value::Mapping(over_map)) => {
            for (k, v) in over_map {
                match base_map.get_mut(k) {
                    Some(slot) if slot.is_mapping() && v.is_mapping() => overlay(slot, v),
                    Some(slot) => *slot = v.clone(),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base_slot, over_val) => *base_slot = over_val.clone(),
    }
}

fn set_dotted(root: &mut Value, key: &str, value: Value) -> Result<()> {
    if !root.is_mapping() {
        *root = Value::Mapping(Default::default());
    }
    let mut node = root;
    let segments: Vec<&str> = key.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| DbRheoError::config(format!("'{key}' collides with a scalar")))?;
        let entry_key = Value::from(*segment);
        if i == segments.len() - 1 {
            map.insert(entry_key, value);
            return Ok(());
        }
        if !map.contains_key(&entry_key) {
            map.insert(entry_key.clone(), Value::Mapping(Default::default()));
        }
        node = map.get_mut(&entry_key).expect("just inserted");
    }
    Ok(())
}
