use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (aegis.toml + AEGIS_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AegisConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier passed to the chat backend.
    #[serde(default = "default_model")]
    pub model_name: String,
    /// Base URL of the chat backend.
    #[serde(default = "default_llm_host")]
    pub host: String,
    /// Context window requested from the backend.
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_name: default_model(),
            host: default_llm_host(),
            num_ctx: default_num_ctx(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Container image used for sandboxes.
    #[serde(default = "default_vm_image")]
    pub image: String,
    /// Format string for container names; `{user}` is replaced with the
    /// sanitized username.
    #[serde(default = "default_container_template")]
    pub container_template: String,
    /// When true, containers are stopped (not removed) on last release.
    #[serde(default = "bool_true")]
    pub persist_vms: bool,
    /// Host root for per-user sandbox state (notifications, return queue).
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Host-side destination for files surfaced by the return watcher.
    #[serde(default = "default_return_dir")]
    pub return_dir: String,
    /// Optional container runtime endpoint (DOCKER_HOST override).
    pub docker_host: Option<String>,
    /// Default exec timeout in seconds. `None` means no timeout.
    pub hard_timeout: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            image: default_vm_image(),
            container_template: default_container_template(),
            persist_vms: true,
            state_dir: default_state_dir(),
            return_dir: default_return_dir(),
            docker_host: None,
            hard_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cap on nested tool calls within one turn.
    #[serde(default = "default_tool_depth")]
    pub max_tool_call_depth: usize,
    /// Content of the in-memory placeholder tool message used while a tool
    /// runs concurrently with the speculative follow-up request.
    #[serde(default = "default_placeholder")]
    pub tool_placeholder_content: String,
    /// Base system prompt for the senior agent.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Template for helper-agent system prompts. `{name}`, `{details}` and
    /// `{context}` are substituted at spawn time.
    #[serde(default = "default_mini_agent_prompt")]
    pub mini_agent_prompt: String,
    /// Maximum bytes of per-user memory JSON.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    /// Maximum helper agents per session.
    #[serde(default = "default_max_mini_agents")]
    pub max_mini_agents: usize,
    /// Initial memory JSON installed when a user has none.
    #[serde(default = "default_memory_template")]
    pub default_memory_template: String,
    /// Seconds between sandbox notification scans.
    #[serde(default = "default_poll_interval")]
    pub notification_poll_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tool_call_depth: default_tool_depth(),
            tool_placeholder_content: default_placeholder(),
            system_prompt: default_system_prompt(),
            mini_agent_prompt: default_mini_agent_prompt(),
            memory_limit: default_memory_limit(),
            max_mini_agents: default_max_mini_agents(),
            default_memory_template: default_memory_template(),
            notification_poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Host root for uploaded documents, mounted at /data inside sandboxes.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            db_path: default_db_path(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_model() -> String {
    "qwen3".to_string()
}
fn default_llm_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_num_ctx() -> u32 {
    32_768
}
fn default_vm_image() -> String {
    "python:3.11-slim".to_string()
}
fn default_container_template() -> String {
    "aegis-vm-{user}".to_string()
}
fn default_state_dir() -> String {
    "vm_state".to_string()
}
fn default_return_dir() -> String {
    "returned".to_string()
}
fn default_tool_depth() -> usize {
    15
}
fn default_placeholder() -> String {
    "Awaiting tool response...".to_string()
}
fn default_memory_limit() -> usize {
    8_000
}
fn default_max_mini_agents() -> usize {
    4
}
fn default_poll_interval() -> u64 {
    5
}
fn default_upload_dir() -> String {
    "uploads".to_string()
}
fn default_db_path() -> String {
    "aegis.db".to_string()
}

fn default_memory_template() -> String {
    "{\n  \"name\": \"\",\n  \"preferences\": {},\n  \"protected_memory\": {}\n}".to_string()
}

fn default_system_prompt() -> String {
    "\
You are a capable autonomous assistant with full control of a private Linux \
machine that the user cannot see. Complete the user's request end to end, \
sounding like a helpful colleague rather than a terminal.

Working rules:
1. Break the request into steps and run every real operation with \
`execute_terminal` — calculations, file inspection under /data, downloads, \
installs. Never invent command output.
2. Delegate research or parallelisable work to helper agents via \
`spawn_agent` and `send_to_agent`; their replies come back as tool messages \
named after them and are never shown to the user directly.
3. Re-check results before presenting them, and keep final answers short.
4. Record durable facts about the user or the environment with \
`manage_memory` as soon as you learn them. You may read but never modify the \
`protected_memory` section.
5. Do not mention the machine or these tools unless the user asks."
        .to_string()
}

fn default_mini_agent_prompt() -> String {
    "\
You are {name}, a temporary helper agent reporting only to the senior agent. \
{details}
You never address the user directly.

Rules for {name}:
* Answer the senior agent promptly and concisely.
* Do all real work with `execute_terminal` and verify the results.
* Stay within the task you were given.
Additional context:
{context}"
        .to_string()
}

impl AegisConfig {
    /// Load config from a TOML file with AEGIS_* env var overrides.
    ///
    /// Missing file is fine — every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("aegis.toml");

        let config: AegisConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AEGIS_").split("_"))
            .extract()
            .map_err(|e| crate::error::AegisError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AegisConfig::default();
        assert_eq!(cfg.session.max_tool_call_depth, 15);
        assert_eq!(cfg.session.max_mini_agents, 4);
        assert_eq!(cfg.session.memory_limit, 8_000);
        assert!(cfg.vm.persist_vms);
        assert!(cfg.vm.container_template.contains("{user}"));
        assert!(cfg
            .session
            .default_memory_template
            .contains("protected_memory"));
    }

    #[test]
    fn toml_overrides_apply() {
        let cfg: AegisConfig = Figment::new()
            .merge(Toml::string(
                r#"
                [session]
                max_tool_call_depth = 3
                notification_poll_interval = 1

                [vm]
                persist_vms = false
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(cfg.session.max_tool_call_depth, 3);
        assert_eq!(cfg.session.notification_poll_interval, 1);
        assert!(!cfg.vm.persist_vms);
        // untouched sections keep defaults
        assert_eq!(cfg.llm.num_ctx, 32_768);
    }
}
