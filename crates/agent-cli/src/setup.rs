use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use agent_core::ToolRegistry;
use agent_llm::{create_provider, LLMProvider, ProviderConfig, RetryConfig};
use agent_loop::AgentTools;
use agent_mcp::{McpClientManager, McpConfig};
use agent_tools::{register_builtin_tools, ApprovalGate, ApprovalPolicy, ShellCommandExecutor};

/// Backend selection. Every flag falls back to an environment variable.
#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    /// LLM provider (openai, azure, ollama, bedrock, deepseek, qwen)
    #[arg(long, env = "LLM_PROVIDER", default_value = "openai")]
    pub provider: String,

    /// LLM API key
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// LLM API base URL
    #[arg(long, env = "LLM_BASE_URL")]
    pub base_url: Option<String>,

    /// LLM model name
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "LLM_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Azure OpenAI deployment name
    #[arg(long, env = "AZURE_OPENAI_DEPLOYMENT")]
    pub deployment: Option<String>,

    /// Azure OpenAI api-version
    #[arg(long, env = "AZURE_OPENAI_API_VERSION")]
    pub api_version: Option<String>,

    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub aws_session_token: Option<String>,

    /// Attempts per model request, including the first
    #[arg(long, env = "LLM_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,
}

impl ProviderArgs {
    pub fn to_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider: self.provider.trim().to_ascii_lowercase(),
            api_key: self.api_key.clone().unwrap_or_default(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system_prompt: None,
            deployment: self.deployment.clone(),
            api_version: self.api_version.clone(),
            region: self.aws_region.clone(),
            access_key_id: self.aws_access_key_id.clone(),
            secret_access_key: self.aws_secret_access_key.clone(),
            session_token: self.aws_session_token.clone(),
            retry: RetryConfig {
                max_attempts: self.max_attempts.max(1),
                ..RetryConfig::default()
            },
        }
    }
}

/// Everything a run needs, built once at startup.
pub struct Runtime {
    pub llm: Arc<dyn LLMProvider>,
    pub tools: AgentTools,
    pub mcp: Arc<McpClientManager>,
}

pub struct RuntimeOptions<'a> {
    pub provider: &'a ProviderArgs,
    pub mcp_config: Option<&'a Path>,
    pub approval_policy: Option<&'a Path>,
    pub approval_timeout: Duration,
}

pub async fn build_runtime(options: RuntimeOptions<'_>) -> anyhow::Result<Runtime> {
    let provider_config = options.provider.to_config();
    let llm = create_provider(&provider_config)
        .with_context(|| format!("failed to configure provider '{}'", provider_config.provider))?;
    log::info!("Using provider '{}'", llm.name());

    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&registry, Arc::new(ShellCommandExecutor::new()))
        .context("failed to register built-in tools")?;

    let mcp = Arc::new(McpClientManager::new());
    if let Some(path) = options.mcp_config {
        let config = McpConfig::from_json_file(path)
            .with_context(|| format!("failed to load MCP config {}", path.display()))?;
        for (server, error) in mcp.connect_all(&config, &registry).await {
            log::warn!("MCP server '{}' unavailable: {}", server, error);
        }
    }

    let policy = load_policy(options.approval_policy)?;
    let approvals = ApprovalGate::new(policy).with_timeout(options.approval_timeout);

    Ok(Runtime {
        llm,
        tools: AgentTools::new(registry, Arc::new(approvals)),
        mcp,
    })
}

/// Default policy, or a JSON file overriding any of its fields.
pub fn load_policy(path: Option<&Path>) -> anyhow::Result<ApprovalPolicy> {
    let policy = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<ApprovalPolicy>(&content)
                .with_context(|| format!("invalid approval policy {}", path.display()))?
        }
        None => ApprovalPolicy::default(),
    };
    policy.validate()?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        provider: ProviderArgs,
    }

    #[test]
    fn flags_map_onto_provider_config() {
        let cli = TestCli::parse_from([
            "test",
            "--provider",
            "Bedrock",
            "--aws-region",
            "us-east-1",
            "--aws-access-key-id",
            "AKID",
            "--aws-secret-access-key",
            "secret",
            "--max-attempts",
            "0",
        ]);

        let config = cli.provider.to_config();
        assert_eq!(config.provider, "bedrock");
        assert_eq!(config.region.as_deref(), Some("us-east-1"));
        assert_eq!(config.access_key_id.as_deref(), Some("AKID"));
        assert_eq!(config.retry.max_attempts, 1);
        assert!(agent_llm::validate_provider_config(&config).is_ok());
    }

    #[test]
    fn policy_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"auto_approve": ["read_only", "write"]}}"#).unwrap();

        let policy = load_policy(Some(file.path())).unwrap();
        assert_eq!(policy.auto_approve.len(), 2);
        assert!(!policy.kubectl_read_only.is_empty());
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bash_dangerous": [""]}}"#).unwrap();

        assert!(load_policy(Some(file.path())).is_err());
        assert!(load_policy(None).is_ok());
    }
}
