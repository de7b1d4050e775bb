use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProviderEndpoints {
    #[serde(default = "default_openai_base_url")]
    pub openai: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic: String,
    #[serde(default = "default_google_base_url")]
    pub google: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai: default_openai_base_url(),
            anthropic: default_anthropic_base_url(),
            google: default_google_base_url(),
        }
    }
}

impl ProviderEndpoints {
    /// Every provider served from one base URL. Used against mock upstreams.
    pub fn all(base_url: &str) -> Self {
        Self {
            openai: base_url.to_string(),
            anthropic: base_url.to_string(),
            google: base_url.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Server-side deadline for a whole generation, measured from the moment
    /// the relay starts.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            generation_timeout_ms: default_generation_timeout_ms(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_google_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_temperature() -> f64 {
    1.0
}

fn default_generation_timeout_ms() -> u64 {
    300_000
}

fn default_max_output_tokens() -> u32 {
    4096
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
