//! Fallback values for settings missing from `config.toml`.

pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub fn provider_base_url() -> String {
    DEFAULT_PROVIDER_BASE_URL.to_string()
}

pub fn provider_model() -> String {
    DEFAULT_PROVIDER_MODEL.to_string()
}

pub fn provider_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

pub fn sub_server_timeout_seconds() -> u64 {
    60
}

pub fn agent_max_steps() -> usize {
    8
}

pub fn agent_tool_concurrency() -> usize {
    4
}

pub fn agent_terminal_timeout_seconds() -> u64 {
    60
}
