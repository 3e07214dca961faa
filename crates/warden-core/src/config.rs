use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the relay.
///
/// Everything is read from environment variables (with `.env` support) so the
/// binary and tests can override any knob without a config file.
#[derive(Clone, Debug)]
pub struct Config {
    // Remote completion service
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub request_timeout: Duration,

    // Licensing
    pub data_dir: PathBuf,
    pub max_tries: u32,
    pub warning_message: String,
    pub arrive_message: String,
    pub warrant_invalid_message: String,
    pub warrant_success_message: String,

    // Sessions / prompting
    pub bot_name: String,
    pub character_desc: String,
    pub group_character_desc: String,
    pub max_session_tokens: u64,

    // Control commands
    pub clear_memory_commands: Vec<String>,
    pub clear_all_command: String,
    pub reload_command: String,

    // Rate limiting / retry
    pub rate_limit_per_minute: Option<u32>,
    pub rate_limit_cooldown: Duration,
    pub timeout_cooldown: Duration,
    pub rate_limited_message: String,
    pub timeout_message: String,
    pub connection_message: String,
    pub busy_message: String,

    // Inbound filtering
    pub dedup_ttl: Duration,
    pub staleness_threshold: Duration,
    pub replay_backlog: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let api_base = env_str("WARDEN_API_BASE")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = env_str("WARDEN_API_KEY").and_then(non_empty);

        let model = env_str("WARDEN_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string());
        let temperature = env_f64("WARDEN_TEMPERATURE").unwrap_or(0.9);
        let top_p = env_f64("WARDEN_TOP_P").unwrap_or(1.0);
        let frequency_penalty = env_f64("WARDEN_FREQUENCY_PENALTY").unwrap_or(0.0);
        let presence_penalty = env_f64("WARDEN_PRESENCE_PENALTY").unwrap_or(0.0);
        let request_timeout =
            Duration::from_secs(env_u64("WARDEN_REQUEST_TIMEOUT_SECS").unwrap_or(60));

        let data_dir =
            PathBuf::from(env_str("WARDEN_DATA_DIR").unwrap_or_else(|| "data".to_string()));
        fs::create_dir_all(&data_dir)?;

        let max_tries = env_u32("WARDEN_MAX_TRIES").unwrap_or(3);
        if max_tries == 0 {
            return Err(Error::Config(
                "WARDEN_MAX_TRIES must be at least 1".to_string(),
            ));
        }
        let warning_message = env_str("WARDEN_WARNING_MESSAGE").unwrap_or_else(|| {
            "You have reached the trial limit. Please activate with a warrant code.".to_string()
        });
        let arrive_message = env_str("WARDEN_ARRIVE_MESSAGE").unwrap_or_else(|| {
            "Your activation period has ended. Please renew with a new warrant code.".to_string()
        });
        let warrant_invalid_message = env_str("WARDEN_WARRANT_INVALID_MESSAGE")
            .unwrap_or_else(|| "Invalid warrant code. Please check it or contact the admin.".to_string());
        let warrant_success_message = env_str("WARDEN_WARRANT_SUCCESS_MESSAGE")
            .unwrap_or_else(|| "Activation successful.".to_string());

        let bot_name = env_str("WARDEN_BOT_NAME").unwrap_or_else(|| "Warden".to_string());
        let character_desc = env_str("WARDEN_CHARACTER_DESC").unwrap_or_else(|| {
            "You are {bot_name}, a helpful assistant talking with {name}.".to_string()
        });
        let group_character_desc = env_str("WARDEN_GROUP_CHARACTER_DESC").unwrap_or_else(|| {
            "You are {bot_name}, a helpful assistant in the group {group_name}, replying to {name}."
                .to_string()
        });
        let max_session_tokens = env_u64("WARDEN_MAX_SESSION_TOKENS").unwrap_or(4000);

        let clear_memory_commands = parse_csv(
            env_str("WARDEN_CLEAR_MEMORY_COMMANDS").unwrap_or_else(|| "#clear".to_string()),
        );
        let clear_all_command =
            env_str("WARDEN_CLEAR_ALL_COMMAND").unwrap_or_else(|| "#clearall".to_string());
        let reload_command =
            env_str("WARDEN_RELOAD_COMMAND").unwrap_or_else(|| "#reload".to_string());

        let rate_limit_per_minute = env_u32("WARDEN_RATE_LIMIT_PER_MINUTE").filter(|&n| n > 0);
        let rate_limit_cooldown =
            Duration::from_secs(env_u64("WARDEN_RATE_LIMIT_COOLDOWN_SECS").unwrap_or(20));
        let timeout_cooldown =
            Duration::from_secs(env_u64("WARDEN_TIMEOUT_COOLDOWN_SECS").unwrap_or(5));
        let rate_limited_message = env_str("WARDEN_RATE_LIMITED_MESSAGE").unwrap_or_else(|| {
            "You're asking too quickly. Give me a short break and try again.".to_string()
        });
        let timeout_message = env_str("WARDEN_TIMEOUT_MESSAGE")
            .unwrap_or_else(|| "I didn't receive your message. Please try again.".to_string());
        let connection_message = env_str("WARDEN_CONNECTION_MESSAGE")
            .unwrap_or_else(|| "I can't reach the network right now.".to_string());
        let busy_message = env_str("WARDEN_BUSY_MESSAGE")
            .unwrap_or_else(|| "I'm a little tired right now. Come back in a bit.".to_string());

        let dedup_ttl = Duration::from_secs(env_u64("WARDEN_DEDUP_TTL_SECS").unwrap_or(86_400));
        let staleness_threshold =
            Duration::from_secs(env_u64("WARDEN_STALENESS_SECS").unwrap_or(60));
        let replay_backlog = env_bool("WARDEN_REPLAY_BACKLOG").unwrap_or(false);

        Ok(Self {
            api_base,
            api_key,
            model,
            temperature,
            top_p,
            frequency_penalty,
            presence_penalty,
            request_timeout,
            data_dir,
            max_tries,
            warning_message,
            arrive_message,
            warrant_invalid_message,
            warrant_success_message,
            bot_name,
            character_desc,
            group_character_desc,
            max_session_tokens,
            clear_memory_commands,
            clear_all_command,
            reload_command,
            rate_limit_per_minute,
            rate_limit_cooldown,
            timeout_cooldown,
            rate_limited_message,
            timeout_message,
            connection_message,
            busy_message,
            dedup_ttl,
            staleness_threshold,
            replay_backlog,
        })
    }
}

#[cfg(test)]
impl Config {
    /// Defaults without touching the process environment, so parallel tests
    /// cannot race on env vars.
    pub(crate) fn for_tests(data_dir: std::path::PathBuf) -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.9,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            request_timeout: Duration::from_secs(60),
            data_dir,
            max_tries: 3,
            warning_message: "trial limit reached".to_string(),
            arrive_message: "activation period ended".to_string(),
            warrant_invalid_message: "invalid warrant code".to_string(),
            warrant_success_message: "activation successful".to_string(),
            bot_name: "Warden".to_string(),
            character_desc: "You are {bot_name}, talking with {name}.".to_string(),
            group_character_desc: "You are {bot_name} in {group_name}, replying to {name}."
                .to_string(),
            max_session_tokens: 4000,
            clear_memory_commands: vec!["#clear".to_string()],
            clear_all_command: "#clearall".to_string(),
            reload_command: "#reload".to_string(),
            rate_limit_per_minute: None,
            rate_limit_cooldown: Duration::from_secs(20),
            timeout_cooldown: Duration::from_secs(5),
            rate_limited_message: "asking too quickly".to_string(),
            timeout_message: "did not receive your message".to_string(),
            connection_message: "cannot reach the network".to_string(),
            busy_message: "a little tired right now".to_string(),
            dedup_ttl: Duration::from_secs(86_400),
            staleness_threshold: Duration::from_secs(60),
            replay_backlog: false,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| matches!(s.trim(), "1" | "true" | "yes"))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_csv(raw: String) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Minimal `.env` loader: KEY=VALUE lines, `#` comments, no quoting rules.
/// Existing environment variables win.
fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if env::var_os(key).is_none() {
            env::set_var(key, value.trim());
        }
    }
}
