use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ChatId, errors::Error, Result};

/// Typed configuration for the bot.
///
/// Everything comes from environment variables, optionally seeded from a
/// `.env` file in the working directory. Values already present in the
/// environment are never overridden by `.env`.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    pub store_channel: ChatId,
    pub owner_id: i64,
    pub admins: Vec<i64>,

    // Links
    pub link_base_url: String,
    pub link_signing_key: String,
    pub link_previous_keys: Vec<String>,

    // Delivery expiry
    pub delivery_ttl: Duration,
    pub rerequest_window: Duration,
    pub expiry_sweep_interval: Duration,

    // Workspace
    pub temp_dir: PathBuf,
    pub session_idle_timeout: Duration,
    pub session_busy_wait: bool,
    pub process_timeout: Duration,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,

    // Store fetch retry
    pub fetch_attempts: u32,
    pub fetch_base_delay: Duration,

    // Search
    pub search_results_limit: usize,
    pub min_query_length: usize,

    // Delivery presentation
    pub protect_content: bool,
    pub custom_caption: Option<String>,

    // Records
    pub records_file: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let bot_token = env_str("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let store_channel = env_i64("STORE_CHANNEL_ID").ok_or_else(|| {
            Error::Config("STORE_CHANNEL_ID environment variable is required".to_string())
        })?;

        let owner_id = env_i64("OWNER_ID")
            .ok_or_else(|| Error::Config("OWNER_ID environment variable is required".to_string()))?;

        // Admin list always includes the owner.
        let mut admins = parse_csv_i64(env_str("ADMINS"));
        if !admins.contains(&owner_id) {
            admins.push(owner_id);
        }

        let link_base_url = env_str("LINK_BASE_URL")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("LINK_BASE_URL environment variable is required".to_string())
            })?;

        let link_signing_key = env_str("LINK_SIGNING_KEY")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("LINK_SIGNING_KEY environment variable is required".to_string())
            })?;
        let link_previous_keys = parse_csv(env_str("LINK_PREVIOUS_KEYS"));

        // Expiry windows
        let delivery_ttl = Duration::from_secs(env_u64("AUTO_DELETE_TIME").unwrap_or(600));
        let rerequest_window =
            Duration::from_secs(env_u64("RE_REQUEST_WINDOW_HOURS").unwrap_or(24) * 3600);
        let expiry_sweep_interval =
            Duration::from_secs(env_u64("EXPIRY_SWEEP_INTERVAL").unwrap_or(60));

        // Workspace
        let temp_dir = PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/fsb".to_string()));
        let session_idle_timeout = Duration::from_secs(env_u64("SESSION_TIMEOUT").unwrap_or(1800));
        let session_busy_wait = env_bool("SESSION_BUSY_WAIT").unwrap_or(false);
        let process_timeout = Duration::from_secs(env_u64("PROCESS_TIMEOUT").unwrap_or(120));
        let ffmpeg_path = env_path("FFMPEG_PATH").unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let ffprobe_path = env_path("FFPROBE_PATH").unwrap_or_else(|| PathBuf::from("ffprobe"));

        // Store fetch retry
        let fetch_attempts = env_u32("FETCH_ATTEMPTS").unwrap_or(3).max(1);
        let fetch_base_delay =
            Duration::from_millis(env_u64("FETCH_BASE_DELAY_MS").unwrap_or(1000));

        // Search
        let search_results_limit = env_usize("SEARCH_RESULTS_LIMIT").unwrap_or(50);
        let min_query_length = env_usize("MIN_QUERY_LENGTH").unwrap_or(3);

        // Delivery presentation
        let protect_content = env_bool("PROTECT_CONTENT").unwrap_or(false);
        let custom_caption = env_str("CUSTOM_CAPTION").and_then(non_empty);

        let records_file = PathBuf::from(
            env_str("RECORDS_FILE").unwrap_or("fsb-records.json".to_string()),
        );

        // Ensure the temp area exists up front; session namespaces live under it.
        fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            bot_token,
            store_channel: ChatId(store_channel),
            owner_id,
            admins,
            link_base_url,
            link_signing_key,
            link_previous_keys,
            delivery_ttl,
            rerequest_window,
            expiry_sweep_interval,
            temp_dir,
            session_idle_timeout,
            session_busy_wait,
            process_timeout,
            ffmpeg_path,
            ffprobe_path,
            fetch_attempts,
            fetch_base_delay,
            search_results_limit,
            min_query_length,
            protect_content,
            custom_caption,
            records_file,
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_skips_blanks_and_garbage() {
        assert_eq!(
            parse_csv_i64(Some("1, 2,,x, 3".to_string())),
            vec![1, 2, 3]
        );
        assert_eq!(
            parse_csv(Some("old-key, ,older-key".to_string())),
            vec!["old-key".to_string(), "older-key".to_string()]
        );
    }

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "FSB_TEST_DOTENV=from_file\nFSB_TEST_DOTENV_NEW='quoted'\n").unwrap();

        env::set_var("FSB_TEST_DOTENV", "from_env");
        env::remove_var("FSB_TEST_DOTENV_NEW");

        load_dotenv_if_present(&path);

        assert_eq!(env::var("FSB_TEST_DOTENV").unwrap(), "from_env");
        assert_eq!(env::var("FSB_TEST_DOTENV_NEW").unwrap(), "quoted");

        env::remove_var("FSB_TEST_DOTENV");
        env::remove_var("FSB_TEST_DOTENV_NEW");
    }
}
