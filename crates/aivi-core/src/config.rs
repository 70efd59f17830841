// aivi/crates/aivi-core/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Runtime configuration for the retrieval and memory core.
///
/// Every recognized key is a field here; there is no free-form settings map.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub export_dir: PathBuf,

    /// Composite score at or above which a lookup counts as a cache hit.
    pub hit_threshold: f32,
    /// Confidence assigned to answers written back after a successful fetch.
    pub fetched_confidence: f32,
    pub fetched_category: String,

    pub service_url: String,
    pub service_model: String,
    pub service_api_key: Option<String>,
    pub service_timeout: Duration,
    pub service_max_tokens: u32,
    pub service_temperature: f32,

    pub checkpoint_interval: Duration,
    pub shutdown_flush_timeout: Duration,
    /// Consecutive failed writes tolerated before a storage error is surfaced.
    pub max_write_failures: u32,
    pub max_metadata_entries: usize,

    pub context: ContextConfig,
}

/// Limits applied by the context builder.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub recent_messages: usize,
    pub relevant_messages: usize,
    pub knowledge_snippets: usize,
    pub max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recent_messages: 6,
            relevant_messages: 4,
            knowledge_snippets: 2,
            max_chars: 4000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            database_path: data_dir.join("aivi.db"),
            export_dir: PathBuf::from("./exports"),
            data_dir,
            hit_threshold: 0.85,
            fetched_confidence: 0.90,
            fetched_category: "externally_generated".to_string(),
            service_url: "http://127.0.0.1:8081".to_string(),
            service_model: "local-llm".to_string(),
            service_api_key: None,
            service_timeout: Duration::from_secs(10),
            service_max_tokens: 500,
            service_temperature: 0.7,
            checkpoint_interval: Duration::from_secs(30),
            shutdown_flush_timeout: Duration::from_secs(5),
            max_write_failures: 3,
            max_metadata_entries: 32,
            context: ContextConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let data_dir = env::var("AIVI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let database_path = env::var("AIVI_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("aivi.db"));

        let hit_threshold: f32 = env::var("AIVI_HIT_THRESHOLD")
            .unwrap_or_else(|_| "0.85".into())
            .parse()
            .context("AIVI_HIT_THRESHOLD must be a number")?;
        let fetched_confidence: f32 = env::var("AIVI_FETCHED_CONFIDENCE")
            .unwrap_or_else(|_| "0.90".into())
            .parse()
            .context("AIVI_FETCHED_CONFIDENCE must be a number")?;

        for (name, value) in [("AIVI_HIT_THRESHOLD", hit_threshold), ("AIVI_FETCHED_CONFIDENCE", fetched_confidence)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }

        let service_api_key = env::var("AIVI_SERVICE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let context = ContextConfig {
            recent_messages: env::var("AIVI_CONTEXT_RECENT")
                .unwrap_or_else(|_| "6".into())
                .parse()?,
            relevant_messages: env::var("AIVI_CONTEXT_RELEVANT")
                .unwrap_or_else(|_| "4".into())
                .parse()?,
            knowledge_snippets: env::var("AIVI_CONTEXT_KNOWLEDGE")
                .unwrap_or_else(|_| "2".into())
                .parse()?,
            max_chars: env::var("AIVI_CONTEXT_MAX_CHARS")
                .unwrap_or_else(|_| "4000".into())
                .parse()?,
        };

        Ok(Self {
            export_dir: env::var("AIVI_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            data_dir,
            database_path,
            hit_threshold,
            fetched_confidence,
            fetched_category: env::var("AIVI_FETCHED_CATEGORY")
                .unwrap_or(defaults.fetched_category),
            service_url: env::var("AIVI_SERVICE_URL").unwrap_or(defaults.service_url),
            service_model: env::var("AIVI_SERVICE_MODEL").unwrap_or(defaults.service_model),
            service_api_key,
            service_timeout: Duration::from_secs(
                env::var("AIVI_SERVICE_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".into())
                    .parse()?,
            ),
            service_max_tokens: env::var("AIVI_SERVICE_MAX_TOKENS")
                .unwrap_or_else(|_| "500".into())
                .parse()?,
            service_temperature: env::var("AIVI_SERVICE_TEMPERATURE")
                .unwrap_or_else(|_| "0.7".into())
                .parse()?,
            checkpoint_interval: Duration::from_secs(
                env::var("AIVI_CHECKPOINT_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "30".into())
                    .parse()?,
            ),
            shutdown_flush_timeout: Duration::from_secs(
                env::var("AIVI_SHUTDOWN_FLUSH_SECONDS")
                    .unwrap_or_else(|_| "5".into())
                    .parse()?,
            ),
            max_write_failures: env::var("AIVI_MAX_WRITE_FAILURES")
                .unwrap_or_else(|_| "3".into())
                .parse()?,
            max_metadata_entries: env::var("AIVI_MAX_METADATA_ENTRIES")
                .unwrap_or_else(|_| "32".into())
                .parse()?,
            context,
        })
    }

    /// Configuration rooted in a scratch directory, used by tests and tooling.
    pub fn for_data_dir(dir: impl Into<PathBuf>) -> Self {
        let data_dir = dir.into();
        Self {
            database_path: data_dir.join("aivi.db"),
            export_dir: data_dir.join("exports"),
            data_dir,
            ..Self::default()
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Data Dir: {}", self.data_dir.display());
        info!("- Database: {}", self.database_path.display());
        info!("- Hit Threshold: {}", self.hit_threshold);
        info!("- Fetched Confidence: {}", self.fetched_confidence);
        info!("- Answer Service: {} (model {})", self.service_url, self.service_model);
        info!("- Service Timeout: {:?}", self.service_timeout);
        info!("- Checkpoint Interval: {:?}", self.checkpoint_interval);
        info!("- Max Write Failures: {}", self.max_write_failures);
        info!(
            "- Context: {} recent, {} relevant, {} knowledge, {} chars",
            self.context.recent_messages,
            self.context.relevant_messages,
            self.context.knowledge_snippets,
            self.context.max_chars
        );
    }

    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.service_url.trim_end_matches('/'))
    }
}
