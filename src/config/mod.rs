use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Input roster and output tree
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_roster")]
    pub roster: PathBuf,

    /// Each data-type writes into `{output_root}/{folder}/`.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Run the external fetch script once per identifier.
    Script,
    /// Download the page directly over HTTP.
    Http,
}

/// Fetch worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_mode")]
    pub mode: FetchMode,

    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default = "default_script")]
    pub script: PathBuf,

    /// `{page}` is replaced by the data-type folder, `{code}` by the identifier.
    #[serde(default = "default_url_template")]
    pub url_template: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Run coordinator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Process only the first N selected identifiers.
    #[serde(default)]
    pub test_limit: Option<usize>,

    #[serde(default = "default_item_delay_secs")]
    pub item_delay_secs: u64,

    #[serde(default = "default_wide_item_delay_secs")]
    pub wide_item_delay_secs: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_roster() -> PathBuf {
    PathBuf::from("data/StockID_TWSE_TPEX.csv")
}
fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_mode() -> FetchMode {
    FetchMode::Script
}
fn default_program() -> String {
    "python".to_string()
}
fn default_script() -> PathBuf {
    PathBuf::from("scripts/fetch_page.py")
}
fn default_url_template() -> String {
    "https://goodinfo.tw/tw/{page}.asp?STOCK_ID={code}".to_string()
}
fn default_user_agent() -> String {
    "stock-batch/0.1 (periodic research fetch)".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    1500
}
fn default_item_delay_secs() -> u64 {
    3
}
fn default_wide_item_delay_secs() -> u64 {
    10
}
fn default_jitter_ms() -> u64 {
    500
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            roster: default_roster(),
            output_root: default_output_root(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            program: default_program(),
            script: default_script(),
            url_template: default_url_template(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            test_limit: None,
            item_delay_secs: default_item_delay_secs(),
            wide_item_delay_secs: default_wide_item_delay_secs(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("STOCK_BATCH").separator("__"))
            .build()
            .context("Failed to read configuration")?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}
