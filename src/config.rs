use crate::markdown::DEFAULT_HEADING_TEMPLATE;
use chrono::NaiveDate;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_VAULT_ROOT: &str = "./vault";
const DEFAULT_VAULT_SUBDIR: &str = "Kindle Highlights";

#[derive(Parser, Debug, Default)]
#[command(name = "kindle-highlights")]
#[command(about = "Merge Kindle highlights into per-book Markdown notes")]
pub struct CliArgs {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to "My Clippings.txt"
    #[arg(long)]
    pub clippings: Option<PathBuf>,

    /// Path to a Kindle export CSV file
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Root directory of the notes vault
    #[arg(long)]
    pub vault: Option<PathBuf>,

    /// Subdirectory inside the vault for highlight notes
    #[arg(long)]
    pub subdir: Option<String>,

    /// Heading template for each highlight ({title}, {author}, {location})
    #[arg(long)]
    pub heading_template: Option<String>,

    /// Only include highlights added on or after this date (YYYY-MM-DD)
    #[arg(long)]
    pub since: Option<String>,

    /// Report what would change without writing any file
    #[arg(long)]
    pub dry_run: bool,

    /// List parsed highlights without touching the vault
    #[arg(long)]
    pub list: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Shape of the optional JSON configuration file.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub clippings_path: Option<PathBuf>,
    pub kindle_export_csv: Option<PathBuf>,
    pub vault_root: Option<PathBuf>,
    pub vault_subdir: Option<String>,
    pub highlight_heading_template: Option<String>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub clippings_path: Option<PathBuf>,
    pub kindle_export_csv: Option<PathBuf>,
    pub vault_root: PathBuf,
    pub vault_subdir: String,
    pub highlight_heading_template: String,
    pub since: Option<NaiveDate>,
    pub dry_run: bool,
    pub list_only: bool,
    pub verbose: bool,
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    ConfigFileUnreadable(String),
    InvalidConfigFile(String),
    InvalidDateFormat(String),
    NoInputSource,
    EmptyHeadingTemplate,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ConfigFileUnreadable(e) => {
                write!(f, "Cannot read configuration file: {}", e)
            }
            ConfigError::InvalidConfigFile(e) => {
                write!(f, "Invalid configuration file: {}", e)
            }
            ConfigError::InvalidDateFormat(s) => {
                write!(f, "Invalid date format: '{}'. Expected YYYY-MM-DD", s)
            }
            ConfigError::NoInputSource => {
                write!(f, "No input given: set a clippings file, a CSV export, or both")
            }
            ConfigError::EmptyHeadingTemplate => {
                write!(f, "Heading template must not be empty")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let cli = CliArgs::parse();
        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(cli, file, |key| std::env::var(key).ok())
    }

    /// Resolve every field as CLI flag, then environment, then config file,
    /// then default.
    fn from_sources(
        cli: CliArgs,
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let since = cli.since.as_deref().map(parse_date).transpose()?;

        let clippings_path = cli
            .clippings
            .or_else(|| env("KINDLE_CLIPPINGS_PATH").map(PathBuf::from))
            .or(file.clippings_path);

        let kindle_export_csv = cli
            .csv
            .or_else(|| env("KINDLE_EXPORT_CSV").map(PathBuf::from))
            .or(file.kindle_export_csv);

        if clippings_path.is_none() && kindle_export_csv.is_none() {
            return Err(ConfigError::NoInputSource);
        }

        let vault_root = cli
            .vault
            .or_else(|| env("VAULT_ROOT").map(PathBuf::from))
            .or(file.vault_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_VAULT_ROOT));

        let vault_subdir = cli
            .subdir
            .or_else(|| env("VAULT_SUBDIR"))
            .or(file.vault_subdir)
            .unwrap_or_else(|| DEFAULT_VAULT_SUBDIR.to_string());

        let highlight_heading_template = cli
            .heading_template
            .or_else(|| env("HIGHLIGHT_HEADING_TEMPLATE"))
            .or(file.highlight_heading_template)
            .unwrap_or_else(|| DEFAULT_HEADING_TEMPLATE.to_string());

        if highlight_heading_template.trim().is_empty() {
            return Err(ConfigError::EmptyHeadingTemplate);
        }

        Ok(Config {
            clippings_path,
            kindle_export_csv,
            vault_root,
            vault_subdir,
            highlight_heading_template,
            since,
            dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
            list_only: cli.list,
            verbose: cli.verbose,
        })
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.vault_root.join(&self.vault_subdir)
    }
}

pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ConfigFileUnreadable(format!("{}: {}", path.display(), e)))?;
    parse_file_config(&content)
}

fn parse_file_config(content: &str) -> Result<FileConfig, ConfigError> {
    serde_json::from_str(content).map_err(|e| ConfigError::InvalidConfigFile(e.to_string()))
}

fn parse_date(s: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDateFormat(s.to_string()))
}
