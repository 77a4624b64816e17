use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blast::HomologySettings;
use crate::domain::AnalysisOptions;
use crate::error::ProtmergeError;
use crate::governor::RatePolicy;
use crate::pipeline::PipelineSettings;
use crate::rcsb::StructureSettings;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "protmerge.json";

/// NCBI never accepts submissions closer together than this.
const MIN_SPACING_FLOOR: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub identifiers: Vec<IdentifierEntry>,
    #[serde(default)]
    pub analyses: Option<AnalysisOptions>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub homology: Option<HomologyConfig>,
    #[serde(default)]
    pub structure: Option<StructureConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum IdentifierEntry {
    Shorthand(String),
    Detailed(IdentifierObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IdentifierObject {
    pub id: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HomologyConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub expect: Option<f64>,
    #[serde(default)]
    pub hitlist_size: Option<u32>,
    #[serde(default)]
    pub min_spacing_secs: Option<u64>,
    #[serde(default)]
    pub daily_ceiling: Option<usize>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_polls: Option<u32>,
    #[serde(default)]
    pub self_match_identity: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StructureConfig {
    #[serde(default)]
    pub max_detailed: Option<usize>,
    #[serde(default)]
    pub max_listed: Option<usize>,
    #[serde(default)]
    pub spacing_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    /// Raw strings; validation happens per identifier during the run.
    pub identifiers: Vec<String>,
    pub pipeline: PipelineSettings,
    pub rate: RatePolicy,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ProtmergeError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(ProtmergeError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ProtmergeError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ProtmergeError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but an absent default file yields the
    /// built-in defaults.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, ProtmergeError> {
        match Self::resolve(path) {
            Err(ProtmergeError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ProtmergeError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(invalid(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let identifiers = config
            .identifiers
            .into_iter()
            .map(|entry| match entry {
                IdentifierEntry::Shorthand(value) => value,
                IdentifierEntry::Detailed(obj) => obj.id,
            })
            .collect();

        let options = config.analyses.unwrap_or_default();
        if !options.any() {
            return Err(invalid("at least one analysis must be enabled"));
        }

        let workers = config.workers.unwrap_or(4);
        if workers == 0 {
            return Err(invalid("workers must be at least 1"));
        }

        let timeout_secs = config.timeout_secs.unwrap_or(30);
        if timeout_secs == 0 {
            return Err(invalid("timeout_secs must be at least 1"));
        }

        let retry = resolve_retry(config.retry.unwrap_or_default())?;
        let (homology, rate) = resolve_homology(config.homology.unwrap_or_default())?;
        let structure = resolve_structure(config.structure.unwrap_or_default())?;

        Ok(ResolvedConfig {
            schema_version,
            identifiers,
            pipeline: PipelineSettings {
                options,
                workers,
                timeout: Duration::from_secs(timeout_secs),
                retry,
                homology,
                structure,
            },
            rate,
        })
    }
}

fn resolve_retry(config: RetryConfig) -> Result<RetryPolicy, ProtmergeError> {
    let defaults = RetryPolicy::default();
    let policy = RetryPolicy {
        max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts),
        base_delay: config
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        multiplier: config.multiplier.unwrap_or(defaults.multiplier),
    };
    if policy.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if policy.multiplier < 2 {
        return Err(invalid("retry.multiplier must be at least 2"));
    }
    Ok(policy)
}

fn resolve_homology(
    config: HomologyConfig,
) -> Result<(HomologySettings, RatePolicy), ProtmergeError> {
    let defaults = HomologySettings::default();
    let default_rate = RatePolicy::default();

    let settings = HomologySettings {
        email: config.email.unwrap_or(defaults.email),
        tool: config.tool.unwrap_or(defaults.tool),
        program: defaults.program,
        database: config.database.unwrap_or(defaults.database),
        expect: config.expect.unwrap_or(defaults.expect),
        hitlist_size: config.hitlist_size.unwrap_or(defaults.hitlist_size),
        poll_interval: config
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval),
        max_polls: config.max_polls.unwrap_or(defaults.max_polls),
        self_match_identity: config
            .self_match_identity
            .unwrap_or(defaults.self_match_identity),
    };
    let rate = RatePolicy {
        min_spacing: config
            .min_spacing_secs
            .map(Duration::from_secs)
            .unwrap_or(default_rate.min_spacing),
        daily_ceiling: config.daily_ceiling.unwrap_or(default_rate.daily_ceiling),
        window: default_rate.window,
    };

    if settings.email.trim().is_empty() {
        return Err(invalid("homology.email must not be empty"));
    }
    if settings.tool.trim().is_empty() {
        return Err(invalid("homology.tool must not be empty"));
    }
    if settings.database.trim().is_empty() {
        return Err(invalid("homology.database must not be empty"));
    }
    if settings.expect.is_nan() || settings.expect <= 0.0 {
        return Err(invalid("homology.expect must be positive"));
    }
    if settings.hitlist_size == 0 {
        return Err(invalid("homology.hitlist_size must be at least 1"));
    }
    if settings.max_polls == 0 {
        return Err(invalid("homology.max_polls must be at least 1"));
    }
    if rate.daily_ceiling == 0 {
        return Err(invalid("homology.daily_ceiling must be at least 1"));
    }
    if rate.min_spacing < MIN_SPACING_FLOOR {
        return Err(invalid("homology.min_spacing_secs must be at least 10"));
    }
    if settings.poll_interval < rate.min_spacing {
        return Err(invalid(
            "homology.poll_interval_secs must not be shorter than min_spacing_secs",
        ));
    }
    Ok((settings, rate))
}

fn resolve_structure(config: StructureConfig) -> Result<StructureSettings, ProtmergeError> {
    let defaults = StructureSettings::default();
    let settings = StructureSettings {
        max_detailed: config.max_detailed.unwrap_or(defaults.max_detailed),
        max_listed: config.max_listed.unwrap_or(defaults.max_listed),
        spacing: config
            .spacing_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.spacing),
    };
    if settings.max_detailed == 0 {
        return Err(invalid("structure.max_detailed must be at least 1"));
    }
    if settings.max_listed == 0 {
        return Err(invalid("structure.max_listed must be at least 1"));
    }
    Ok(settings)
}

fn invalid(message: impl Into<String>) -> ProtmergeError {
    ProtmergeError::InvalidConfig(message.into())
}
