use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

use crate::plan::RetentionWindow;
use crate::tag_filter::{FilterError, TagInclusionFilter};

pub const DEFAULT_SOURCE_TABLE: &str = "events";
pub const DEFAULT_INDEX_URL: &str = "http://127.0.0.1:9200";
pub const DEFAULT_INDEX_NAME: &str = "eventstore";
pub const DEFAULT_RETENTION_DAYS: u32 = 365;
pub const DEFAULT_MAX_SEGMENT_RECORDS: u64 = 7_500;
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 10;
pub const DEFAULT_INCLUSIVE_TAGS: &str = "1";
pub const DEFAULT_TAG_REFRESH_SECS: u64 = 60;
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_METRICS_PORT: u16 = 3000;

/// Where reloaded records are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Bulk-index into the search index.
    Index,
    /// One JSON document per line on stdout.
    Stdout,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid tag inclusion expression: {0}")]
    TagExpression(#[from] FilterError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub source_table: String,
    pub index_url: String,
    pub index_name: String,
    pub index_user: Option<String>,
    pub index_pass: Option<String>,
    pub retention_days: u32,
    pub max_segment_records: u64,
    pub sync_period: Duration,
    pub inclusive_tags: String,
    pub tag_refresh: Duration,
    pub error_backoff: Duration,
    pub metrics_addr: SocketAddr,
    pub sink: SinkKind,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let config = Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            source_table: get("SOURCE_TABLE").unwrap_or_else(|| DEFAULT_SOURCE_TABLE.to_string()),
            index_url: get("INDEX_URL").unwrap_or_else(|| DEFAULT_INDEX_URL.to_string()),
            index_name: get("INDEX_NAME").unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
            index_user: get("INDEX_USER"),
            index_pass: get("INDEX_PASS"),
            retention_days: parse_or(
                "RETENTION_DAYS",
                get("RETENTION_DAYS"),
                DEFAULT_RETENTION_DAYS,
            )?,
            max_segment_records: parse_or(
                "MAX_SEGMENT_RECORDS",
                get("MAX_SEGMENT_RECORDS"),
                DEFAULT_MAX_SEGMENT_RECORDS,
            )?,
            sync_period: Duration::from_secs(parse_or(
                "SYNC_PERIOD_SECS",
                get("SYNC_PERIOD_SECS"),
                DEFAULT_SYNC_PERIOD_SECS,
            )?),
            inclusive_tags: get("INCLUSIVE_TAGS")
                .unwrap_or_else(|| DEFAULT_INCLUSIVE_TAGS.to_string()),
            tag_refresh: Duration::from_secs(parse_or(
                "TAG_REFRESH_SECS",
                get("TAG_REFRESH_SECS"),
                DEFAULT_TAG_REFRESH_SECS,
            )?),
            error_backoff: Duration::from_secs(parse_or(
                "ERROR_BACKOFF_SECS",
                get("ERROR_BACKOFF_SECS"),
                DEFAULT_ERROR_BACKOFF_SECS,
            )?),
            metrics_addr: parse_or(
                "METRICS_ADDR",
                get("METRICS_ADDR"),
                SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            )?,
            sink: SinkKind::Index,
        };

        config.validate()?;
        Ok(config)
    }

    /// Range checks plus a dry run of the tag expression. Re-run after CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_days == 0 {
            return Err(invalid("RETENTION_DAYS", "0", "must be at least 1"));
        }
        if self.max_segment_records == 0 {
            return Err(invalid("MAX_SEGMENT_RECORDS", "0", "must be at least 1"));
        }
        if self.sync_period.is_zero() {
            return Err(invalid("SYNC_PERIOD_SECS", "0", "must be at least 1"));
        }
        self.tag_filter()?;
        Ok(())
    }

    pub fn tag_filter(&self) -> Result<TagInclusionFilter, ConfigError> {
        Ok(TagInclusionFilter::new(self.inclusive_tags.clone())?)
    }

    pub fn retention(&self) -> RetentionWindow {
        RetentionWindow::days(self.retention_days)
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
    }
}
