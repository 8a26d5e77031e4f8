use std::net::SocketAddr;

use crate::build_info;
use crate::config::{Config, ConfigError, SinkKind};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Keeps a search index eventually consistent with an append-only source table",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[clap(long)]
    /// Run a single reconciliation cycle and exit
    pub once: bool,

    #[clap(long, value_enum, default_value_t = SinkKind::Index)]
    /// Destination for reloaded records
    pub sink: SinkKind,

    #[clap(long, default_value = "info")]
    /// Default log level when RUST_LOG is unset
    pub log_level: String,

    #[clap(long)]
    /// Override SOURCE_TABLE
    pub source_table: Option<String>,

    #[clap(long)]
    /// Override INDEX_URL
    pub index_url: Option<String>,

    #[clap(long)]
    /// Override INDEX_NAME
    pub index_name: Option<String>,

    #[clap(long)]
    /// Override RETENTION_DAYS
    pub retention_days: Option<u32>,

    #[clap(long)]
    /// Override MAX_SEGMENT_RECORDS
    pub max_segment_records: Option<u64>,

    #[clap(long)]
    /// Override SYNC_PERIOD_SECS
    pub sync_period_secs: Option<u64>,

    #[clap(long)]
    /// Override INCLUSIVE_TAGS
    pub inclusive_tags: Option<String>,

    #[clap(long)]
    /// Override METRICS_ADDR
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Layers command-line overrides on top of the environment and re-validates.
    pub fn apply_to(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(table) = &self.source_table {
            config.source_table = table.clone();
        }
        if let Some(url) = &self.index_url {
            config.index_url = url.clone();
        }
        if let Some(name) = &self.index_name {
            config.index_name = name.clone();
        }
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        if let Some(max) = self.max_segment_records {
            config.max_segment_records = max;
        }
        if let Some(secs) = self.sync_period_secs {
            config.sync_period = std::time::Duration::from_secs(secs);
        }
        if let Some(expression) = &self.inclusive_tags {
            config.inclusive_tags = expression.clone();
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = addr;
        }
        config.sink = self.sink;
        config.validate()
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
