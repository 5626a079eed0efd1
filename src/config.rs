//! Server configuration record.
//!
//! Fields match spec.md section 6 "Environment/config". Built with a
//! chaining `with_*(mut self) -> Self` builder, a `Default` impl, and a
//! terminal `build()`.

use std::path::PathBuf;

use crate::engine::{Compression, TableOptions};
use crate::merge_ops::MergeOperator;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding per-table subdirectories and config files.
    pub data_dir: PathBuf,
    /// Optional structured-log file path (stdout/stderr only if `None`).
    pub log_file: Option<PathBuf>,
    /// Bind address for the request/reply (router) role.
    pub router_endpoint: String,
    /// Bind address for the pull (push/pull consumer) role.
    pub pull_endpoint: Option<String>,
    /// High-water-mark for internal (in-process) channels — spec.md 5.
    pub internal_hwm: usize,
    /// High-water-mark for each external connection's outbound queue.
    pub external_hwm: usize,
    /// Restrict listeners to IPv4 only.
    pub ipv4_only: bool,
    /// Default per-table engine options, used when neither the request nor
    /// a persisted config file specifies a value.
    pub default_table_options: TableOptions,
    /// Max ops per engine write batch (spec.md 4.4).
    pub put_batch_size: usize,
    /// Number of update-worker tasks (spec.md 4.4, default 3).
    pub update_worker_count: usize,
    /// Number of read-worker tasks (spec.md 4.5, default 3).
    pub read_worker_count: usize,
    /// Default chunk size for a passive scan job when the request omits it.
    pub default_chunk_size: u32,
    /// Grace period a job spends draining in-flight pulls after
    /// `wants_to_terminate` before it tears down (spec.md 4.7).
    pub job_grace_period: std::time::Duration,
    /// Interval between forced scrub passes (spec.md section 9, Open
    /// Question c).
    pub forced_scrub_interval: std::time::Duration,
    /// Static-file root for the optional HTTP façade. Not served by this
    /// crate (out of scope), kept only so the config record is complete.
    pub static_file_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            data_dir: PathBuf::from("./data"),
            log_file: None,
            router_endpoint: "127.0.0.1:7100".to_string(),
            pull_endpoint: None,
            internal_hwm: 250,
            external_hwm: 250,
            ipv4_only: false,
            default_table_options: TableOptions {
                lru_cache_size: 64 * 1024 * 1024,
                table_block_size: 4096,
                write_buffer_size: 64 * 1024 * 1024,
                bloom_filter_bits_per_key: 10,
                compression: Compression::None,
                merge_operator_code: MergeOperator::Replace as u8,
            },
            put_batch_size: 1000,
            update_worker_count: 3,
            read_worker_count: 3,
            default_chunk_size: 1000,
            job_grace_period: std::time::Duration::from_secs(1),
            forced_scrub_interval: std::time::Duration::from_secs(30),
            static_file_root: None,
        }
    }
}

/// Chaining builder over `ServerConfig`, following the `with_*(mut self) ->
/// Self` / terminal `build()` pattern.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        ServerConfigBuilder::default()
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    pub fn router_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.router_endpoint = endpoint.into();
        self
    }

    pub fn pull_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.pull_endpoint = Some(endpoint.into());
        self
    }

    pub fn internal_hwm(mut self, hwm: usize) -> Self {
        self.config.internal_hwm = hwm;
        self
    }

    pub fn external_hwm(mut self, hwm: usize) -> Self {
        self.config.external_hwm = hwm;
        self
    }

    pub fn ipv4_only(mut self) -> Self {
        self.config.ipv4_only = true;
        self
    }

    pub fn default_table_options(mut self, options: TableOptions) -> Self {
        self.config.default_table_options = options;
        self
    }

    pub fn put_batch_size(mut self, size: usize) -> Self {
        self.config.put_batch_size = size;
        self
    }

    pub fn update_worker_count(mut self, count: usize) -> Self {
        self.config.update_worker_count = count;
        self
    }

    pub fn read_worker_count(mut self, count: usize) -> Self {
        self.config.read_worker_count = count;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
