//! Server configuration.
//!
//! All knobs fall back to built-in defaults and can be overridden through
//! environment variables (a `.env` file is loaded by `main`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Directory holding uploaded input parts and concat manifests
    pub input_dir: PathBuf,
    /// Directory holding assembled output files
    pub output_dir: PathBuf,
    /// Maximum number of tracked jobs per client address
    pub max_jobs_per_address: usize,
    /// Maximum declared size of a single uploaded part, in bytes
    pub max_part_size: u64,
    /// Maximum number of simultaneously rendering jobs
    pub max_concurrency: usize,
    /// Interval between dispatch ticks
    pub dispatch_interval: Duration,
    /// Global cap on concurrent download streams
    pub max_streams: usize,
    /// Chunk size used when streaming an output file
    pub stream_chunk_size: usize,
    /// Delete an output file after a fully successful download
    pub delete_after_send: bool,
    /// Age after which swept outputs and terminal jobs are evicted
    pub cache_retention: Duration,
    /// Interval between cache sweeps
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            input_dir: PathBuf::from("vid_in"),
            output_dir: PathBuf::from("vid_out"),
            max_jobs_per_address: 5,
            max_part_size: 40 * 1024 * 1024,
            max_concurrency: 4,
            dispatch_interval: Duration::from_millis(500),
            max_streams: 10,
            stream_chunk_size: 64 * 1024,
            delete_after_send: true,
            cache_retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars: `BIND_ADDRESS`, `PORT`, `ENABLE_CORS`, `INPUT_DIR`,
    /// `OUTPUT_DIR`, `MAX_JOBS_PER_ADDRESS`, `MAX_PART_SIZE`,
    /// `MAX_CONCURRENCY`, `DISPATCH_INTERVAL_MS`, `MAX_STREAMS`,
    /// `STREAM_CHUNK_SIZE`, `DELETE_AFTER_SEND`, `CACHE_RETENTION_SECS`,
    /// `SWEEP_INTERVAL_SECS`.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(bind_address) = std::env::var("BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address;
        }
        if let Ok(dir) = std::env::var("INPUT_DIR")
            && !dir.trim().is_empty()
        {
            config.input_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("OUTPUT_DIR")
            && !dir.trim().is_empty()
        {
            config.output_dir = PathBuf::from(dir);
        }

        if let Some(port) = env_parse("PORT") {
            config.port = port;
        }
        if let Some(enable_cors) = env_parse("ENABLE_CORS") {
            config.enable_cors = enable_cors;
        }
        if let Some(max_jobs) = env_parse("MAX_JOBS_PER_ADDRESS") {
            config.max_jobs_per_address = max_jobs;
        }
        if let Some(max_part_size) = env_parse("MAX_PART_SIZE") {
            config.max_part_size = max_part_size;
        }
        if let Some(max_concurrency) = env_parse("MAX_CONCURRENCY") {
            config.max_concurrency = max_concurrency;
        }
        if let Some(millis) = env_parse("DISPATCH_INTERVAL_MS") {
            config.dispatch_interval = Duration::from_millis(millis);
        }
        if let Some(max_streams) = env_parse("MAX_STREAMS") {
            config.max_streams = max_streams;
        }
        if let Some(chunk) = env_parse("STREAM_CHUNK_SIZE") {
            config.stream_chunk_size = chunk;
        }
        if let Some(delete) = env_parse("DELETE_AFTER_SEND") {
            config.delete_after_send = delete;
        }
        if let Some(secs) = env_parse("CACHE_RETENTION_SECS") {
            config.cache_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
