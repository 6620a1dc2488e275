//! Worker pool management for the reconstruction pipeline
//!
//! Every data-parallel loop in lidarmesh runs on rayon. This module owns the
//! pool those loops execute on: callers configure it once with
//! [`init_thread_pool`] and run work inside it with [`execute_parallel`].
//!
//! ```rust
//! use lidarmesh_reconstruction::parallel::{execute_parallel, init_thread_pool, ThreadPoolConfig};
//!
//! fn main() -> lidarmesh_core::Result<()> {
//!     // Configure the worker pool with 4 threads and a larger stack
//!     let config = ThreadPoolConfig::default()
//!         .with_threads(4)
//!         .with_stack_size(16 * 1024 * 1024);
//!     init_thread_pool(config)?;
//!
//!     let total = execute_parallel(|| (0..1000u64).sum::<u64>())?;
//!     assert_eq!(total, 499_500);
//!     Ok(())
//! }
//! ```

use lidarmesh_core::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

static GLOBAL_THREAD_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
static SERIAL_THREAD_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
static THREAD_POOL_CONFIG: Mutex<ThreadPoolConfig> = Mutex::new(ThreadPoolConfig::new());

const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_NAME_PREFIX: &str = "lidarmesh-worker";

/// Thread pool configuration for parallel processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Number of threads to use (None = one per logical CPU)
    pub num_threads: Option<usize>,
    /// Thread stack size in bytes
    pub stack_size: Option<usize>,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Enable parallel processing (disable for debugging or profiling)
    pub enabled: bool,
    /// Inputs shorter than this are processed on the calling thread
    pub min_parallel_len: usize,
}

impl ThreadPoolConfig {
    const fn new() -> Self {
        Self {
            num_threads: None,
            stack_size: None,
            thread_name_prefix: String::new(),
            enabled: true,
            min_parallel_len: 256,
        }
    }

    /// Set number of threads
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Enable or disable parallel processing
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(Error::Config(
                "thread pool needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            stack_size: Some(DEFAULT_STACK_SIZE),
            thread_name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            enabled: true,
            min_parallel_len: 256,
        }
    }
}

fn build_pool(config: &ThreadPoolConfig, num_threads: usize) -> Result<ThreadPool> {
    let mut builder = ThreadPoolBuilder::new().num_threads(num_threads);

    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let prefix = if config.thread_name_prefix.is_empty() {
        DEFAULT_NAME_PREFIX.to_string()
    } else {
        config.thread_name_prefix.clone()
    };
    builder = builder.thread_name(move |index| format!("{}-{}", prefix, index));

    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to create thread pool: {}", e)))
}

/// Initialize the global thread pool with custom configuration
///
/// The pool can only be built once per process; later calls keep the
/// existing pool and only update the `enabled` and `min_parallel_len`
/// settings.
pub fn init_thread_pool(config: ThreadPoolConfig) -> Result<()> {
    config.validate()?;

    if GLOBAL_THREAD_POOL.get().is_none() {
        let threads = config.num_threads.unwrap_or_else(num_cpus::get);
        let pool = Arc::new(build_pool(&config, threads)?);
        if GLOBAL_THREAD_POOL.set(pool).is_ok() {
            debug!(threads, "initialized worker pool");
        }
    }

    if let Ok(mut global_config) = THREAD_POOL_CONFIG.lock() {
        *global_config = config;
    }

    Ok(())
}

/// Get the global thread pool, initializing with defaults if needed
pub fn get_thread_pool() -> Result<Arc<ThreadPool>> {
    if let Some(pool) = GLOBAL_THREAD_POOL.get() {
        return Ok(pool.clone());
    }
    let config = ThreadPoolConfig::default();
    let pool = Arc::new(build_pool(&config, num_cpus::get())?);
    Ok(GLOBAL_THREAD_POOL.get_or_init(|| pool).clone())
}

fn get_serial_pool() -> Result<Arc<ThreadPool>> {
    if let Some(pool) = SERIAL_THREAD_POOL.get() {
        return Ok(pool.clone());
    }
    let pool = Arc::new(build_pool(&get_config(), 1)?);
    Ok(SERIAL_THREAD_POOL.get_or_init(|| pool).clone())
}

/// Get current thread pool configuration
pub fn get_config() -> ThreadPoolConfig {
    THREAD_POOL_CONFIG
        .lock()
        .map(|config| config.clone())
        .unwrap_or_else(|_| ThreadPoolConfig::default())
}

/// Check if parallel processing is enabled
pub fn is_parallel_enabled() -> bool {
    get_config().enabled
}

/// Run `op` inside the configured worker pool
///
/// Every rayon iterator started by `op` runs on that pool. With parallelism
/// disabled `op` runs on a single worker thread instead.
pub fn execute_parallel<F, R>(op: F) -> Result<R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let pool = if is_parallel_enabled() {
        get_thread_pool()?
    } else {
        get_serial_pool()?
    };
    Ok(pool.install(op))
}

/// Parallel map that preserves input order
pub fn parallel_map<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync + Send,
{
    if data.len() < get_config().min_parallel_len {
        return data.iter().map(f).collect();
    }

    data.par_iter().map(f).collect()
}

/// Parallel map with index
pub fn parallel_map_indexed<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(usize, &T) -> U + Sync + Send,
{
    if data.len() < get_config().min_parallel_len {
        return data.iter().enumerate().map(|(i, x)| f(i, x)).collect();
    }

    data.par_iter().enumerate().map(|(i, x)| f(i, x)).collect()
}
