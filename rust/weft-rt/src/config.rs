//! Runtime configuration.
//!
//! The environment surface mirrors the classic launcher contract:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `WEFT_WORKERS` | worker count; must match the descriptor's seats |
//! | `WEFT_HPT_FILE` | path to the topology descriptor (required) |
//! | `WEFT_BIND_THREADS` | if set, pin worker *i* to hardware context *i* |
//! | `WEFT_STATS` | if set, print the startup banner and final statistics |
//! | `WEFT_DEQUE_CAPACITY` | per-deque slot count (power of two) |
//! | `WEFT_STACK_SIZE` | fiber stack size in bytes |
//!
//! Embedders (and tests) skip the environment entirely and hand a
//! [`Config`] to [`launch_with`](crate::runtime::launch_with), usually with
//! an inline [`TopologyDesc`].

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::place::{TopologyDesc, TopologyError};

const DEFAULT_DEQUE_CAPACITY: usize = 4096;
const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Problems resolving a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "WEFT_HPT_FILE must be set; write a topology descriptor or generate \
         a flat one for your platform"
    )]
    MissingTopology,
    #[error("environment variable {name} has unusable value {value:?}")]
    BadVar { name: &'static str, value: String },
    #[error("WEFT_WORKERS is {requested} but the topology seats {seats} workers")]
    WorkerMismatch { requested: usize, seats: usize },
    #[error("deque capacity {0} is not a power of two")]
    BadDequeCapacity(usize),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Runtime configuration. Construct with [`Config::default`] and the
/// builder-style setters, or from the environment with
/// [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker count; `0` means "infer" (topology seats, else one per
    /// hardware context).
    pub workers: usize,
    /// Topology descriptor file. Ignored when `topology` is set inline.
    pub hpt_file: Option<PathBuf>,
    /// Inline topology descriptor; takes precedence over `hpt_file`.
    pub topology: Option<TopologyDesc>,
    /// Pin worker `i` to hardware context `i mod contexts`, round-robin.
    pub bind_threads: bool,
    /// Print the startup banner and final statistics block.
    pub stats: bool,
    /// Slots per work deque; must be a power of two.
    pub deque_capacity: usize,
    /// Fiber stack size in bytes.
    pub stack_size: usize,
    /// Enable the communication queue and its designated worker.
    pub comm_worker: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            hpt_file: None,
            topology: None,
            bind_threads: false,
            stats: false,
            deque_capacity: DEFAULT_DEQUE_CAPACITY,
            stack_size: DEFAULT_STACK_SIZE,
            comm_worker: false,
        }
    }
}

impl Config {
    /// Read the configuration from `WEFT_*` environment variables.
    ///
    /// The topology descriptor file is mandatory on this path; a missing
    /// `WEFT_HPT_FILE` is a startup error with a user-facing message.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hpt_file = env::var_os("WEFT_HPT_FILE")
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingTopology)?;
        Ok(Self {
            workers: read_usize("WEFT_WORKERS")?.unwrap_or(0),
            hpt_file: Some(hpt_file),
            topology: None,
            bind_threads: env::var_os("WEFT_BIND_THREADS").is_some(),
            stats: env::var_os("WEFT_STATS").is_some(),
            deque_capacity: read_usize("WEFT_DEQUE_CAPACITY")?.unwrap_or(DEFAULT_DEQUE_CAPACITY),
            stack_size: read_usize("WEFT_STACK_SIZE")?.unwrap_or(DEFAULT_STACK_SIZE),
            comm_worker: false,
        })
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn topology(mut self, desc: TopologyDesc) -> Self {
        self.topology = Some(desc);
        self
    }

    pub fn hpt_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hpt_file = Some(path.into());
        self
    }

    pub fn bind_threads(mut self, bind: bool) -> Self {
        self.bind_threads = bind;
        self
    }

    pub fn stats(mut self, stats: bool) -> Self {
        self.stats = stats;
        self
    }

    pub fn deque_capacity(mut self, capacity: usize) -> Self {
        self.deque_capacity = capacity;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn comm_worker(mut self, enabled: bool) -> Self {
        self.comm_worker = enabled;
        self
    }

    /// Produce the topology this configuration describes and validate the
    /// numeric knobs against it.
    pub(crate) fn resolve_topology(&self) -> Result<TopologyDesc, ConfigError> {
        if !self.deque_capacity.is_power_of_two() {
            return Err(ConfigError::BadDequeCapacity(self.deque_capacity));
        }

        let desc = if let Some(desc) = &self.topology {
            desc.clone()
        } else if let Some(path) = &self.hpt_file {
            TopologyDesc::from_file(path)?
        } else {
            let workers = if self.workers == 0 {
                num_cpus::get().max(1)
            } else {
                self.workers
            };
            TopologyDesc::flat(workers)
        };

        let seats = desc.total_workers();
        if self.workers != 0 && self.workers != seats {
            return Err(ConfigError::WorkerMismatch {
                requested: self.workers,
                seats,
            });
        }
        Ok(desc)
    }

    /// Startup banner, printed when statistics are enabled.
    pub(crate) fn print_banner(&self, nworkers: usize, nplaces: usize) {
        println!("--------- weft runtime info ----------");
        println!(">>> workers      = {nworkers}");
        println!(">>> places       = {nplaces}");
        println!(
            ">>> hpt_file     = {}",
            self.hpt_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<inline>".into())
        );
        println!(">>> bind_threads = {}", self.bind_threads);
        println!(">>> comm_worker  = {}", self.comm_worker);
        if self.bind_threads {
            println!(
                "WARNING: WEFT_BIND_THREADS assigns hardware contexts round-robin; \
                 an undersized worker count can land every worker on one socket"
            );
        }
        println!("--------------------------------------");
    }
}

fn read_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::BadVar { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_flat_auto() {
        let cfg = Config::default();
        let desc = cfg.resolve_topology().unwrap();
        assert_eq!(desc.places.len(), 1);
        assert!(desc.total_workers() >= 1);
    }

    #[test]
    fn explicit_worker_count_shapes_the_flat_topology() {
        let cfg = Config::default().workers(3);
        let desc = cfg.resolve_topology().unwrap();
        assert_eq!(desc.total_workers(), 3);
    }

    #[test]
    fn inline_topology_wins_over_worker_count_mismatch() {
        let cfg = Config::default()
            .workers(5)
            .topology(TopologyDesc::flat(4));
        assert!(matches!(
            cfg.resolve_topology(),
            Err(ConfigError::WorkerMismatch {
                requested: 5,
                seats: 4
            })
        ));
    }

    #[test]
    fn matching_worker_count_passes_validation() {
        let cfg = Config::default()
            .workers(4)
            .topology(TopologyDesc::flat(4));
        assert_eq!(cfg.resolve_topology().unwrap().total_workers(), 4);
    }

    #[test]
    fn rejects_non_power_of_two_deque() {
        let cfg = Config::default().deque_capacity(100);
        assert!(matches!(
            cfg.resolve_topology(),
            Err(ConfigError::BadDequeCapacity(100))
        ));
    }

    #[test]
    fn descriptor_file_is_read_from_disk() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("weft-hpt-{}.toml", std::process::id()));
        std::fs::write(&path, "[[place]]\nworkers = 2\n").unwrap();

        let cfg = Config::default().hpt_file(&path);
        let desc = cfg.resolve_topology().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(desc.total_workers(), 2);
    }

    #[test]
    fn from_env_requires_the_descriptor_and_reads_the_knobs() {
        // Sequential phases in one test: the environment is process-global.
        env::remove_var("WEFT_HPT_FILE");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingTopology)
        ));

        let dir = std::env::temp_dir();
        let path = dir.join(format!("weft-env-hpt-{}.toml", std::process::id()));
        std::fs::write(&path, "[[place]]\nworkers = 2\n").unwrap();

        env::set_var("WEFT_HPT_FILE", &path);
        env::set_var("WEFT_WORKERS", "2");
        env::set_var("WEFT_STATS", "1");
        env::set_var("WEFT_DEQUE_CAPACITY", "64");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.workers, 2);
        assert!(cfg.stats);
        assert!(!cfg.bind_threads);
        assert_eq!(cfg.deque_capacity, 64);
        assert_eq!(cfg.resolve_topology().unwrap().total_workers(), 2);

        env::set_var("WEFT_WORKERS", "plenty");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::BadVar {
                name: "WEFT_WORKERS",
                ..
            })
        ));

        env::remove_var("WEFT_HPT_FILE");
        env::remove_var("WEFT_WORKERS");
        env::remove_var("WEFT_STATS");
        env::remove_var("WEFT_DEQUE_CAPACITY");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_descriptor_file_is_an_error() {
        let cfg = Config::default().hpt_file("/nonexistent/weft-hpt.toml");
        assert!(matches!(
            cfg.resolve_topology(),
            Err(ConfigError::Topology(TopologyError::Io(_)))
        ));
    }
}
