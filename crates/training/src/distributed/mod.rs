//! Process-group plumbing: who am I, how many of us, and how we combine values.
//!
//! Every collective is synchronous and must be entered by every rank in the
//! same order. A rank that diverges, disappears or times out turns the whole
//! group into an error; there is no partial continuation.

pub mod grad_sync;
pub mod in_process;
pub mod launch;
pub mod local;
pub mod tcp;

use std::{env, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{config::DistributedConfig, TrainingError};

pub use in_process::{InProcessCollective, InProcessGroup};
pub use launch::spawn_workers;
pub use local::LocalCollective;
pub use tcp::TcpCollective;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// A world of one; every collective is the identity.
    #[default]
    Local,
    /// Ranks are threads of one process.
    InProcess,
    /// Ranks are processes meeting at the rank-0 address.
    Tcp,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Local => "local",
            Backend::InProcess => "in_process",
            Backend::Tcp => "tcp",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Backend::Local),
            "in_process" | "thread" => Ok(Backend::InProcess),
            "tcp" | "gloo" => Ok(Backend::Tcp),
            other => Err(format!(
                "unknown backend '{other}' (expected local, in_process or tcp)"
            )),
        }
    }
}

/// Synchronous collectives over `f64` buffers.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replaces `values` on every rank with the element-wise sum over all ranks.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError>;

    /// Replaces `values` on every rank with the contents held by `root`.
    fn broadcast(&self, values: &mut [f64], root: usize) -> Result<(), TrainingError>;

    fn barrier(&self) -> Result<(), TrainingError> {
        self.all_reduce_sum(&mut [])
    }
}

/// Identity of this worker inside the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    backend: Backend,
}

impl DistributedContext {
    pub fn new(rank: usize, world_size: usize, backend: Backend) -> Result<Self, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization(
                "distributed world size must be at least 1",
            ));
        }
        if rank >= world_size {
            return Err(TrainingError::initialization(format!(
                "rank {rank} is outside world of size {world_size}"
            )));
        }
        if backend == Backend::Local && world_size != 1 {
            return Err(TrainingError::initialization(format!(
                "backend local cannot serve a world of size {world_size}"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            backend,
        })
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            backend: Backend::Local,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// The rank that owns shared artifacts such as checkpoints and telemetry.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

/// Fully resolved process-group settings after consulting the environment.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub world_size: usize,
    pub rank: usize,
    pub backend: Backend,
    pub address: String,
    pub timeout: Duration,
    pub spawn: bool,
}

impl GroupSettings {
    /// `env://` reads `WORLD_SIZE`, `RANK`, `MASTER_ADDR` and `MASTER_PORT` for unset values.
    pub fn resolve(config: &DistributedConfig) -> Result<Self, TrainingError> {
        let from_env = config.init_method.trim() == "env://";

        let world_size = match (config.world_size, from_env) {
            (Some(world_size), _) => world_size,
            (None, true) => read_env_usize("WORLD_SIZE")?,
            (None, false) => 1,
        };
        let rank = match (config.rank, from_env, config.spawn) {
            (Some(rank), _, _) => rank,
            (None, true, false) => read_env_usize("RANK")?,
            _ => 0,
        };

        let address = if from_env {
            let host = env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
            let port = env::var("MASTER_PORT").map_err(|_| {
                TrainingError::initialization("env:// initialization requires MASTER_PORT")
            })?;
            format!("{host}:{port}")
        } else if let Some(address) = config.init_method.trim().strip_prefix("tcp://") {
            address.to_string()
        } else {
            return Err(TrainingError::initialization(format!(
                "unsupported init method '{}' (expected tcp://HOST:PORT or env://)",
                config.init_method
            )));
        };

        let backend = if config.spawn {
            Backend::InProcess
        } else if world_size == 1 {
            Backend::Local
        } else {
            config.backend
        };

        if world_size > 1 && backend == Backend::Local {
            return Err(TrainingError::initialization(format!(
                "world size {world_size} requires backend tcp or distributed.spawn"
            )));
        }
        if backend == Backend::InProcess && !config.spawn {
            return Err(TrainingError::initialization(
                "backend in_process only exists for ranks launched with distributed.spawn",
            ));
        }

        Ok(Self {
            world_size,
            rank,
            backend,
            address,
            timeout: Duration::from_secs(config.timeout_secs),
            spawn: config.spawn,
        })
    }

    /// Joins the group for a non-spawned worker.
    pub fn connect(&self) -> Result<(DistributedContext, Arc<dyn Collective>), TrainingError> {
        let context = DistributedContext::new(self.rank, self.world_size, self.backend)?;
        let collective: Arc<dyn Collective> = match self.backend {
            Backend::Local => Arc::new(LocalCollective),
            Backend::Tcp => Arc::new(TcpCollective::connect(
                &self.address,
                self.rank,
                self.world_size,
                self.timeout,
            )?),
            Backend::InProcess => {
                return Err(TrainingError::initialization(
                    "in_process groups are created by the spawn launcher",
                ))
            }
        };
        Ok((context, collective))
    }
}

fn read_env_usize(name: &str) -> Result<usize, TrainingError> {
    let raw = env::var(name).map_err(|_| {
        TrainingError::initialization(format!("env:// initialization requires {name}"))
    })?;
    raw.trim().parse::<usize>().map_err(|err| {
        TrainingError::initialization(format!("invalid {name} value '{raw}': {err}"))
    })
}
