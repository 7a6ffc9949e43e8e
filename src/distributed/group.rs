//! Core trait and types for collective communication
//!
//! This module defines the `ProcessGroup` trait that every transport backend
//! implements, the configuration used to select a backend, and a few scalar
//! helpers built on top of the raw collectives.

use candle_core::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_connect_timeout_secs() -> u64 { 300 }
fn default_nproc() -> usize { 1 }

/// Collective transport selection
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One process per rank, star topology over TCP rooted at rank 0
    #[default]
    Tcp,
    /// Ranks are threads inside a single process
    Local,
    /// NCCL communicators (requires the 'nccl' feature and CUDA)
    Nccl,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "env" | "gloo" => Ok(Backend::Tcp),
            "local" | "threads" => Ok(Backend::Local),
            "nccl" => Ok(Backend::Nccl),
            _ => Err(format!("Unknown backend: {}. Valid options: tcp, local, nccl", s)),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Tcp => write!(f, "tcp"),
            Backend::Local => write!(f, "local"),
            Backend::Nccl => write!(f, "nccl"),
        }
    }
}

/// Configuration for distributed training
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributedConfig {
    /// Collective backend
    #[serde(default)]
    pub backend: Backend,

    /// Number of thread ranks for the local backend
    #[serde(default = "default_nproc")]
    pub nproc: usize,

    /// How long non-zero ranks keep retrying the rendezvous with rank 0
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-collective timeout; `None` blocks until the transport gives up
    #[serde(default)]
    pub op_timeout_secs: Option<u64>,

    /// Record every collective call and report per-kind counts at exit
    #[serde(default)]
    pub trace_collectives: bool,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            nproc: default_nproc(),
            connect_timeout_secs: default_connect_timeout_secs(),
            op_timeout_secs: None,
            trace_collectives: false,
        }
    }
}

impl DistributedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_secs.map(Duration::from_secs)
    }
}

/// The kind of a collective operation, as seen by every participating rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    AllReduce,
    Broadcast { root: usize },
    Barrier,
}

/// One collective call: what was requested and on how many elements.
///
/// Every rank must issue the same sequence of calls; backends compare these
/// to detect divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveCall {
    pub kind: CollectiveKind,
    pub len: usize,
}

impl CollectiveCall {
    pub fn all_reduce(len: usize) -> Self {
        Self { kind: CollectiveKind::AllReduce, len }
    }

    pub fn broadcast(len: usize, root: usize) -> Self {
        Self { kind: CollectiveKind::Broadcast { root }, len }
    }

    pub fn barrier() -> Self {
        Self { kind: CollectiveKind::Barrier, len: 1 }
    }
}

/// A set of cooperating ranks that can run collectives together.
///
/// Every rank in the group must invoke the same collectives in the same order
/// and with the same element counts, otherwise the group deadlocks or fails.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync` so a group can be shared between the
/// training loop and its helpers behind an `Arc`.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this process in `0..world_size`
    fn rank(&self) -> usize;

    /// Total number of ranks
    fn world_size(&self) -> usize;

    /// Device index on this host (defaults to the global rank)
    fn local_rank(&self) -> usize {
        self.rank()
    }

    /// In-place element-wise sum across all ranks
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Overwrite `buf` on every rank with the contents held by `root`
    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<()>;

    /// Block until every rank has arrived.
    ///
    /// Implemented as an all-reduce of a single dummy value.
    fn barrier(&self) -> Result<()> {
        let mut dummy = [0.0f32];
        self.all_reduce_sum(&mut dummy)
    }

    /// Check if this is the primary rank (rank 0)
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Check if distributed training is actually active
    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}

/// Trivial group for single-process runs: every collective is the identity.
#[derive(Debug, Clone, Default)]
pub struct SingleProcess {
    local_rank: usize,
}

impl SingleProcess {
    pub fn new(local_rank: usize) -> Self {
        Self { local_rank }
    }
}

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [f32], root: usize) -> Result<()> {
        if root != 0 {
            return Err(candle_core::Error::Msg(format!(
                "broadcast root {} out of range for a single-process group",
                root
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Average scalar metrics across all ranks in place
pub fn average_metrics(group: &dyn ProcessGroup, metrics: &mut [f64]) -> Result<()> {
    if !group.is_distributed() || metrics.is_empty() {
        return Ok(());
    }
    let mut buf: Vec<f32> = metrics.iter().map(|&m| m as f32).collect();
    group.all_reduce_sum(&mut buf)?;
    let scale = 1.0 / group.world_size() as f64;
    for (m, v) in metrics.iter_mut().zip(buf) {
        *m = v as f64 * scale;
    }
    Ok(())
}

/// Broadcast a single integer held by `root` to every rank
pub fn broadcast_usize(group: &dyn ProcessGroup, value: usize, root: usize) -> Result<usize> {
    if !group.is_distributed() {
        return Ok(value);
    }
    // f32 holds integers exactly up to 2^24, far above any epoch count.
    let mut buf = [value as f32];
    group.broadcast(&mut buf, root)?;
    Ok(buf[0].round() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("tcp".parse::<Backend>().unwrap(), Backend::Tcp);
        assert_eq!("env".parse::<Backend>().unwrap(), Backend::Tcp);
        assert_eq!("LOCAL".parse::<Backend>().unwrap(), Backend::Local);
        assert_eq!("nccl".parse::<Backend>().unwrap(), Backend::Nccl);
        assert!("mpi".parse::<Backend>().is_err());
    }

    #[test]
    fn test_single_process_collectives_are_identity() {
        let group = SingleProcess::new(3);
        let mut buf = [1.0f32, 2.0, 3.0];
        group.all_reduce_sum(&mut buf).unwrap();
        group.broadcast(&mut buf, 0).unwrap();
        group.barrier().unwrap();
        assert_eq!(buf, [1.0, 2.0, 3.0]);
        assert_eq!(group.local_rank(), 3);
        assert!(group.is_primary());
        assert!(!group.is_distributed());
        assert!(group.broadcast(&mut buf, 1).is_err());
    }

    #[test]
    fn test_scalar_helpers_without_distribution() {
        let group = SingleProcess::default();
        let mut metrics = [0.5, 0.25];
        average_metrics(&group, &mut metrics).unwrap();
        assert_eq!(metrics, [0.5, 0.25]);
        assert_eq!(broadcast_usize(&group, 7, 0).unwrap(), 7);
    }

    #[test]
    fn test_config_defaults_from_empty_yaml() {
        let config: DistributedConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.backend, Backend::Tcp);
        assert_eq!(config.nproc, 1);
        assert_eq!(config.connect_timeout(), Duration::from_secs(300));
        assert_eq!(config.op_timeout(), None);
    }
}
