//! Data-parallel training across processes, GPUs or threads
//!
//! # Architecture
//!
//! The module uses a trait-based design with pluggable backends:
//!
//! - `ProcessGroup` - Core trait: rank queries, all-reduce, broadcast, barrier
//! - `SingleProcess` - No-op group for non-distributed runs
//! - `LocalGroup` - Ranks as threads in one process (`--nproc N`)
//! - `TcpGroup` - One process per rank, `env://` rendezvous at rank 0
//! - `NcclGroup` - NCCL communicators (feature-gated)
//! - `TracingGroup` - Records the collectives issued through any group
//!
//! On top of the groups sit rank-0 materialization of shared resources and
//! the `DistributedDataParallel` wrapper with its SGD optimizer.
//!
//! # Usage
//!
//! ```ignore
//! let env = DistEnv::from_env()?;
//! let group = create_process_group(&config, &env)?;
//!
//! let data = materialize_on_rank_zero(group.as_ref(), || download(dir), || load(dir))?;
//!
//! let ddp = DistributedDataParallel::wrap(&varmap, group.clone())?;
//! let mut sgd = ddp.optimizer(SgdConfig { lr, momentum, weight_decay: 0.0 });
//!
//! // In training loop:
//! sgd.backward_step(&loss)?;
//! ```

pub mod group;
pub mod env;
pub mod local;
pub mod tcp;
pub mod trace;
pub mod materialize;
pub mod ddp;

#[cfg(feature = "nccl")]
pub mod nccl;

// Re-exports for convenience
pub use group::{average_metrics, broadcast_usize, Backend, DistributedConfig, ProcessGroup, SingleProcess};
pub use env::DistEnv;
pub use local::{run_ranks, LocalGroup};
pub use tcp::TcpGroup;
pub use trace::TracingGroup;
pub use materialize::materialize_on_rank_zero;
pub use ddp::{DistributedDataParallel, DistributedSgd, SgdConfig};

#[cfg(feature = "nccl")]
pub use nccl::NcclGroup;

use std::sync::Arc;

/// Create the process group for one launched process
///
/// Thread-rank (`local`) groups are not created here: they need every rank's
/// handle at once, see [`LocalGroup::create`].
pub fn create_process_group(
    config: &DistributedConfig,
    env: &DistEnv,
) -> candle_core::Result<Arc<dyn ProcessGroup>> {
    if !env.is_distributed() {
        return Ok(Arc::new(SingleProcess::new(env.local_rank)));
    }

    match config.backend {
        Backend::Tcp => {
            let group = TcpGroup::connect(env, config.connect_timeout(), config.op_timeout())?;
            log::info!(
                "rank {}/{} joined tcp group at {}",
                env.rank,
                env.world_size,
                env.master_endpoint()
            );
            Ok(Arc::new(group))
        }
        Backend::Local => Err(candle_core::Error::Msg(format!(
            "WORLD_SIZE={} was set by a launcher, but the local backend runs ranks as threads. \
             Use --backend tcp for multi-process launches or --nproc for thread ranks.",
            env.world_size
        ))),
        #[cfg(feature = "nccl")]
        Backend::Nccl => {
            let bootstrap = TcpGroup::connect(env, config.connect_timeout(), config.op_timeout())?;
            Ok(Arc::new(NcclGroup::new(&bootstrap)?))
        }
        #[cfg(not(feature = "nccl"))]
        Backend::Nccl => {
            Err(candle_core::Error::Msg(
                "NCCL backend requested but 'nccl' feature is not enabled. \
                 Compile with --features nccl to enable NCCL support.".to_string()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_without_launcher() {
        let group = create_process_group(&DistributedConfig::default(), &DistEnv::single(2)).unwrap();
        assert_eq!(group.world_size(), 1);
        assert_eq!(group.local_rank(), 2);
    }

    #[test]
    fn test_local_backend_rejects_launcher_environment() {
        let env = DistEnv {
            world_size: 2,
            ..DistEnv::single(0)
        };
        let config = DistributedConfig {
            backend: Backend::Local,
            ..Default::default()
        };
        assert!(create_process_group(&config, &env).is_err());
    }
}
