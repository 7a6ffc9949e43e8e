//! CLI subcommands for mnode
//!
//! - `mnist` - PyTorch-style MNIST training with a distributed sampler
//! - `fashion-mnist` - WideResNet on Fashion-MNIST with LR warmup and resume
//!
//! Both share the distributed flags in [`DistArgs`] and the [`launch`] helper,
//! which creates the process group(s) and runs the training body once per rank.

pub mod mnist;
pub mod fashion;

pub use mnist::{run_mnist, MnistArgs};
pub use fashion::{run_fashion, FashionArgs};

use anyhow::Result;
use candle_core::Device;
use clap::Args;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{DistributedConfig, FileConfig, TargetDevice};
use crate::distributed::{
    create_process_group, env::env_has_local_rank, run_ranks, Backend, DistEnv, LocalGroup, ProcessGroup,
    TracingGroup,
};

/// Flags shared by every training subcommand
#[derive(Args, Debug, Clone)]
pub struct DistArgs {
    /// YAML run file; command-line flags override its values
    #[arg(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Collective backend: tcp, local or nccl
    #[arg(long)]
    pub backend: Option<Backend>,

    /// Thread ranks to start with the local backend
    #[arg(long)]
    pub nproc: Option<usize>,

    /// Record collectives and log per-kind counts at exit
    #[arg(long)]
    pub trace_collectives: bool,

    /// Emit JSON lines instead of progress bars
    #[arg(long)]
    pub headless: bool,

    /// Batches to prefetch on a worker thread (0 = disabled)
    #[arg(long)]
    pub prefetch: Option<usize>,

    /// Disables CUDA training
    #[arg(long)]
    pub no_cuda: bool,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Dataset root directory
    #[arg(long)]
    pub datadir: Option<PathBuf>,

    /// Device index on this host; LOCAL_RANK from the launcher wins
    #[arg(long = "local-rank", alias = "local_rank", default_value_t = 0)]
    pub local_rank: usize,
}

impl DistArgs {
    /// Load the run file (if any) and apply the distributed overrides
    pub fn load(&self) -> Result<FileConfig> {
        let mut file = FileConfig::load(self.config.as_deref())?;
        let dist = &mut file.distributed;
        apply_override("backend", &mut dist.backend, self.backend);
        apply_override("nproc", &mut dist.nproc, self.nproc);
        if self.trace_collectives {
            dist.trace_collectives = true;
        }
        file.validate()?;
        Ok(file)
    }

    pub fn target_device(&self, configured: TargetDevice) -> TargetDevice {
        if self.no_cuda {
            TargetDevice::from_no_cuda(true)
        } else {
            configured
        }
    }
}

/// Replace `slot` with a command-line value, noting the change
pub(crate) fn apply_override<T: PartialEq + Debug>(name: &str, slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        if *slot != value {
            log::info!("CLI override: {} = {:?} (was {:?})", name, value, slot);
        }
        *slot = value;
    }
}

/// Seed the device generator; CPU tensors draw from the thread RNG
pub(crate) fn seed_device(device: &Device, seed: u64) -> candle_core::Result<()> {
    if device.is_cuda() {
        device.set_seed(seed)?;
    }
    Ok(())
}

/// Abort early when NCCL would run without CUDA
pub(crate) fn check_backend_device(dist: &DistributedConfig, target: TargetDevice) -> Result<()> {
    let cuda = target == TargetDevice::Gpu && candle_core::utils::cuda_is_available();
    if dist.backend == Backend::Nccl && !cuda {
        anyhow::bail!("Distributed mode with the nccl backend requires running with CUDA");
    }
    Ok(())
}

/// Run `body` once per rank.
///
/// - `local` backend with `nproc > 1`: one thread per rank in this process
/// - otherwise: rank and world size come from the launcher environment
pub fn launch<F>(dist: &DistributedConfig, local_rank: usize, target: TargetDevice, body: F) -> Result<()>
where
    F: Fn(Arc<dyn ProcessGroup>) -> Result<()> + Sync,
{
    if dist.backend == Backend::Local && dist.nproc > 1 {
        log::info!("starting {} thread ranks", dist.nproc);
        let groups = LocalGroup::create_with_timeout(dist.nproc, dist.op_timeout());
        let results = run_ranks(groups, |group| {
            run_rank(Arc::new(group), dist.trace_collectives, &body)
        })?;
        return results.into_iter().collect();
    }

    let env = DistEnv::from_env()?.with_local_rank_fallback(local_rank, env_has_local_rank());
    if env.is_distributed() {
        check_backend_device(dist, target)?;
    }
    let group = create_process_group(dist, &env)?;
    run_rank(group, dist.trace_collectives, &body)
}

fn run_rank<F>(group: Arc<dyn ProcessGroup>, trace: bool, body: &F) -> Result<()>
where
    F: Fn(Arc<dyn ProcessGroup>) -> Result<()>,
{
    if !trace {
        return body(group);
    }
    let traced = Arc::new(TracingGroup::new(group));
    let shared: Arc<dyn ProcessGroup> = traced.clone();
    let result = body(shared);
    traced.log_summary();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn args() -> DistArgs {
        DistArgs {
            config: None,
            backend: None,
            nproc: None,
            trace_collectives: false,
            headless: true,
            prefetch: None,
            no_cuda: true,
            seed: None,
            datadir: None,
            local_rank: 0,
        }
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut value = 4usize;
        apply_override("nproc", &mut value, None);
        assert_eq!(value, 4);
        apply_override("nproc", &mut value, Some(2));
        assert_eq!(value, 2);

        let mut a = args();
        a.backend = Some(Backend::Local);
        a.nproc = Some(3);
        a.trace_collectives = true;
        let file = a.load().unwrap();
        assert_eq!(file.distributed.backend, Backend::Local);
        assert_eq!(file.distributed.nproc, 3);
        assert!(file.distributed.trace_collectives);
    }

    #[test]
    fn test_nccl_requires_cuda_device() {
        let dist = DistributedConfig {
            backend: Backend::Nccl,
            ..Default::default()
        };
        assert!(check_backend_device(&dist, TargetDevice::Cpu).is_err());
        assert!(check_backend_device(&DistributedConfig::default(), TargetDevice::Cpu).is_ok());
    }

    #[test]
    fn test_launch_local_runs_every_rank() {
        let dist = DistributedConfig {
            backend: Backend::Local,
            nproc: 3,
            trace_collectives: true,
            ..Default::default()
        };
        let started = AtomicUsize::new(0);
        launch(&dist, 0, TargetDevice::Cpu, |group| {
            started.fetch_add(1, Ordering::SeqCst);
            let mut buf = [group.rank() as f32];
            group.all_reduce_sum(&mut buf)?;
            assert_eq!(buf[0], 3.0);
            Ok(())
        })
        .unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_launch_reports_rank_failure() {
        let dist = DistributedConfig {
            backend: Backend::Local,
            nproc: 2,
            ..Default::default()
        };
        let result = launch(&dist, 0, TargetDevice::Cpu, |group| {
            if group.rank() == 1 {
                anyhow::bail!("rank 1 failed");
            }
            Ok(())
        });
        assert!(result.is_err());
    }
}
