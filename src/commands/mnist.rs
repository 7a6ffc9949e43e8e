//! MNIST training: small conv net, distributed sampler, per-epoch test on rank 0

use anyhow::Result;
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use std::sync::Arc;

use super::{apply_override, launch, seed_device, DistArgs};
use crate::config::MnistConfig;
use crate::data::{
    into_loader, prepare_dataset, DataLoader, DatasetKind, DistributedSampler, EpochLoader, Normalization, Preprocess,
};
use crate::distributed::{DistributedDataParallel, ProcessGroup, SgdConfig};
use crate::model::Net;
use crate::trainer::{Progress, RankGate, Trainer};

#[derive(Args, Debug)]
pub struct MnistArgs {
    /// Input batch size for training (default: 64)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Input batch size for testing (default: 1000)
    #[arg(long)]
    pub test_batch_size: Option<usize>,

    /// Number of epochs to train (default: 10)
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Learning rate (default: 0.01)
    #[arg(long)]
    pub lr: Option<f64>,

    /// SGD momentum (default: 0.5)
    #[arg(long)]
    pub momentum: Option<f64>,

    /// How many batches to wait before logging training status (default: 10)
    #[arg(long)]
    pub log_interval: Option<usize>,

    #[command(flatten)]
    pub dist: DistArgs,
}

impl MnistArgs {
    fn resolve(&self, mut cfg: MnistConfig) -> Result<MnistConfig> {
        apply_override("batch_size", &mut cfg.batch_size, self.batch_size);
        apply_override("test_batch_size", &mut cfg.test_batch_size, self.test_batch_size);
        apply_override("epochs", &mut cfg.epochs, self.epochs);
        apply_override("lr", &mut cfg.lr, self.lr);
        apply_override("momentum", &mut cfg.momentum, self.momentum);
        apply_override("log_interval", &mut cfg.log_interval, self.log_interval);
        apply_override("seed", &mut cfg.seed, self.dist.seed);
        apply_override("datadir", &mut cfg.datadir, self.dist.datadir.clone());
        apply_override("prefetch", &mut cfg.prefetch, self.dist.prefetch);
        cfg.target_device = self.dist.target_device(cfg.target_device);
        cfg.validate()?;
        Ok(cfg)
    }
}

pub fn run_mnist(args: MnistArgs) -> Result<()> {
    let file = args.dist.load()?;
    let cfg = args.resolve(file.mnist)?;
    let dist = file.distributed;

    launch(&dist, args.dist.local_rank, cfg.target_device, |group| train_rank(&cfg, group))
}

/// `Train Epoch: 1 [640/60000 (1%)]\tLoss: 2.301234`
pub fn train_line(epoch: usize, seen: usize, dataset_len: usize, batch: usize, num_batches: usize, loss: f64) -> String {
    format!(
        "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
        epoch,
        seen,
        dataset_len,
        100.0 * batch as f64 / num_batches.max(1) as f64,
        loss
    )
}

/// `Test set: Average loss: 0.1000, Accuracy: 9700/10000 (97%)`
pub fn test_line(mean_loss: f64, correct: usize, total: usize) -> String {
    format!(
        "Test set: Average loss: {:.4}, Accuracy: {}/{} ({:.0}%)",
        mean_loss,
        correct,
        total,
        100.0 * correct as f64 / total.max(1) as f64
    )
}

fn train_rank(cfg: &MnistConfig, group: Arc<dyn ProcessGroup>) -> Result<()> {
    let gate = RankGate::new(group.rank());
    let progress = Progress::lines(gate);

    let device = cfg.target_device.resolve(group.local_rank())?;
    seed_device(&device, cfg.seed)?;
    log::info!("rank {}/{} using {:?}", group.rank(), group.world_size(), device);

    // Rank 0 downloads; the rest wait on the barrier
    let splits = prepare_dataset(DatasetKind::Mnist, &cfg.datadir, group.as_ref())?;
    let train = Arc::new(splits.train);
    let test = Arc::new(splits.test);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Net::new(vb)?;

    let ddp = DistributedDataParallel::wrap(&varmap, group.clone())?;
    let sgd = ddp.optimizer(SgdConfig {
        lr: cfg.lr,
        momentum: cfg.momentum,
        weight_decay: 0.0,
    });
    let mut trainer = Trainer::new(&model, sgd, device.clone());

    let mut sampler = DistributedSampler::new(train.len(), group.world_size(), group.rank()).with_seed(cfg.seed);
    let preprocess = Preprocess::eval(Normalization::MNIST);

    for epoch in 1..=cfg.epochs {
        sampler.set_epoch(epoch as u64);
        let indices = sampler.indices();
        let base = EpochLoader::new(
            Arc::clone(&train),
            indices,
            cfg.batch_size,
            preprocess,
            cfg.seed.wrapping_add(epoch as u64),
        );
        let num_batches = base.num_batches();
        let mut loader = into_loader(base, cfg.prefetch)?;

        trainer.train_epoch(loader.as_mut(), num_batches, &|_| cfg.lr, |step| {
            if step.batch % cfg.log_interval == 0 {
                progress.println(train_line(
                    epoch,
                    step.batch * step.samples,
                    train.len(),
                    step.batch,
                    num_batches,
                    step.loss,
                ));
            }
        })?;

        // Test pass is rank-local, no collectives
        gate.on_primary(|| -> Result<()> {
            let mut loader = into_loader(
                EpochLoader::sequential(Arc::clone(&test), cfg.test_batch_size, preprocess),
                cfg.prefetch,
            )?;
            let stats = trainer.evaluate(loader.as_mut(), usize::MAX)?;
            progress.println(format!("\n{}\n", test_line(stats.mean_loss(), stats.correct, stats.samples)));
            Ok(())
        })
        .transpose()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistributedConfig, FileConfig, TargetDevice};
    use crate::data::dataset::write_idx_files;
    use crate::distributed::Backend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_log_line_formats() {
        assert_eq!(
            train_line(1, 640, 60000, 10, 938, 2.25),
            "Train Epoch: 1 [640/60000 (1%)]\tLoss: 2.250000"
        );
        assert_eq!(
            test_line(0.10004, 9700, 10000),
            "Test set: Average loss: 0.1000, Accuracy: 9700/10000 (97%)"
        );
    }

    #[test]
    fn test_cli_values_override_file_defaults() {
        let args = MnistArgs {
            batch_size: Some(128),
            test_batch_size: None,
            epochs: Some(2),
            lr: None,
            momentum: None,
            log_interval: None,
            dist: DistArgs {
                config: None,
                backend: None,
                nproc: None,
                trace_collectives: false,
                headless: false,
                prefetch: Some(0),
                no_cuda: true,
                seed: Some(7),
                datadir: None,
                local_rank: 0,
            },
        };
        let cfg = args.resolve(FileConfig::default().mnist).unwrap();
        assert_eq!(cfg.batch_size, 128);
        assert_eq!(cfg.test_batch_size, 1000);
        assert_eq!(cfg.epochs, 2);
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.prefetch, 0);
        assert_eq!(cfg.target_device, crate::config::TargetDevice::Cpu);
    }

    #[test]
    fn test_three_thread_ranks_train_and_test() {
        let dir = tempfile::tempdir().unwrap();
        write_idx_files(&DatasetKind::Mnist.dir(dir.path()), 48, 20).unwrap();

        let cfg = MnistConfig {
            batch_size: 8,
            test_batch_size: 16,
            epochs: 2,
            log_interval: 1,
            datadir: dir.path().to_path_buf(),
            target_device: TargetDevice::Cpu,
            prefetch: 1,
            ..Default::default()
        };
        let dist = DistributedConfig {
            backend: Backend::Local,
            nproc: 3,
            trace_collectives: true,
            ..Default::default()
        };

        let finished = AtomicUsize::new(0);
        launch(&dist, 0, cfg.target_device, |group| {
            train_rank(&cfg, group)?;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }
}
