//! Fashion-MNIST training: WideResNet-16-10, warmup then step-decayed LR,
//! per-epoch validation and checkpoints with resume

use anyhow::{Context, Result};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

use super::{apply_override, launch, seed_device, DistArgs};
use crate::config::{self, CheckpointMeta, FashionConfig};
use crate::data::{
    cycle_to, into_loader, prepare_dataset, Augment, DatasetKind, DistributedSampler, EpochLoader, ImageDataset,
    Normalization, Preprocess,
};
use crate::distributed::{average_metrics, broadcast_usize, DistributedDataParallel, ProcessGroup, SgdConfig};
use crate::model::{Describe, WideResNet};
use crate::schedule::LrSchedule;
use crate::trainer::{format_duration, Checkpointer, MetricsLog, Progress, RankGate, Trainer};

const GRAPHDEF_FILE: &str = "graphdef";
const PROFRUN_STEPS: usize = 4;

#[derive(Args, Debug)]
pub struct FashionArgs {
    /// Checkpoint and metrics directory (default: ./logs)
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,

    /// Input batch size for training (default: 32)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Input batch size for validation (default: 32)
    #[arg(long)]
    pub val_batch_size: Option<usize>,

    /// Number of epochs to train (default: 40)
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Learning rate for a single rank (default: 0.01)
    #[arg(long)]
    pub base_lr: Option<f64>,

    /// SGD momentum (default: 0.9)
    #[arg(long)]
    pub momentum: Option<f64>,

    /// L2 weight decay on kernels (default: 0.000005)
    #[arg(long)]
    pub wd: Option<f64>,

    /// Number of warmup epochs (default: 5)
    #[arg(long)]
    pub warmup_epochs: Option<f64>,

    /// Keep at most this many checkpoints (0 = all)
    #[arg(long)]
    pub max_checkpoints: Option<usize>,

    /// Save the trained weights and a YAML layer graph as STEM.safetensors / STEM.yaml
    #[arg(long, value_name = "STEM", num_args = 0..=1, default_missing_value = GRAPHDEF_FILE)]
    pub savegraph: Option<String>,

    /// Run only a few steps per epoch (for profiling)
    #[arg(long)]
    pub profrun: bool,

    #[command(flatten)]
    pub dist: DistArgs,
}

impl FashionArgs {
    fn resolve(&self, mut cfg: FashionConfig) -> Result<FashionConfig> {
        apply_override("log_dir", &mut cfg.log_dir, self.log_dir.clone());
        apply_override("batch_size", &mut cfg.batch_size, self.batch_size);
        apply_override("val_batch_size", &mut cfg.val_batch_size, self.val_batch_size);
        apply_override("epochs", &mut cfg.epochs, self.epochs);
        apply_override("base_lr", &mut cfg.base_lr, self.base_lr);
        apply_override("momentum", &mut cfg.momentum, self.momentum);
        apply_override("wd", &mut cfg.wd, self.wd);
        apply_override("warmup_epochs", &mut cfg.warmup_epochs, self.warmup_epochs);
        apply_override("max_checkpoints", &mut cfg.max_checkpoints, self.max_checkpoints);
        apply_override("seed", &mut cfg.seed, self.dist.seed);
        apply_override("datadir", &mut cfg.datadir, self.dist.datadir.clone());
        apply_override("prefetch", &mut cfg.prefetch, self.dist.prefetch);
        cfg.target_device = self.dist.target_device(cfg.target_device);
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Options that only change how a run reports, not what it trains
struct RunOptions {
    headless: bool,
    profrun: bool,
    savegraph: Option<String>,
}

pub fn run_fashion(args: FashionArgs) -> Result<()> {
    let file = args.dist.load()?;
    let cfg = args.resolve(file.fashion_mnist)?;
    let dist = file.distributed;
    let opts = RunOptions {
        headless: args.dist.headless,
        profrun: args.profrun,
        savegraph: args.savegraph.clone(),
    };

    launch(&dist, args.dist.local_rank, cfg.target_device, |group| {
        train_rank(&cfg, &opts, group)
    })
}

/// Steps per epoch and validation steps for `world_size` ranks, each rank
/// drawing full batches from its own copy of the data
pub fn epoch_steps(train_batches: usize, test_batches: usize, world_size: usize, profrun: bool) -> (usize, usize) {
    let world_size = world_size.max(1);
    let steps = if profrun {
        PROFRUN_STEPS
    } else {
        (train_batches / world_size).max(1)
    };
    let validation_steps = (3 * test_batches / world_size).max(1);
    (steps, validation_steps)
}

/// Newest checkpoint on rank 0, agreed on by every rank
fn resume_epoch(group: &dyn ProcessGroup, log_dir: &Path, epochs: usize) -> Result<usize> {
    let local = RankGate::new(group.rank())
        .on_primary(|| config::find_resume_epoch(log_dir, epochs))
        .unwrap_or(0);
    Ok(broadcast_usize(group, local, 0)?)
}

/// Shuffled indices for one rank and epoch
fn shuffled(len: usize, seed: u64, rank: usize, epoch: usize) -> Vec<usize> {
    let mut sampler = DistributedSampler::new(len, 1, 0).with_seed(seed.wrapping_add(1_000_003 * rank as u64));
    sampler.set_epoch(epoch as u64);
    sampler.indices()
}

fn save_graph(stem: &str, varmap: &VarMap, model: &dyn Describe) -> Result<()> {
    let weights = format!("{}.safetensors", stem);
    varmap
        .save(&weights)
        .with_context(|| format!("failed to write {}", weights))?;

    let text = format!("{}.yaml", stem);
    let yaml = serde_yaml::to_string(&model.graph())?;
    std::fs::write(&text, yaml).with_context(|| format!("failed to write {}", text))?;

    println!("Saved graph to {} and {}", weights, text);
    Ok(())
}

fn train_rank(cfg: &FashionConfig, opts: &RunOptions, group: Arc<dyn ProcessGroup>) -> Result<()> {
    let gate = RankGate::new(group.rank());
    let (rank, world_size) = (group.rank(), group.world_size());

    let device = cfg.target_device.resolve(group.local_rank())?;
    seed_device(&device, cfg.seed)?;
    log::info!("rank {}/{} using {:?}", rank, world_size, device);

    let resume_from_epoch = resume_epoch(group.as_ref(), &cfg.log_dir, cfg.epochs)?;

    // Rank 0 downloads; the rest wait on the barrier
    let splits = prepare_dataset(DatasetKind::FashionMnist, &cfg.datadir, group.as_ref())?;
    let normalization = Normalization::fit(&splits.train);
    log::debug!("featurewise mean {:.4}, std {:.4}", normalization.mean, normalization.std);
    let train: Arc<ImageDataset> = Arc::new(splits.train);
    let test: Arc<ImageDataset> = Arc::new(splits.test);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = WideResNet::new(&cfg.model(), vb)?;

    let schedule = LrSchedule::new(cfg.base_lr, world_size, cfg.warmup_epochs);
    let ddp = DistributedDataParallel::wrap(&varmap, group.clone())?;
    gate.on_primary(|| {
        log::info!(
            "{}: {} parameters, {} buffers, peak lr {}",
            cfg.model_name(),
            ddp.num_params(),
            ddp.num_buffers(),
            schedule.peak_lr()
        )
    });
    let sgd = ddp.optimizer(SgdConfig {
        lr: schedule.peak_lr(),
        momentum: cfg.momentum,
        // The L2 penalty wd * |w|^2 contributes 2 * wd * w to the gradient
        weight_decay: 2.0 * cfg.wd,
    });
    let mut trainer = Trainer::new(&model, sgd, device.clone());

    let checkpointer = Checkpointer::new(&cfg.log_dir, cfg.max_checkpoints, gate);
    if resume_from_epoch > 0 {
        // Every rank loads the same checkpoint
        checkpointer.load(resume_from_epoch, trainer.optimizer_mut(), &device)?;
        gate.on_primary(|| println!("Resuming from checkpoint-{}", resume_from_epoch));
    }
    let metrics = MetricsLog::new(gate, &cfg.log_dir);
    gate.on_primary(|| std::fs::create_dir_all(&cfg.log_dir))
        .transpose()
        .with_context(|| format!("failed to create {}", cfg.log_dir.display()))?;

    let train_batches = train.len().div_ceil(cfg.batch_size);
    let test_batches = test.len().div_ceil(cfg.val_batch_size);
    let (steps_per_epoch, validation_steps) = epoch_steps(train_batches, test_batches, world_size, opts.profrun);

    let train_pre = Preprocess::train(normalization, Augment::fashion());
    let eval_pre = Preprocess::eval(normalization);

    for epoch in resume_from_epoch..cfg.epochs {
        let progress = Progress::new(
            gate,
            opts.headless,
            steps_per_epoch,
            format!("Epoch {}/{}", epoch + 1, cfg.epochs),
        );

        let base = EpochLoader::new(
            Arc::clone(&train),
            shuffled(train.len(), cfg.seed, rank, epoch),
            cfg.batch_size,
            train_pre,
            cfg.seed ^ ((rank as u64) << 32) ^ epoch as u64,
        );
        let mut loader = into_loader(base, cfg.prefetch)?;

        let lr_for_batch = |batch: usize| schedule.lr_at(epoch, batch, steps_per_epoch);
        let (mut seen, mut correct, mut loss_sum, mut grad_norm) = (0usize, 0usize, 0.0f64, 0.0f64);
        let train_stats = trainer.train_epoch(loader.as_mut(), steps_per_epoch, &lr_for_batch, |step| {
            seen += step.samples;
            correct += step.correct;
            loss_sum += step.loss * step.samples as f64;
            grad_norm = step.grad_norm;
            progress.update(
                step.batch + 1,
                format!(
                    "loss: {:.4} - acc: {:.4} - lr: {:.2e}",
                    loss_sum / seen as f64,
                    correct as f64 / seen as f64,
                    step.learning_rate
                ),
            );
        })?;
        drop(loader);

        let warmup_end = cfg.warmup_epochs.ceil() as usize;
        if epoch + 1 == warmup_end && cfg.warmup_epochs > 0.0 {
            progress.println(format!(
                "Epoch {}: finished gradual learning rate warmup to {}",
                epoch + 1,
                schedule.peak_lr()
            ));
        }

        // Validation draws from a reshuffled, wrapped test split
        let val_indices = cycle_to(
            &shuffled(test.len(), cfg.seed.wrapping_add(7), rank, epoch),
            validation_steps * cfg.val_batch_size,
        );
        let mut val_loader = into_loader(
            EpochLoader::new(Arc::clone(&test), val_indices, cfg.val_batch_size, eval_pre, 0),
            cfg.prefetch,
        )?;
        let val_stats = trainer.evaluate(val_loader.as_mut(), validation_steps)?;
        drop(val_loader);

        let mut averaged = [
            train_stats.mean_loss(),
            train_stats.accuracy(),
            val_stats.mean_loss(),
            val_stats.accuracy(),
        ];
        average_metrics(group.as_ref(), &mut averaged)?;
        let [loss, acc, val_loss, val_acc] = averaged;

        let lr = trainer.optimizer().learning_rate();
        let summary = format!(
            "{} - loss: {:.4} - acc: {:.4} - val_loss: {:.4} - val_acc: {:.4}",
            format_duration(train_stats.seconds + val_stats.seconds),
            loss,
            acc,
            val_loss,
            val_acc
        );
        progress.finish(summary.clone());

        let record = serde_json::json!({
            "epoch": epoch + 1,
            "loss": loss,
            "accuracy": acc,
            "val_loss": val_loss,
            "val_accuracy": val_acc,
            "learning_rate": lr,
            "grad_norm": grad_norm,
            "steps": train_stats.batches,
            "seconds": train_stats.seconds + val_stats.seconds,
            "timestamp": chrono::Local::now().to_rfc3339(),
        });
        metrics.append(&record);
        if opts.headless {
            gate.on_primary(|| println!("{}", record));
        }

        let meta = CheckpointMeta::new(epoch + 1, world_size, lr, &cfg.model_name(), &cfg.log_dir)
            .with_validation(val_loss, val_acc);
        checkpointer.save(trainer.optimizer(), &meta)?;
    }

    // Full test pass on every rank; only rank 0 reports
    let mut test_loader = into_loader(
        EpochLoader::sequential(Arc::clone(&test), cfg.val_batch_size, eval_pre),
        cfg.prefetch,
    )?;
    let score = trainer.evaluate(test_loader.as_mut(), test_batches)?;
    drop(test_loader);
    gate.on_primary(|| {
        println!("Test loss: {}", score.mean_loss());
        println!("Test accuracy: {}", score.accuracy());
    });

    if let Some(stem) = &opts.savegraph {
        gate.on_primary(|| save_graph(stem, &varmap, &model)).transpose()?;
    }

    Ok(())
}
