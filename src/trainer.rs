use candle_core::{Device, Result};
use candle_nn::ModuleT;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{self, CheckpointMeta};
use crate::data::DataLoader;
use crate::distributed::DistributedSgd;
use crate::model::{classification_loss, count_correct};

// ============================================================================
// Rank Gating
// ============================================================================

/// Decides which side effects this rank performs.
///
/// Progress output, checkpoints, metrics and graph export happen on rank 0
/// only. Closures passed to [`RankGate::on_primary`] must not issue
/// collectives: the other ranks never enter them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankGate {
    rank: usize,
}

impl RankGate {
    pub fn new(rank: usize) -> Self {
        Self { rank }
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// Run `f` on rank 0, skip it elsewhere
    pub fn on_primary<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_primary() {
            Some(f())
        } else {
            None
        }
    }
}

// ============================================================================
// Metrics Log
// ============================================================================

/// Append-only JSON lines file, written by rank 0
pub struct MetricsLog {
    path: Option<PathBuf>,
}

impl MetricsLog {
    pub fn new(gate: RankGate, log_dir: &Path) -> Self {
        Self {
            path: gate.on_primary(|| log_dir.join("metrics.jsonl")),
        }
    }

    /// Does nothing on non-primary ranks
    pub fn append(&self, record: &serde_json::Value) {
        let Some(path) = &self.path else {
            return;
        };
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", record) {
                    log::warn!("failed to append to {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!("failed to write {}: {}", path.display(), e),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Rank-0 progress display: a progress bar, or plain lines when headless.
///
/// Silent on every other rank.
pub struct Progress {
    bar: Option<ProgressBar>,
    enabled: bool,
}

impl Progress {
    pub fn new(gate: RankGate, headless: bool, len: usize, prefix: String) -> Self {
        let bar = gate
            .on_primary(|| {
                if headless {
                    return None;
                }
                let style = ProgressStyle::with_template("{prefix} {bar:30.cyan/dim} {pos:>5}/{len:5} [{elapsed}] {msg}")
                    .map(|s| s.progress_chars("━━─"))
                    .unwrap_or_else(|_| ProgressStyle::default_bar());
                let bar = ProgressBar::new(len as u64);
                bar.set_style(style);
                bar.set_prefix(prefix);
                Some(bar)
            })
            .flatten();

        Self {
            bar,
            enabled: gate.is_primary(),
        }
    }

    /// Lines only, never a bar
    pub fn lines(gate: RankGate) -> Self {
        Self {
            bar: None,
            enabled: gate.is_primary(),
        }
    }

    pub fn update(&self, position: usize, message: String) {
        if let Some(bar) = &self.bar {
            bar.set_position(position as u64);
            bar.set_message(message);
        }
    }

    /// Print above the bar, or to stdout
    pub fn println(&self, line: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        match &self.bar {
            Some(bar) => bar.println(line.as_ref()),
            None => println!("{}", line.as_ref()),
        }
    }

    pub fn finish(&self, message: String) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(message);
        }
    }
}

// ============================================================================
// Training and Evaluation
// ============================================================================

/// One optimizer step as seen by the training loop
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Zero-based batch index within the epoch
    pub batch: usize,
    pub samples: usize,
    /// Mean loss of this batch on this rank
    pub loss: f64,
    pub correct: usize,
    pub grad_norm: f64,
    pub learning_rate: f64,
}

/// Loss and accuracy accumulated over a pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassStats {
    /// Sum of per-sample losses
    pub loss_sum: f64,
    pub correct: usize,
    pub samples: usize,
    pub batches: usize,
    pub seconds: f64,
}

impl PassStats {
    fn add(&mut self, mean_loss: f64, correct: usize, samples: usize) {
        self.loss_sum += mean_loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
        self.batches += 1;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.loss_sum / self.samples as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

/// Owns the optimizer and drives the per-rank loops.
///
/// Every rank runs the same number of steps, so the collectives issued inside
/// [`DistributedSgd::backward_step`] line up across the group.
pub struct Trainer<'a, M: ModuleT> {
    model: &'a M,
    optimizer: DistributedSgd,
    device: Device,
}

impl<'a, M: ModuleT> Trainer<'a, M> {
    pub fn new(model: &'a M, optimizer: DistributedSgd, device: Device) -> Self {
        Self {
            model,
            optimizer,
            device,
        }
    }

    pub fn optimizer(&self) -> &DistributedSgd {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut DistributedSgd {
        &mut self.optimizer
    }

    /// Train on up to `max_steps` batches of `loader`.
    ///
    /// `lr_for_batch` is consulted before every step; `on_step` sees each
    /// finished step.
    pub fn train_epoch(
        &mut self,
        loader: &mut dyn DataLoader,
        max_steps: usize,
        lr_for_batch: &dyn Fn(usize) -> f64,
        mut on_step: impl FnMut(&StepReport),
    ) -> Result<PassStats> {
        let start = Instant::now();
        let mut stats = PassStats::default();

        for batch in 0..max_steps {
            let Some(host) = loader.next_batch()? else {
                break;
            };
            let (images, labels) = host.to_tensors(&self.device)?;

            let learning_rate = lr_for_batch(batch);
            self.optimizer.set_learning_rate(learning_rate);

            let output = self.model.forward_t(&images, true)?;
            let loss = classification_loss(&output, &labels)?;
            let loss_value = loss.to_scalar::<f32>()? as f64;
            if !loss_value.is_finite() {
                return Err(candle_core::Error::Msg(format!(
                    "non-finite loss {} at batch {}",
                    loss_value, batch
                )));
            }
            let correct = count_correct(&output, &labels)?;

            let grad_norm = self.optimizer.backward_step(&loss)?;

            stats.add(loss_value, correct, host.len());
            on_step(&StepReport {
                batch,
                samples: host.len(),
                loss: loss_value,
                correct,
                grad_norm,
                learning_rate,
            });
        }

        stats.seconds = start.elapsed().as_secs_f64();
        Ok(stats)
    }

    /// Evaluate on up to `max_batches` batches of `loader`; no collectives
    pub fn evaluate(&self, loader: &mut dyn DataLoader, max_batches: usize) -> Result<PassStats> {
        let start = Instant::now();
        let mut stats = PassStats::default();

        for _ in 0..max_batches {
            let Some(host) = loader.next_batch()? else {
                break;
            };
            let (images, labels) = host.to_tensors(&self.device)?;
            let output = self.model.forward_t(&images, false)?;
            let loss = classification_loss(&output, &labels)?.to_scalar::<f32>()? as f64;
            let correct = count_correct(&output, &labels)?;
            stats.add(loss, correct, host.len());
        }

        stats.seconds = start.elapsed().as_secs_f64();
        Ok(stats)
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Writes `checkpoint-{epoch}` files on rank 0 and restores them on every rank
pub struct Checkpointer {
    log_dir: PathBuf,
    max_checkpoints: usize,
    gate: RankGate,
}

impl Checkpointer {
    pub fn new(log_dir: &Path, max_checkpoints: usize, gate: RankGate) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            max_checkpoints,
            gate,
        }
    }

    /// Save weights, momentum buffers and metadata (rank 0 only)
    pub fn save(&self, optimizer: &DistributedSgd, meta: &CheckpointMeta) -> Result<()> {
        self.gate
            .on_primary(|| {
                std::fs::create_dir_all(&self.log_dir).map_err(candle_core::Error::wrap)?;
                optimizer
                    .ddp()
                    .varmap()
                    .save(config::weights_path(&self.log_dir, meta.epoch))?;
                optimizer.save_state(config::optimizer_path(&self.log_dir, meta.epoch))?;
                if let Err(e) = meta.save(&self.log_dir) {
                    log::warn!("failed to save checkpoint metadata: {}", e);
                }
                if self.max_checkpoints > 0 {
                    self.cleanup_old_checkpoints();
                }
                Ok(())
            })
            .unwrap_or(Ok(()))
    }

    /// Restore `checkpoint-{epoch}` into the model and optimizer.
    ///
    /// Called on every rank: weights are loaded locally, no collective runs.
    pub fn load(&self, epoch: usize, optimizer: &mut DistributedSgd, device: &Device) -> Result<()> {
        let mut varmap = optimizer.ddp().varmap().clone();
        varmap.load(config::weights_path(&self.log_dir, epoch))?;

        let optim_path = config::optimizer_path(&self.log_dir, epoch);
        if optim_path.exists() {
            optimizer.load_state(&optim_path, device)?;
        } else {
            log::warn!("{} missing, momentum restarts from zero", optim_path.display());
        }

        match CheckpointMeta::load(config::meta_path(&self.log_dir, epoch)) {
            Ok(meta) => meta.check_world_size(optimizer.ddp().group().world_size()),
            Err(e) => log::debug!("no metadata for checkpoint-{}: {}", epoch, e),
        }
        Ok(())
    }

    /// Remove old checkpoints to keep only `max_checkpoints` most recent
    fn cleanup_old_checkpoints(&self) {
        let Ok(entries) = std::fs::read_dir(&self.log_dir) else {
            return;
        };

        // checkpoint-{N}.safetensors
        let mut epochs: Vec<usize> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_prefix("checkpoint-")?
                    .strip_suffix(".safetensors")?
                    .parse::<usize>()
                    .ok()
            })
            .collect();
        epochs.sort_unstable();

        let to_remove = epochs.len().saturating_sub(self.max_checkpoints);
        for epoch in epochs.into_iter().take(to_remove) {
            let weights = config::weights_path(&self.log_dir, epoch);
            if let Err(e) = std::fs::remove_file(&weights) {
                log::warn!("failed to remove old checkpoint {}: {}", weights.display(), e);
            }
            let _ = std::fs::remove_file(config::optimizer_path(&self.log_dir, epoch));
            let _ = std::fs::remove_file(config::meta_path(&self.log_dir, epoch));
        }
    }
}

/// Format seconds into human-readable duration (e.g., "5m32s", "2h14m", "3d05h")
pub fn format_duration(secs: f64) -> String {
    let total_secs = secs.round() as u64;
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if days > 0 {
        format!("{}d{:02}h", days, hours)
    } else if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
