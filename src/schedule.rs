//! Learning-rate schedule for large-batch data-parallel training
//!
//! The target rate scales linearly with the number of ranks. It is reached
//! gradually over the first `warmup_epochs`, updated every batch, starting
//! from the single-rank rate. Afterwards a step schedule decays it at fixed
//! epochs.

#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    /// Learning rate for a single rank
    pub base_lr: f64,
    pub world_size: usize,
    pub warmup_epochs: f64,
}

impl LrSchedule {
    pub fn new(base_lr: f64, world_size: usize, warmup_epochs: f64) -> Self {
        Self {
            base_lr,
            world_size: world_size.max(1),
            warmup_epochs: warmup_epochs.max(0.0),
        }
    }

    /// Full-scale learning rate `base_lr * world_size`
    pub fn peak_lr(&self) -> f64 {
        self.base_lr * self.world_size as f64
    }

    /// Step decay multiplier for a (zero-based) epoch
    pub fn step_multiplier(epoch: usize) -> f64 {
        match epoch {
            0..=14 => 1.0,
            15..=24 => 1e-1,
            25..=34 => 1e-2,
            _ => 1e-3,
        }
    }

    /// Learning rate for batch `batch` of `steps_per_epoch` in `epoch`
    pub fn lr_at(&self, epoch: usize, batch: usize, steps_per_epoch: usize) -> f64 {
        let peak = self.peak_lr();
        let epoch_frac = epoch as f64 + batch as f64 / steps_per_epoch.max(1) as f64;

        if epoch_frac < self.warmup_epochs {
            let size = self.world_size as f64;
            peak / size * (epoch_frac * (size - 1.0) / self.warmup_epochs + 1.0)
        } else {
            peak * Self::step_multiplier(epoch)
        }
    }
}
