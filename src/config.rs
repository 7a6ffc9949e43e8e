use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use crate::distributed::DistributedConfig;
use crate::model::WideResNetConfig;

// Default value functions for serde
fn default_datadir() -> PathBuf { PathBuf::from("data") }
fn default_prefetch() -> usize { 2 }
fn default_seed() -> u64 { 1 }

fn default_mnist_batch_size() -> usize { 64 }
fn default_mnist_test_batch_size() -> usize { 1000 }
fn default_mnist_epochs() -> usize { 10 }
fn default_mnist_lr() -> f64 { 0.01 }
fn default_mnist_momentum() -> f64 { 0.5 }
fn default_log_interval() -> usize { 10 }

fn default_log_dir() -> PathBuf { PathBuf::from("./logs") }
fn default_fashion_batch_size() -> usize { 32 }
fn default_fashion_epochs() -> usize { 40 }
fn default_base_lr() -> f64 { 0.01 }
fn default_fashion_momentum() -> f64 { 0.9 }
fn default_weight_decay() -> f64 { 0.000005 }
fn default_warmup_epochs() -> f64 { 5.0 }
fn default_wrn_depth() -> usize { 16 }
fn default_wrn_width() -> usize { 10 }

/// Optional YAML run file; every field can be overridden from the command line
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileConfig {
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub mnist: MnistConfig,
    #[serde(default)]
    pub fashion_mnist: FashionConfig,
}

/// Target device for training
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TargetDevice {
    #[default]
    Gpu,
    Cpu,
}

impl TargetDevice {
    pub fn from_no_cuda(no_cuda: bool) -> Self {
        if no_cuda {
            TargetDevice::Cpu
        } else {
            TargetDevice::Gpu
        }
    }

    /// Pick the device for one rank: the GPU at `local_rank` if CUDA is
    /// available, the CPU otherwise
    pub fn resolve(&self, local_rank: usize) -> candle_core::Result<Device> {
        match self {
            TargetDevice::Cpu => Ok(Device::Cpu),
            TargetDevice::Gpu => Device::cuda_if_available(local_rank),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MnistConfig {
    #[serde(default = "default_mnist_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_mnist_test_batch_size")]
    pub test_batch_size: usize,
    #[serde(default = "default_mnist_epochs")]
    pub epochs: usize,
    #[serde(default = "default_mnist_lr")]
    pub lr: f64,
    #[serde(default = "default_mnist_momentum")]
    pub momentum: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Batches between training log lines
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,
    #[serde(default)]
    pub target_device: TargetDevice,
    /// Batches built ahead on a worker thread (0 = synchronous)
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

impl Default for MnistConfig {
    fn default() -> Self {
        Self {
            batch_size: default_mnist_batch_size(),
            test_batch_size: default_mnist_test_batch_size(),
            epochs: default_mnist_epochs(),
            lr: default_mnist_lr(),
            momentum: default_mnist_momentum(),
            seed: default_seed(),
            log_interval: default_log_interval(),
            datadir: default_datadir(),
            target_device: TargetDevice::default(),
            prefetch: default_prefetch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FashionConfig {
    /// Checkpoints and metrics are written here
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_fashion_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fashion_batch_size")]
    pub val_batch_size: usize,
    #[serde(default = "default_fashion_epochs")]
    pub epochs: usize,
    /// Learning rate for a single rank
    #[serde(default = "default_base_lr")]
    pub base_lr: f64,
    #[serde(default = "default_fashion_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub wd: f64,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,
    #[serde(default)]
    pub target_device: TargetDevice,
    /// Max checkpoints to keep (0 = unlimited)
    #[serde(default)]
    pub max_checkpoints: usize,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// WideResNet depth, `6n + 4`
    #[serde(default = "default_wrn_depth")]
    pub depth: usize,
    /// WideResNet channel multiplier
    #[serde(default = "default_wrn_width")]
    pub width: usize,
}

impl Default for FashionConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            batch_size: default_fashion_batch_size(),
            val_batch_size: default_fashion_batch_size(),
            epochs: default_fashion_epochs(),
            base_lr: default_base_lr(),
            momentum: default_fashion_momentum(),
            wd: default_weight_decay(),
            warmup_epochs: default_warmup_epochs(),
            seed: default_seed(),
            datadir: default_datadir(),
            target_device: TargetDevice::default(),
            max_checkpoints: 0,
            prefetch: default_prefetch(),
            depth: default_wrn_depth(),
            width: default_wrn_width(),
        }
    }
}

impl FileConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: FileConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, built-in defaults otherwise
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_yaml(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.distributed.nproc == 0 {
            anyhow::bail!("distributed.nproc must be at least 1");
        }
        self.mnist.validate()?;
        self.fashion_mnist.validate()?;
        Ok(())
    }
}

impl MnistConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.test_batch_size == 0 {
            anyhow::bail!("mnist batch sizes must be positive");
        }
        if self.log_interval == 0 {
            anyhow::bail!("mnist.log_interval must be positive");
        }
        Ok(())
    }
}

impl FashionConfig {
    pub fn model(&self) -> WideResNetConfig {
        WideResNetConfig {
            depth: self.depth,
            width: self.width,
            ..Default::default()
        }
    }

    /// `wrn-16-10` for the default network
    pub fn model_name(&self) -> String {
        format!("wrn-{}-{}", self.depth, self.width)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.val_batch_size == 0 {
            anyhow::bail!("fashion_mnist batch sizes must be positive");
        }
        if self.warmup_epochs < 0.0 {
            anyhow::bail!(
                "fashion_mnist.warmup_epochs must not be negative (got {})",
                self.warmup_epochs
            );
        }
        if self.width == 0 {
            anyhow::bail!("fashion_mnist.width must be positive");
        }
        self.model().blocks_per_group()?;
        Ok(())
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// `{log_dir}/checkpoint-{epoch}`, the stem shared by a checkpoint's files
pub fn checkpoint_stem(log_dir: &Path, epoch: usize) -> PathBuf {
    log_dir.join(format!("checkpoint-{}", epoch))
}

pub fn weights_path(log_dir: &Path, epoch: usize) -> PathBuf {
    checkpoint_stem(log_dir, epoch).with_extension("safetensors")
}

pub fn optimizer_path(log_dir: &Path, epoch: usize) -> PathBuf {
    checkpoint_stem(log_dir, epoch).with_extension("optim.safetensors")
}

pub fn meta_path(log_dir: &Path, epoch: usize) -> PathBuf {
    checkpoint_stem(log_dir, epoch).with_extension("meta.json")
}

/// Latest epoch in `1..=epochs` that has saved weights, 0 when none.
///
/// Scans downwards from `epochs`, so checkpoints of a longer earlier run are
/// ignored.
pub fn find_resume_epoch(log_dir: &Path, epochs: usize) -> usize {
    (1..=epochs)
        .rev()
        .find(|&epoch| weights_path(log_dir, epoch).exists())
        .unwrap_or(0)
}

/// Sidecar written next to every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub timestamp: String,
    pub world_size: usize,
    pub learning_rate: f64,
    pub model: String,
    #[serde(default)]
    pub val_loss: Option<f64>,
    #[serde(default)]
    pub val_accuracy: Option<f64>,
    pub weights_file: String,
    #[serde(default)]
    pub optimizer_file: Option<String>,
}

impl CheckpointMeta {
    pub fn new(epoch: usize, world_size: usize, learning_rate: f64, model: &str, log_dir: &Path) -> Self {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        Self {
            epoch,
            timestamp,
            world_size,
            learning_rate,
            model: model.to_string(),
            val_loss: None,
            val_accuracy: None,
            weights_file: weights_path(log_dir, epoch).display().to_string(),
            optimizer_file: Some(optimizer_path(log_dir, epoch).display().to_string()),
        }
    }

    pub fn with_validation(mut self, loss: f64, accuracy: f64) -> Self {
        self.val_loss = Some(loss);
        self.val_accuracy = Some(accuracy);
        self
    }

    pub fn save(&self, log_dir: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(meta_path(log_dir, self.epoch), json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let meta: CheckpointMeta = serde_json::from_str(&content)?;
        Ok(meta)
    }

    /// Warn about a checkpoint written under a different world size.
    ///
    /// The learning rate scales with the number of ranks, so resuming with a
    /// different count changes the schedule from that epoch on.
    pub fn check_world_size(&self, world_size: usize) {
        if self.world_size != world_size {
            log::warn!(
                "checkpoint-{} was written with {} ranks, resuming with {}",
                self.epoch,
                self.world_size,
                world_size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli_defaults() {
        let config = FileConfig::default();
        assert_eq!(config.mnist.batch_size, 64);
        assert_eq!(config.mnist.test_batch_size, 1000);
        assert_eq!(config.mnist.momentum, 0.5);
        assert_eq!(config.fashion_mnist.epochs, 40);
        assert_eq!(config.fashion_mnist.warmup_epochs, 5.0);
        assert_eq!(config.fashion_mnist.wd, 0.000005);
        assert_eq!(config.fashion_mnist.log_dir, PathBuf::from("./logs"));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(
            &path,
            "distributed:\n  backend: local\n  nproc: 4\nfashion_mnist:\n  epochs: 3\n  target_device: cpu\n",
        )
        .unwrap();

        let config = FileConfig::from_yaml(&path).unwrap();
        assert_eq!(config.distributed.backend, crate::distributed::Backend::Local);
        assert_eq!(config.distributed.nproc, 4);
        assert_eq!(config.fashion_mnist.epochs, 3);
        assert_eq!(config.fashion_mnist.target_device, TargetDevice::Cpu);
        assert_eq!(config.fashion_mnist.batch_size, 32);
        assert_eq!(config.mnist.lr, 0.01);
    }

    #[test]
    fn test_invalid_yaml_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "mnist:\n  batch_size: 0\n").unwrap();
        assert!(FileConfig::from_yaml(&path).is_err());

        fs::write(&path, "fashion_mnist:\n  depth: 12\n").unwrap();
        assert!(FileConfig::from_yaml(&path).is_err());
    }

    #[test]
    fn test_wide_resnet_shape_from_config() {
        let mut config = FashionConfig::default();
        assert_eq!(config.model_name(), "wrn-16-10");
        assert_eq!(config.model().depth, 16);

        config.depth = 10;
        config.width = 1;
        config.validate().unwrap();
        assert_eq!(config.model_name(), "wrn-10-1");
        assert_eq!(config.model().blocks_per_group().unwrap(), 1);
    }

    #[test]
    fn test_checkpoint_paths() {
        let dir = Path::new("/tmp/logs");
        assert_eq!(weights_path(dir, 3), PathBuf::from("/tmp/logs/checkpoint-3.safetensors"));
        assert_eq!(optimizer_path(dir, 3), PathBuf::from("/tmp/logs/checkpoint-3.optim.safetensors"));
        assert_eq!(meta_path(dir, 12), PathBuf::from("/tmp/logs/checkpoint-12.meta.json"));
    }

    #[test]
    fn test_find_resume_epoch_scans_down_from_epochs() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_resume_epoch(dir.path(), 10), 0);

        for epoch in [2, 5, 12] {
            fs::write(weights_path(dir.path(), epoch), b"x").unwrap();
        }
        assert_eq!(find_resume_epoch(dir.path(), 10), 5);
        assert_eq!(find_resume_epoch(dir.path(), 4), 2);
        assert_eq!(find_resume_epoch(dir.path(), 1), 0);
    }

    #[test]
    fn test_meta_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let meta = CheckpointMeta::new(7, 4, 0.04, "wrn-16-10", dir.path()).with_validation(0.31, 0.9);
        meta.save(dir.path()).unwrap();

        let loaded = CheckpointMeta::load(meta_path(dir.path(), 7)).unwrap();
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.world_size, 4);
        assert_eq!(loaded.val_accuracy, Some(0.9));
        assert!(loaded.weights_file.ends_with("checkpoint-7.safetensors"));
    }
}
