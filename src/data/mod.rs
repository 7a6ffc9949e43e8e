//! Image datasets and the batch pipeline
//!
//! - `dataset` - MNIST / Fashion-MNIST splits held in memory
//! - `download` - fetching the IDX files from their mirrors
//! - `sampler` - per-rank index selection
//! - `augment` - standardization and random transforms
//! - `loader` - batch assembly, optionally prefetched on a worker thread

pub mod dataset;
pub mod download;
pub mod sampler;
pub mod augment;
pub mod loader;

pub use dataset::{DatasetKind, ImageDataset, Splits, NUM_CLASSES};
pub use sampler::{cycle_to, DistributedSampler};
pub use augment::{Augment, Normalization, Preprocess};
pub use loader::{into_loader, DataLoader, EpochLoader};

use candle_core::Result;
use std::path::Path;

use crate::distributed::{materialize_on_rank_zero, ProcessGroup};

/// Download (rank 0 only) and load a dataset on every rank
pub fn prepare_dataset(kind: DatasetKind, datadir: &Path, group: &dyn ProcessGroup) -> Result<Splits> {
    let dir = kind.dir(datadir);
    materialize_on_rank_zero(
        group,
        || download::download_dataset(kind, &dir),
        || dataset::load_splits(&dir),
    )
}
