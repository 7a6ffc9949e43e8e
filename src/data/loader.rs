use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::augment::Preprocess;
use super::dataset::ImageDataset;

// ============================================================================
// Batches and the Data Loader Trait
// ============================================================================

/// A preprocessed batch on the host, ready for transfer to the device
#[derive(Debug, Clone)]
pub struct HostBatch {
    /// `batch_size * rows * cols` pixels
    pub images: Vec<f32>,
    pub labels: Vec<u32>,
    pub rows: usize,
    pub cols: usize,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Images as `(batch, 1, rows, cols)` f32 and labels as `(batch,)` u32
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let images = Tensor::from_slice(&self.images, (self.len(), 1, self.rows, self.cols), device)?;
        let labels = Tensor::from_slice(&self.labels, self.len(), device)?;
        Ok((images, labels))
    }
}

/// Common interface for the epoch loaders
///
/// - `EpochLoader`: synchronous, builds each batch on demand
/// - `PrefetchDataLoader`: builds batches on a background thread
pub trait DataLoader {
    /// The next batch of this pass, `None` once exhausted
    fn next_batch(&mut self) -> Result<Option<HostBatch>>;

    /// Number of batches in one pass
    fn num_batches(&self) -> usize;
}

// ============================================================================
// EpochLoader (Synchronous)
// ============================================================================

/// One pass over a list of dataset indices, in order, in fixed-size batches.
///
/// The final batch may be smaller. Random transforms draw from a generator
/// seeded at construction, so a pass is reproducible.
pub struct EpochLoader {
    dataset: Arc<ImageDataset>,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    preprocess: Preprocess,
    rng: StdRng,
}

impl EpochLoader {
    pub fn new(
        dataset: Arc<ImageDataset>,
        indices: Vec<usize>,
        batch_size: usize,
        preprocess: Preprocess,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            indices,
            batch_size: batch_size.max(1),
            cursor: 0,
            preprocess,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sequential pass over the whole dataset
    pub fn sequential(dataset: Arc<ImageDataset>, batch_size: usize, preprocess: Preprocess) -> Self {
        let indices = (0..dataset.len()).collect();
        Self::new(dataset, indices, batch_size, preprocess, 0)
    }

    fn build_batch(&mut self) -> Option<HostBatch> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let (rows, cols) = (self.dataset.rows, self.dataset.cols);
        let pixels = rows * cols;

        let mut images = vec![0.0f32; (end - self.cursor) * pixels];
        let mut labels = Vec::with_capacity(end - self.cursor);
        for (slot, &index) in self.indices[self.cursor..end].iter().enumerate() {
            let dst = &mut images[slot * pixels..(slot + 1) * pixels];
            self.preprocess
                .run(self.dataset.image(index), dst, rows, cols, &mut self.rng);
            labels.push(self.dataset.label(index) as u32);
        }
        self.cursor = end;

        Some(HostBatch {
            images,
            labels,
            rows,
            cols,
        })
    }
}

impl DataLoader for EpochLoader {
    fn next_batch(&mut self) -> Result<Option<HostBatch>> {
        Ok(self.build_batch())
    }

    fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

// ============================================================================
// Async Prefetching Data Pipeline
// ============================================================================

/// Prefetching loader for CPU-GPU pipeline overlap
///
/// A background thread preprocesses upcoming batches (augmentation included)
/// while the current one trains. The channel is bounded, so at most
/// `prefetch_count` batches wait in memory.
///
/// ```text
/// GPU: [step on batch N] → [step on batch N+1] → ...
/// CPU: [build batch N+1] → [build batch N+2]   → ...
/// ```
pub struct PrefetchDataLoader {
    /// Dropped before joining so a blocked worker wakes up
    receiver: Option<Receiver<HostBatch>>,
    prefetch_thread: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    num_batches: usize,
}

impl PrefetchDataLoader {
    pub fn new(base_loader: EpochLoader, prefetch_count: usize) -> Result<Self> {
        let num_batches = base_loader.num_batches();

        // Bounded to limit memory
        let (sender, receiver) = mpsc::sync_channel(prefetch_count.max(1));

        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);

        let prefetch_thread = thread::Builder::new()
            .name("prefetch".to_string())
            .spawn(move || {
                Self::prefetch_worker(base_loader, sender, stop_signal_clone);
            })
            .map_err(|e| candle_core::Error::Msg(format!("Failed to spawn prefetch thread: {}", e)))?;

        Ok(Self {
            receiver: Some(receiver),
            prefetch_thread: Some(prefetch_thread),
            stop_signal,
            num_batches,
        })
    }

    fn prefetch_worker(mut loader: EpochLoader, sender: SyncSender<HostBatch>, stop_signal: Arc<AtomicBool>) {
        while !stop_signal.load(Ordering::Relaxed) {
            let Some(batch) = loader.build_batch() else {
                break; // pass complete; dropping the sender ends the stream
            };
            // Blocks while the channel is full (backpressure)
            if sender.send(batch).is_err() {
                break;
            }
        }
    }

    /// Stop the worker and wait for it
    pub fn shutdown(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        self.receiver.take();
        if let Some(handle) = self.prefetch_thread.take() {
            let _ = handle.join();
        }
    }
}

impl DataLoader for PrefetchDataLoader {
    fn next_batch(&mut self) -> Result<Option<HostBatch>> {
        match &self.receiver {
            // A closed channel means the pass is over
            Some(receiver) => Ok(receiver.recv().ok()),
            None => Ok(None),
        }
    }

    fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Drop for PrefetchDataLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Box a loader, prefetching when `prefetch_count > 0`
pub fn into_loader(base_loader: EpochLoader, prefetch_count: usize) -> Result<Box<dyn DataLoader>> {
    if prefetch_count == 0 {
        Ok(Box::new(base_loader))
    } else {
        Ok(Box::new(PrefetchDataLoader::new(base_loader, prefetch_count)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::Normalization;

    fn tiny_dataset(n: usize) -> Arc<ImageDataset> {
        let images = (0..n * 4).map(|v| v as f32).collect();
        let labels = (0..n).map(|v| (v % 10) as u8).collect();
        Arc::new(ImageDataset::new(images, labels, 2, 2).unwrap())
    }

    fn drain(loader: &mut dyn DataLoader) -> Vec<HostBatch> {
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            out.push(batch);
        }
        out
    }

    #[test]
    fn test_epoch_loader_batches_in_index_order() {
        let mut loader = EpochLoader::new(
            tiny_dataset(5),
            vec![4, 0, 2],
            2,
            Preprocess::eval(Normalization::IDENTITY),
            0,
        );
        assert_eq!(loader.num_batches(), 2);

        let batches = drain(&mut loader);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].labels, vec![4, 0]);
        assert_eq!(&batches[0].images[0..4], &[16.0, 17.0, 18.0, 19.0]);
        assert_eq!(batches[1].labels, vec![2]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_prefetch_matches_synchronous_loader() {
        let make = || EpochLoader::sequential(tiny_dataset(9), 4, Preprocess::eval(Normalization::MNIST));
        let expected = drain(&mut make());

        let mut prefetch = PrefetchDataLoader::new(make(), 2).unwrap();
        assert_eq!(prefetch.num_batches(), 3);
        let got = drain(&mut prefetch);

        assert_eq!(got.len(), expected.len());
        for (a, b) in got.iter().zip(&expected) {
            assert_eq!(a.labels, b.labels);
            assert_eq!(a.images, b.images);
        }
    }

    #[test]
    fn test_prefetch_drop_mid_pass_does_not_hang() {
        let mut prefetch =
            PrefetchDataLoader::new(EpochLoader::sequential(tiny_dataset(100), 1, Preprocess::eval(Normalization::IDENTITY)), 1)
                .unwrap();
        assert!(prefetch.next_batch().unwrap().is_some());
        drop(prefetch);
    }

    #[test]
    fn test_batch_tensor_shapes() {
        let mut loader = EpochLoader::sequential(tiny_dataset(3), 3, Preprocess::eval(Normalization::IDENTITY));
        let batch = loader.next_batch().unwrap().unwrap();
        let (images, labels) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(images.dims(), &[3, 1, 2, 2]);
        assert_eq!(labels.to_vec1::<u32>().unwrap(), vec![0, 1, 2]);
    }
}
