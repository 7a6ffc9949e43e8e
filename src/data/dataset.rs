//! In-memory image classification datasets in IDX layout

use candle_core::{DType, Result, Tensor};
use std::path::{Path, PathBuf};

pub const IMAGE_ROWS: usize = 28;
pub const IMAGE_COLS: usize = 28;
pub const NUM_CLASSES: usize = 10;

/// IDX file names shared by MNIST and Fashion-MNIST
pub const IDX_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
}

impl DatasetKind {
    /// Directory under the data root holding this dataset's IDX files
    pub fn subdir(&self) -> &'static str {
        match self {
            DatasetKind::Mnist => "mnist",
            DatasetKind::FashionMnist => "fashion-mnist",
        }
    }

    /// Base URL serving the gzipped IDX files
    pub fn mirror(&self) -> &'static str {
        match self {
            DatasetKind::Mnist => "https://ossci-datasets.s3.amazonaws.com/mnist",
            DatasetKind::FashionMnist => "http://fashion-mnist.s3-website.eu-central-1.amazonaws.com",
        }
    }

    pub fn dir(&self, datadir: &Path) -> PathBuf {
        datadir.join(self.subdir())
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetKind::Mnist => write!(f, "MNIST"),
            DatasetKind::FashionMnist => write!(f, "Fashion-MNIST"),
        }
    }
}

/// Grayscale images with pixel values in [0, 1], stored row-major
#[derive(Debug, Clone)]
pub struct ImageDataset {
    pub images: Vec<f32>,
    pub labels: Vec<u8>,
    pub rows: usize,
    pub cols: usize,
}

impl ImageDataset {
    pub fn new(images: Vec<f32>, labels: Vec<u8>, rows: usize, cols: usize) -> Result<Self> {
        if images.len() != labels.len() * rows * cols {
            return Err(candle_core::Error::Msg(format!(
                "{} pixel values do not match {} labels of {}x{} images",
                images.len(),
                labels.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            images,
            labels,
            rows,
            cols,
        })
    }

    /// Build from an `[n, rows * cols]` f32 image tensor and an `[n]` label tensor
    pub fn from_tensors(images: &Tensor, labels: &Tensor) -> Result<Self> {
        let images = images.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let labels = labels.to_dtype(DType::U8)?.to_vec1::<u8>()?;
        Self::new(images, labels, IMAGE_ROWS, IMAGE_COLS)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn pixels(&self) -> usize {
        self.rows * self.cols
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let n = self.pixels();
        &self.images[index * n..(index + 1) * n]
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }
}

/// Train and test splits of one dataset
#[derive(Debug, Clone)]
pub struct Splits {
    pub train: ImageDataset,
    pub test: ImageDataset,
}

/// Read the four IDX files in `dir`
pub fn load_splits(dir: &Path) -> Result<Splits> {
    let raw = candle_datasets::vision::mnist::load_dir(dir)?;
    let train = ImageDataset::from_tensors(&raw.train_images, &raw.train_labels)?;
    let test = ImageDataset::from_tensors(&raw.test_images, &raw.test_labels)?;
    log::info!(
        "Loaded {} train / {} test images from {}",
        train.len(),
        test.len(),
        dir.display()
    );
    Ok(Splits { train, test })
}

/// Write a small synthetic dataset in IDX layout, `train` and `test` images
/// of 28x28 with labels cycling through the classes
#[cfg(test)]
pub(crate) fn write_idx_files(dir: &Path, train: usize, test: usize) -> std::io::Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(dir)?;
    let split = |images: &str, labels: &str, count: usize| -> std::io::Result<()> {
        let mut file = std::fs::File::create(dir.join(images))?;
        for header in [2051u32, count as u32, IMAGE_ROWS as u32, IMAGE_COLS as u32] {
            file.write_all(&header.to_be_bytes())?;
        }
        for i in 0..count {
            let label = i % NUM_CLASSES;
            let pixels: Vec<u8> = (0..IMAGE_ROWS * IMAGE_COLS)
                .map(|p| if p % NUM_CLASSES == label { 255 } else { ((p * 7 + i) % 64) as u8 })
                .collect();
            file.write_all(&pixels)?;
        }

        let mut file = std::fs::File::create(dir.join(labels))?;
        file.write_all(&2049u32.to_be_bytes())?;
        file.write_all(&(count as u32).to_be_bytes())?;
        let labels: Vec<u8> = (0..count).map(|i| (i % NUM_CLASSES) as u8).collect();
        file.write_all(&labels)
    };
    split(IDX_FILES[0], IDX_FILES[1], train)?;
    split(IDX_FILES[2], IDX_FILES[3], test)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_dirs() {
        let root = Path::new("data");
        assert_eq!(DatasetKind::Mnist.dir(root), root.join("mnist"));
        assert_eq!(DatasetKind::FashionMnist.dir(root), root.join("fashion-mnist"));
    }

    #[test]
    fn test_image_access() {
        let images: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let dataset = ImageDataset::new(images, vec![3, 7], 2, 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.image(1), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(dataset.label(1), 7);
    }

    #[test]
    fn test_load_splits_reads_idx_files() {
        let dir = tempfile::tempdir().unwrap();
        write_idx_files(dir.path(), 12, 5).unwrap();

        let splits = load_splits(dir.path()).unwrap();
        assert_eq!(splits.train.len(), 12);
        assert_eq!(splits.test.len(), 5);
        assert_eq!(splits.train.label(11), 1);
        assert_eq!(splits.train.image(3)[3], 1.0);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        assert!(ImageDataset::new(vec![0.0; 5], vec![1], 2, 2).is_err());
    }
}
