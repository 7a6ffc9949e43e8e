//! Per-image preprocessing: random transforms, then standardization

use rand::rngs::StdRng;
use rand::Rng;

use super::dataset::ImageDataset;

/// Scalar standardization `(x - mean) / std`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    /// Classic MNIST statistics
    pub const MNIST: Normalization = Normalization {
        mean: 0.1307,
        std: 0.3081,
    };

    /// Pass-through
    pub const IDENTITY: Normalization = Normalization { mean: 0.0, std: 1.0 };

    /// Fit mean and standard deviation over every pixel of `dataset`
    pub fn fit(dataset: &ImageDataset) -> Self {
        if dataset.images.is_empty() {
            return Self::IDENTITY;
        }
        let n = dataset.images.len() as f64;
        let mean = dataset.images.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = dataset
            .images
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Self {
            mean: mean as f32,
            // Small epsilon keeps constant images finite
            std: (var.sqrt() + 1e-6) as f32,
        }
    }

    pub fn apply(&self, pixels: &mut [f32]) {
        let inv = 1.0 / self.std;
        for p in pixels {
            *p = (*p - self.mean) * inv;
        }
    }
}

/// Random horizontal flips and translations, edges filled with the nearest pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augment {
    pub horizontal_flip: bool,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift: f32,
}

impl Augment {
    pub fn fashion() -> Self {
        Self {
            horizontal_flip: true,
            width_shift: 0.2,
            height_shift: 0.2,
        }
    }

    /// Transform `src` into `dst` with randomly drawn parameters
    pub fn apply(&self, src: &[f32], dst: &mut [f32], rows: usize, cols: usize, rng: &mut StdRng) {
        let dx = if self.width_shift > 0.0 {
            rng.gen_range(-self.width_shift..self.width_shift) * cols as f32
        } else {
            0.0
        };
        let dy = if self.height_shift > 0.0 {
            rng.gen_range(-self.height_shift..self.height_shift) * rows as f32
        } else {
            0.0
        };
        let flip = self.horizontal_flip && rng.gen_bool(0.5);
        shift_image(src, dst, rows, cols, dx, dy, flip);
    }
}

/// Bilinear resampling of `src` translated by `(dx, dy)` pixels
fn shift_image(src: &[f32], dst: &mut [f32], rows: usize, cols: usize, dx: f32, dy: f32, flip: bool) {
    let max_r = rows as f32 - 1.0;
    let max_c = cols as f32 - 1.0;
    let at = |r: usize, c: usize| {
        let c = if flip { cols - 1 - c } else { c };
        src[r * cols + c]
    };

    for r in 0..rows {
        let sr = (r as f32 - dy).clamp(0.0, max_r);
        let r0 = sr.floor() as usize;
        let r1 = (r0 + 1).min(rows - 1);
        let fr = sr - r0 as f32;
        for c in 0..cols {
            let sc = (c as f32 - dx).clamp(0.0, max_c);
            let c0 = sc.floor() as usize;
            let c1 = (c0 + 1).min(cols - 1);
            let fc = sc - c0 as f32;

            let top = at(r0, c0) * (1.0 - fc) + at(r0, c1) * fc;
            let bottom = at(r1, c0) * (1.0 - fc) + at(r1, c1) * fc;
            dst[r * cols + c] = top * (1.0 - fr) + bottom * fr;
        }
    }
}

/// What happens to each image on its way into a batch
#[derive(Debug, Clone, Copy)]
pub struct Preprocess {
    pub normalization: Normalization,
    pub augment: Option<Augment>,
}

impl Preprocess {
    pub fn eval(normalization: Normalization) -> Self {
        Self {
            normalization,
            augment: None,
        }
    }

    pub fn train(normalization: Normalization, augment: Augment) -> Self {
        Self {
            normalization,
            augment: Some(augment),
        }
    }

    /// Write the processed image into `dst`
    pub fn run(&self, src: &[f32], dst: &mut [f32], rows: usize, cols: usize, rng: &mut StdRng) {
        match &self.augment {
            Some(augment) => augment.apply(src, dst, rows, cols, rng),
            None => dst.copy_from_slice(src),
        }
        self.normalization.apply(dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ramp(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols).map(|v| v as f32).collect()
    }

    #[test]
    fn test_mnist_normalization() {
        let mut pixels = [0.1307f32, 0.1307 + 0.3081];
        Normalization::MNIST.apply(&mut pixels);
        assert!(pixels[0].abs() < 1e-6);
        assert!((pixels[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_fitted_normalization_standardizes() {
        let dataset = ImageDataset::new(vec![0.0, 1.0, 0.0, 1.0], vec![0], 2, 2).unwrap();
        let norm = Normalization::fit(&dataset);
        assert!((norm.mean - 0.5).abs() < 1e-6);
        assert!((norm.std - 0.5).abs() < 1e-5);

        let mut pixels = dataset.images.clone();
        norm.apply(&mut pixels);
        assert!((pixels[0] + 1.0).abs() < 1e-4);
        assert!((pixels[1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_shift_is_identity_and_flip_mirrors() {
        let src = ramp(3, 4);
        let mut dst = vec![0.0; 12];
        shift_image(&src, &mut dst, 3, 4, 0.0, 0.0, false);
        assert_eq!(dst, src);

        shift_image(&src, &mut dst, 3, 4, 0.0, 0.0, true);
        assert_eq!(&dst[0..4], &[3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_integer_shift_fills_with_nearest_edge() {
        let src = ramp(2, 4);
        let mut dst = vec![0.0; 8];
        // Move content one pixel right: the first column repeats the edge
        shift_image(&src, &mut dst, 2, 4, 1.0, 0.0, false);
        assert_eq!(&dst[0..4], &[0.0, 0.0, 1.0, 2.0]);
        assert_eq!(&dst[4..8], &[4.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_eval_preprocess_only_normalizes() {
        let pre = Preprocess::eval(Normalization { mean: 1.0, std: 2.0 });
        let mut rng = StdRng::seed_from_u64(0);
        let mut dst = [0.0f32; 2];
        pre.run(&[3.0, 5.0], &mut dst, 1, 2, &mut rng);
        assert_eq!(dst, [1.0, 2.0]);
    }

    #[test]
    fn test_augment_is_seeded() {
        let src = ramp(28, 28);
        let aug = Augment::fashion();
        let mut a = vec![0.0; src.len()];
        let mut b = vec![0.0; src.len()];
        aug.apply(&src, &mut a, 28, 28, &mut StdRng::seed_from_u64(9));
        aug.apply(&src, &mut b, 28, 28, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }
}
