use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::Serialize;

use crate::data::NUM_CLASSES;

// --- Graph description (exported next to the weights) ---

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_channels: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_channels: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f32>,
}

impl LayerSpec {
    fn new(name: impl Into<String>, kind: &str) -> Self {
        Self {
            name: name.into(),
            kind: kind.to_string(),
            in_channels: None,
            out_channels: None,
            kernel: None,
            stride: None,
            rate: None,
        }
    }

    fn conv(name: impl Into<String>, in_c: usize, out_c: usize, kernel: usize, stride: usize) -> Self {
        Self {
            in_channels: Some(in_c),
            out_channels: Some(out_c),
            kernel: Some(kernel),
            stride: Some(stride),
            ..Self::new(name, "conv2d")
        }
    }

    fn linear(name: impl Into<String>, in_f: usize, out_f: usize) -> Self {
        Self {
            in_channels: Some(in_f),
            out_channels: Some(out_f),
            ..Self::new(name, "linear")
        }
    }

    fn with_rate(kind: &str, name: impl Into<String>, rate: f32) -> Self {
        Self {
            rate: Some(rate),
            ..Self::new(name, kind)
        }
    }
}

/// Text description of a model's layer graph
#[derive(Debug, Clone, Serialize)]
pub struct ModelGraph {
    pub name: String,
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
}

/// Models that can describe their own layer graph
pub trait Describe {
    fn graph(&self) -> ModelGraph;
}

// --- Dropout helpers ---

/// Zero whole channels of an NCHW tensor with probability `p`
fn dropout2d(x: &Tensor, p: f32) -> Result<Tensor> {
    let (b, c, _, _) = x.dims4()?;
    let keep = Tensor::rand(0f32, 1f32, (b, c, 1, 1), x.device())?
        .ge(p)?
        .to_dtype(x.dtype())?;
    let mask = (keep * (1.0 / (1.0 - p as f64)))?;
    x.broadcast_mul(&mask)
}

// --- MNIST network ---

/// Two conv layers and two fully connected layers; outputs log-probabilities
pub struct Net {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
}

const NET_DROPOUT: f32 = 0.5;

impl Net {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv2d(1, 10, 5, Default::default(), vb.pp("conv1"))?,
            conv2: conv2d(10, 20, 5, Default::default(), vb.pp("conv2"))?,
            fc1: linear(320, 50, vb.pp("fc1"))?,
            fc2: linear(50, NUM_CLASSES, vb.pp("fc2"))?,
        })
    }
}

impl ModuleT for Net {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv1.forward(xs)?.max_pool2d(2)?.relu()?;

        let x = self.conv2.forward(&x)?;
        let x = if train { dropout2d(&x, NET_DROPOUT)? } else { x };
        let x = x.max_pool2d(2)?.relu()?;

        let x = x.flatten_from(1)?;
        let x = self.fc1.forward(&x)?.relu()?;
        let x = if train { candle_nn::ops::dropout(&x, NET_DROPOUT)? } else { x };
        let x = self.fc2.forward(&x)?;

        candle_nn::ops::log_softmax(&x, D::Minus1)
    }
}

impl Describe for Net {
    fn graph(&self) -> ModelGraph {
        ModelGraph {
            name: "mnist-net".to_string(),
            input_shape: [1, 28, 28],
            num_classes: NUM_CLASSES,
            layers: vec![
                LayerSpec::conv("conv1", 1, 10, 5, 1),
                LayerSpec::with_rate("max_pool2d", "pool1", 2.0),
                LayerSpec::conv("conv2", 10, 20, 5, 1),
                LayerSpec::with_rate("dropout2d", "conv2_drop", NET_DROPOUT),
                LayerSpec::with_rate("max_pool2d", "pool2", 2.0),
                LayerSpec::linear("fc1", 320, 50),
                LayerSpec::with_rate("dropout", "fc1_drop", NET_DROPOUT),
                LayerSpec::linear("fc2", 50, NUM_CLASSES),
                LayerSpec::new("log_softmax", "log_softmax"),
            ],
        }
    }
}

// --- Wide residual network ---

/// WideResNet hyperparameters
#[derive(Debug, Clone)]
pub struct WideResNetConfig {
    /// Total depth, `6n + 4`
    pub depth: usize,
    /// Channel multiplier
    pub width: usize,
    pub dropout: f32,
    /// Zero padding applied to each side of the input
    pub input_pad: usize,
    pub bn_momentum: f64,
    pub bn_eps: f64,
}

impl Default for WideResNetConfig {
    /// WRN-16-10 on 28x28 inputs padded to 32x32
    fn default() -> Self {
        Self {
            depth: 16,
            width: 10,
            dropout: 0.01,
            input_pad: 2,
            // Keras momentum 0.9 keeps 90% of the running statistic
            bn_momentum: 0.1,
            bn_eps: 1e-5,
        }
    }
}

impl WideResNetConfig {
    pub fn blocks_per_group(&self) -> Result<usize> {
        if self.depth < 10 || (self.depth - 4) % 6 != 0 {
            return Err(candle_core::Error::Msg(format!(
                "WideResNet depth must be 6n + 4 with n >= 1, got {}",
                self.depth
            )));
        }
        Ok((self.depth - 4) / 6)
    }

    fn bn(&self) -> BatchNormConfig {
        BatchNormConfig {
            eps: self.bn_eps,
            momentum: self.bn_momentum,
            ..Default::default()
        }
    }
}

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, 3, cfg, vb)
}

/// Pre-activation basic block: BN-ReLU-conv3x3, BN-ReLU-dropout-conv3x3
struct WideBlock {
    bn1: BatchNorm,
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
    /// 1x1 projection when the shape changes
    shortcut: Option<Conv2d>,
    in_c: usize,
    out_c: usize,
    stride: usize,
    dropout: f32,
}

impl WideBlock {
    fn new(in_c: usize, out_c: usize, stride: usize, cfg: &WideResNetConfig, vb: VarBuilder) -> Result<Self> {
        let shortcut = if in_c != out_c || stride != 1 {
            let proj = Conv2dConfig {
                stride,
                ..Default::default()
            };
            Some(conv2d_no_bias(in_c, out_c, 1, proj, vb.pp("shortcut"))?)
        } else {
            None
        };

        Ok(Self {
            bn1: batch_norm(in_c, cfg.bn(), vb.pp("bn1"))?,
            conv1: conv3x3(in_c, out_c, stride, vb.pp("conv1"))?,
            bn2: batch_norm(out_c, cfg.bn(), vb.pp("bn2"))?,
            conv2: conv3x3(out_c, out_c, 1, vb.pp("conv2"))?,
            shortcut,
            in_c,
            out_c,
            stride,
            dropout: cfg.dropout,
        })
    }

    fn describe(&self, prefix: &str, layers: &mut Vec<LayerSpec>) {
        layers.push(LayerSpec::new(format!("{}.bn1", prefix), "batch_norm"));
        layers.push(LayerSpec::conv(format!("{}.conv1", prefix), self.in_c, self.out_c, 3, self.stride));
        layers.push(LayerSpec::new(format!("{}.bn2", prefix), "batch_norm"));
        layers.push(LayerSpec::with_rate("dropout", format!("{}.drop", prefix), self.dropout));
        layers.push(LayerSpec::conv(format!("{}.conv2", prefix), self.out_c, self.out_c, 3, 1));
        if self.shortcut.is_some() {
            layers.push(LayerSpec::conv(format!("{}.shortcut", prefix), self.in_c, self.out_c, 1, self.stride));
        }
    }
}

impl ModuleT for WideBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let o1 = self.bn1.forward_t(xs, train)?.relu()?;

        let y = self.conv1.forward(&o1)?;
        let y = self.bn2.forward_t(&y, train)?.relu()?;
        let y = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&y, self.dropout)?
        } else {
            y
        };
        let y = self.conv2.forward(&y)?;

        let residual = match &self.shortcut {
            Some(proj) => proj.forward(&o1)?,
            None => xs.clone(),
        };
        y + residual
    }
}

/// Wide residual network for 10-class grayscale images; outputs logits
pub struct WideResNet {
    conv0: Conv2d,
    blocks: Vec<WideBlock>,
    bn: BatchNorm,
    fc: Linear,
    cfg: WideResNetConfig,
}

impl WideResNet {
    pub fn new(cfg: &WideResNetConfig, vb: VarBuilder) -> Result<Self> {
        let n = cfg.blocks_per_group()?;
        let widths = [16, 16 * cfg.width, 32 * cfg.width, 64 * cfg.width];
        let strides = [1, 2, 2];

        let conv0 = conv3x3(1, widths[0], 1, vb.pp("conv0"))?;

        let mut blocks = Vec::with_capacity(3 * n);
        let mut in_c = widths[0];
        for group in 0..3 {
            let out_c = widths[group + 1];
            for i in 0..n {
                let stride = if i == 0 { strides[group] } else { 1 };
                let vb_block = vb.pp(format!("group{}.block{}", group + 1, i));
                blocks.push(WideBlock::new(in_c, out_c, stride, cfg, vb_block)?);
                in_c = out_c;
            }
        }

        let bn = batch_norm(in_c, cfg.bn(), vb.pp("bn"))?;
        let fc = linear(in_c, NUM_CLASSES, vb.pp("fc"))?;

        Ok(Self {
            conv0,
            blocks,
            bn,
            fc,
            cfg: cfg.clone(),
        })
    }
}

impl ModuleT for WideResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let pad = self.cfg.input_pad;
        let x = xs.pad_with_zeros(2, pad, pad)?.pad_with_zeros(3, pad, pad)?;

        let mut x = self.conv0.forward(&x)?;
        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }

        let x = self.bn.forward_t(&x, train)?.relu()?;
        // Global average pooling over H and W
        let x = x.mean(D::Minus1)?.mean(D::Minus1)?;
        self.fc.forward(&x)
    }
}

impl Describe for WideResNet {
    fn graph(&self) -> ModelGraph {
        let mut layers = vec![
            LayerSpec::with_rate("zero_pad2d", "pad", self.cfg.input_pad as f32),
            LayerSpec::conv("conv0", 1, 16, 3, 1),
        ];
        let n = self.blocks.len() / 3;
        for (i, block) in self.blocks.iter().enumerate() {
            let prefix = format!("group{}.block{}", i / n.max(1) + 1, i % n.max(1));
            block.describe(&prefix, &mut layers);
        }
        layers.push(LayerSpec::new("bn", "batch_norm"));
        layers.push(LayerSpec::new("pool", "global_avg_pool"));
        let features = self.blocks.last().map_or(16, |b| b.out_c);
        layers.push(LayerSpec::linear("fc", features, NUM_CLASSES));

        ModelGraph {
            name: format!("wide-resnet-{}-{}", self.cfg.depth, self.cfg.width),
            input_shape: [1, 28, 28],
            num_classes: NUM_CLASSES,
            layers,
        }
    }
}

/// Mean negative log-likelihood of `labels` under the model's output.
///
/// Accepts logits or log-probabilities: `log_softmax` leaves the latter unchanged.
pub fn classification_loss(output: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(output, D::Minus1)?;
    candle_nn::loss::nll(&log_probs, labels)
}

/// Number of rows whose arg-max matches the label
pub fn count_correct(output: &Tensor, labels: &Tensor) -> Result<usize> {
    let predictions = output.argmax(D::Minus1)?;
    let correct = predictions
        .eq(&labels.to_dtype(predictions.dtype())?)?
        .to_dtype(candle_core::DType::U32)?
        .sum_all()?
        .to_vec0::<u32>()?;
    Ok(correct as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_net_output_is_log_probabilities() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = Net::new(vb).unwrap();

        let x = Tensor::zeros((3, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        let out = net.forward_t(&x, false).unwrap();
        assert_eq!(out.dims(), &[3, 10]);

        let sums = out.exp().unwrap().sum(1).unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4);
        }

        // Dropout paths keep the shape
        assert_eq!(net.forward_t(&x, true).unwrap().dims(), &[3, 10]);
    }

    #[test]
    fn test_small_wide_resnet_shapes_and_buffers() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = WideResNetConfig {
            depth: 10,
            width: 1,
            ..Default::default()
        };
        let model = WideResNet::new(&cfg, vb).unwrap();

        let x = Tensor::zeros((2, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward_t(&x, true).unwrap().dims(), &[2, 10]);
        assert_eq!(model.forward_t(&x, false).unwrap().dims(), &[2, 10]);

        let data = varmap.data().lock().unwrap();
        assert!(data.keys().any(|k| k.ends_with("running_mean")));
        assert!(data.contains_key("group2.block0.shortcut.weight"));
    }

    #[test]
    fn test_depth_validation() {
        let cfg = WideResNetConfig {
            depth: 15,
            ..Default::default()
        };
        assert!(cfg.blocks_per_group().is_err());
        assert_eq!(WideResNetConfig::default().blocks_per_group().unwrap(), 2);
    }

    #[test]
    fn test_wide_resnet_graph() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = WideResNetConfig {
            depth: 10,
            width: 2,
            ..Default::default()
        };
        let graph = WideResNet::new(&cfg, vb).unwrap().graph();
        assert_eq!(graph.name, "wide-resnet-10-2");
        assert_eq!(graph.layers.last().unwrap(), &LayerSpec::linear("fc", 128, 10));
    }

    #[test]
    fn test_loss_and_accuracy_helpers() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[5.0f32, 0.0], [0.0, 5.0], [5.0, 0.0]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1], &dev).unwrap();
        assert_eq!(count_correct(&logits, &labels).unwrap(), 2);

        // Same loss for logits and their log-softmax
        let a = classification_loss(&logits, &labels).unwrap().to_vec0::<f32>().unwrap();
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1).unwrap();
        let b = classification_loss(&log_probs, &labels).unwrap().to_vec0::<f32>().unwrap();
        assert!((a - b).abs() < 1e-5);
    }
}
