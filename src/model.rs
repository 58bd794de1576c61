use ndarray::{Array1, Array4, ArrayViewD, ArrayViewMutD, Axis};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::activation::ActivationLayer;
use crate::block::{BlockKind, NormSettings};
use crate::layers::{
    BatchNorm2d, Conv2DLayer, FeedForwardLayer, GlobalAvgPool, Layer, MaxPoolLayer, ParamSlot, Sequential,
};
use crate::{Error, Result};

/// Strides of the four stages; the first keeps the stem's resolution.
const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// Shape-level settings of a regression network that are independent of the
/// block kind and stage depths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Image channels, 1 for grayscale radiographs.
    pub input_channels: usize,
    /// Width of the first stage; later stages double it.
    pub base_width: usize,
    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            input_channels: 1,
            base_width: 64,
            batch_norm_momentum: 0.1,
            batch_norm_epsilon: 1e-5,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 || self.base_width == 0 {
            return Err(Error::InvalidConfig(
                "input channels and base width must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.batch_norm_momentum) {
            return Err(Error::InvalidConfig(format!(
                "batch norm momentum {} is outside [0, 1]",
                self.batch_norm_momentum
            )));
        }
        if !(self.batch_norm_epsilon > 0.0) {
            return Err(Error::InvalidConfig("batch norm epsilon must be positive".to_string()));
        }
        Ok(())
    }

    fn norm(&self) -> NormSettings {
        NormSettings {
            momentum: self.batch_norm_momentum,
            epsilon: self.batch_norm_epsilon,
        }
    }
}

/// Residual network with a single linear output unit.
///
/// Training-mode calls (`forward`, `backward`) need `&mut self`; evaluation
/// (`infer`) only borrows the model, so an evaluation pass cannot mutate it.
#[derive(Debug, Clone)]
pub struct ResNet {
    pub block: BlockKind,
    pub depths: Vec<usize>,
    pub config: ModelConfig,
    stem: Sequential,
    stages: Vec<Sequential>,
    pool: GlobalAvgPool,
    head: FeedForwardLayer,
}

impl ResNet {
    /// Builds the network; identical arguments and seed give identical weights.
    pub fn new(block: BlockKind, depths: &[usize], config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        if depths.len() != STAGE_STRIDES.len() || depths.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "expected four non-empty stages, got depths {depths:?}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let norm = config.norm();
        let width = config.base_width;

        let mut stem = Sequential::default();
        stem.push(Conv2DLayer::new(config.input_channels, width, (7, 7), 2, 3, &mut rng));
        stem.push(BatchNorm2d::new(width, norm.momentum, norm.epsilon));
        stem.push(ActivationLayer::relu());
        stem.push(MaxPoolLayer::new((3, 3), 2, 1));

        let mut in_channels = width;
        let mut stages = Vec::with_capacity(depths.len());
        for (i, (&depth, &stride)) in depths.iter().zip(STAGE_STRIDES.iter()).enumerate() {
            let planes = width << i;
            let mut stage = Sequential::default();
            for b in 0..depth {
                let block_stride = if b == 0 { stride } else { 1 };
                stage.push(block.build(in_channels, planes, block_stride, norm, &mut rng));
                in_channels = planes * block.expansion();
            }
            stages.push(stage);
        }

        let head = FeedForwardLayer::new(in_channels, 1, &mut rng);

        Ok(ResNet {
            block,
            depths: depths.to_vec(),
            config,
            stem,
            stages,
            pool: GlobalAvgPool::new(),
            head,
        })
    }

    /// Training-mode forward pass, one prediction per image.
    pub fn forward(&mut self, images: &Array4<f64>) -> Result<Array1<f64>> {
        self.check_input(images)?;
        let mut x = self.stem.forward(images);
        for stage in &mut self.stages {
            x = stage.forward(&x);
        }
        let pooled = self.pool.forward(&x);
        Ok(self.head.forward(&pooled).column(0).to_owned())
    }

    /// Evaluation-mode forward pass using running statistics.
    pub fn infer(&self, images: &Array4<f64>) -> Result<Array1<f64>> {
        self.check_input(images)?;
        let mut x = self.stem.infer(images);
        for stage in &self.stages {
            x = stage.infer(&x);
        }
        let pooled = self.pool.infer(&x);
        Ok(self.head.infer(&pooled).column(0).to_owned())
    }

    /// Backpropagates `d loss / d prediction` and accumulates parameter gradients.
    pub fn backward(&mut self, grad_output: &Array1<f64>) {
        let grad = grad_output.view().insert_axis(Axis(1)).to_owned();
        let grad_pooled = self.head.backward(&grad);
        let mut grad = self.pool.backward(&grad_pooled);
        for stage in self.stages.iter_mut().rev() {
            grad = stage.backward(&grad);
        }
        self.stem.backward(&grad);
    }

    /// Parameter tensors in a fixed order: stem, stages, head.
    pub fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.stem.parameters();
        for stage in &self.stages {
            params.extend(stage.parameters());
        }
        params.extend(self.head.parameters());
        params
    }

    /// Same order as [`ResNet::parameters`].
    pub fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        let mut slots = self.stem.slots();
        for stage in &mut self.stages {
            slots.extend(stage.slots());
        }
        slots.extend(self.head.slots());
        slots
    }

    pub fn buffers(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut buffers = self.stem.buffers();
        for stage in &self.stages {
            buffers.extend(stage.buffers());
        }
        buffers
    }

    pub fn buffers_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut buffers = self.stem.buffers_mut();
        for stage in &mut self.stages {
            buffers.extend(stage.buffers_mut());
        }
        buffers
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Every parameter value flattened in [`ResNet::parameters`] order.
    pub fn flat_parameters(&self) -> Vec<f64> {
        self.parameters().iter().flat_map(|p| p.iter().copied()).collect()
    }

    pub fn zero_gradients(&mut self) {
        for mut slot in self.slots() {
            slot.grad.fill(0.0);
        }
    }

    fn check_input(&self, images: &Array4<f64>) -> Result<()> {
        let (batch, channels, height, width) = images.dim();
        if batch == 0 || channels != self.config.input_channels || height == 0 || width == 0 {
            return Err(Error::ShapeMismatch {
                what: "model input",
                got: images.shape().to_vec(),
                expected: vec![batch.max(1), self.config.input_channels, height.max(1), width.max(1)],
            });
        }
        Ok(())
    }
}
