use std::fmt;

use ndarray::{Array4, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activation::ActivationLayer;
use crate::layers::{BatchNorm2d, Conv2DLayer, Layer, ParamSlot, Sequential};

/// Normalization settings shared by every batch norm in a network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormSettings {
    pub momentum: f64,
    pub epsilon: f64,
}

impl NormSettings {
    fn layer(&self, channels: usize) -> BatchNorm2d {
        BatchNorm2d::new(channels, self.momentum, self.epsilon)
    }
}

/// The two residual block flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// 3x3 -> 3x3, expansion 1
    Basic,
    /// 1x1 reduce -> 3x3 -> 1x1 expand, expansion 4
    Bottleneck,
}

impl BlockKind {
    pub fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }

    /// Builds one block reading `in_channels` and producing `planes * expansion` channels.
    pub fn build<R: Rng>(
        self,
        in_channels: usize,
        planes: usize,
        stride: usize,
        norm: NormSettings,
        rng: &mut R,
    ) -> ResidualBlock {
        let out_channels = planes * self.expansion();
        let mut body = Sequential::default();

        match self {
            BlockKind::Basic => {
                body.push(Conv2DLayer::new(in_channels, planes, (3, 3), stride, 1, rng));
                body.push(norm.layer(planes));
                body.push(ActivationLayer::relu());
                body.push(Conv2DLayer::new(planes, planes, (3, 3), 1, 1, rng));
                body.push(norm.layer(planes));
            }
            BlockKind::Bottleneck => {
                body.push(Conv2DLayer::new(in_channels, planes, (1, 1), 1, 0, rng));
                body.push(norm.layer(planes));
                body.push(ActivationLayer::relu());
                body.push(Conv2DLayer::new(planes, planes, (3, 3), stride, 1, rng));
                body.push(norm.layer(planes));
                body.push(ActivationLayer::relu());
                body.push(Conv2DLayer::new(planes, out_channels, (1, 1), 1, 0, rng));
                body.push(norm.layer(out_channels));
            }
        }

        let shortcut = (stride != 1 || in_channels != out_channels).then(|| {
            let mut projection = Sequential::default();
            projection.push(Conv2DLayer::new(in_channels, out_channels, (1, 1), stride, 0, rng));
            projection.push(norm.layer(out_channels));
            projection
        });

        ResidualBlock {
            kind: self,
            body,
            shortcut,
            output: ActivationLayer::relu(),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Basic => write!(f, "basic"),
            BlockKind::Bottleneck => write!(f, "bottleneck"),
        }
    }
}

/// `relu(body(x) + shortcut(x))`, where the shortcut is the identity unless
/// the block changes resolution or width.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub kind: BlockKind,
    body: Sequential,
    shortcut: Option<Sequential>,
    output: ActivationLayer,
}

impl ResidualBlock {
    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }
}

impl Layer for ResidualBlock {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64> {
        let residual = self.body.forward(input);
        let identity = match &mut self.shortcut {
            Some(projection) => projection.forward(input),
            None => input.clone(),
        };
        self.output.forward(&(residual + identity))
    }

    fn infer(&self, input: &Array4<f64>) -> Array4<f64> {
        let residual = self.body.infer(input);
        let identity = match &self.shortcut {
            Some(projection) => projection.infer(input),
            None => input.clone(),
        };
        self.output.infer(&(residual + identity))
    }

    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64> {
        let grad_sum = self.output.backward(grad_output);
        let grad_body = self.body.backward(&grad_sum);
        let grad_shortcut = match &mut self.shortcut {
            Some(projection) => projection.backward(&grad_sum),
            None => grad_sum,
        };
        grad_body + grad_shortcut
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.body.parameters();
        if let Some(projection) = &self.shortcut {
            params.extend(projection.parameters());
        }
        params
    }

    fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        let mut slots = self.body.slots();
        if let Some(projection) = &mut self.shortcut {
            slots.extend(projection.slots());
        }
        slots
    }

    fn buffers(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut buffers = self.body.buffers();
        if let Some(projection) = &self.shortcut {
            buffers.extend(projection.buffers());
        }
        buffers
    }

    fn buffers_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut buffers = self.body.buffers_mut();
        if let Some(projection) = &mut self.shortcut {
            buffers.extend(projection.buffers_mut());
        }
        buffers
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const NORM: NormSettings = NormSettings { momentum: 0.1, epsilon: 1e-5 };

    #[test]
    fn basic_block_keeps_identity_when_shapes_match() {
        let mut rng = StdRng::seed_from_u64(3);
        let block = BlockKind::Basic.build(4, 4, 1, NORM, &mut rng);
        assert!(!block.has_projection());
        // two 3x3 convs + two batch norms
        assert_eq!(block.parameter_count(), 2 * 4 * 4 * 9 + 2 * 2 * 4);

        let out = block.infer(&Array4::ones((2, 4, 5, 5)));
        assert_eq!(out.dim(), (2, 4, 5, 5));
        assert!(out.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn bottleneck_expands_and_downsamples() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut block = BlockKind::Bottleneck.build(8, 2, 2, NORM, &mut rng);
        assert!(block.has_projection());

        let input = Array4::from_shape_fn((2, 8, 6, 6), |(n, c, y, x)| ((n + c + y * x) as f64).sin());
        let out = block.forward(&input);
        assert_eq!(out.dim(), (2, 8, 3, 3));

        let grad = block.backward(&Array4::ones(out.raw_dim()));
        assert_eq!(grad.dim(), input.dim());
    }
}
