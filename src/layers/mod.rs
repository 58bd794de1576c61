pub mod avg_pool;
pub mod batch_norm;
pub mod conv2d;
pub mod feed_forward;
pub mod max_pool;

use std::fmt::Debug;

use ndarray::{Array, Array4, ArrayViewD, ArrayViewMutD, Dimension};

/// A learnable tensor together with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Param<D: Dimension> {
    pub value: Array<f64, D>,
    pub grad: Array<f64, D>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f64, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Param { value, grad }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn view(&self) -> ArrayViewD<'_, f64> {
        self.value.view().into_dyn()
    }

    /// Mutable views of the value and the gradient, as handed to optimizers.
    pub fn slot(&mut self) -> ParamSlot<'_> {
        ParamSlot {
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.view_mut().into_dyn(),
        }
    }
}

/// Borrowed value/gradient pair of one parameter tensor.
pub struct ParamSlot<'a> {
    pub value: ArrayViewMutD<'a, f64>,
    pub grad: ArrayViewMutD<'a, f64>,
}

/// A differentiable stage operating on `(batch, channels, height, width)` tensors.
///
/// `forward` runs in training mode and caches whatever `backward` needs.
/// `infer` runs in evaluation mode and only borrows the layer, so it can
/// never touch parameters or statistics.
pub trait Layer: Debug + Send {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64>;

    fn infer(&self, input: &Array4<f64>) -> Array4<f64>;

    /// Accumulates parameter gradients and returns the gradient w.r.t. the input.
    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64>;

    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        Vec::new()
    }

    fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        Vec::new()
    }

    /// Non-learnable state that still belongs in a snapshot (running statistics).
    fn buffers(&self) -> Vec<ArrayViewD<'_, f64>> {
        Vec::new()
    }

    fn buffers_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        Vec::new()
    }

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    fn clone_box(&self) -> Box<dyn Layer>;
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Layers applied one after another.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    pub layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Sequential { layers }
    }

    pub fn push(&mut self, layer: impl Layer + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64> {
        let mut current = input.clone();
        for layer in &mut self.layers {
            current = layer.forward(&current);
        }
        current
    }

    fn infer(&self, input: &Array4<f64>) -> Array4<f64> {
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.infer(&current);
        }
        current
    }

    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad);
        }
        grad
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        self.layers.iter_mut().flat_map(|l| l.slots()).collect()
    }

    fn buffers(&self) -> Vec<ArrayViewD<'_, f64>> {
        self.layers.iter().flat_map(|l| l.buffers()).collect()
    }

    fn buffers_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        self.layers.iter_mut().flat_map(|l| l.buffers_mut()).collect()
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

pub use avg_pool::GlobalAvgPool;
pub use batch_norm::BatchNorm2d;
pub use conv2d::Conv2DLayer;
pub use feed_forward::FeedForwardLayer;
pub use max_pool::MaxPoolLayer;
