use ndarray::{Array1, Array2, ArrayViewD, Axis, Ix1, Ix2};
use rand::Rng;

use super::{Param, ParamSlot};

/// Fully connected layer over `(batch, features)` rows, no activation.
#[derive(Debug, Clone)]
pub struct FeedForwardLayer {
    pub inputs: usize,
    pub neurons: usize,
    /// `(neurons, inputs)`
    pub weights: Param<Ix2>,
    pub bias: Param<Ix1>,
    input_cache: Option<Array2<f64>>,
}

impl FeedForwardLayer {
    pub fn new<R: Rng>(inputs: usize, neurons: usize, rng: &mut R) -> Self {
        // Uniform(-1/sqrt(inputs), 1/sqrt(inputs)) for both weights and bias
        let bound = 1.0 / (inputs.max(1) as f64).sqrt();
        let weights = Array2::from_shape_fn((neurons, inputs), |_| rng.random_range(-bound..bound));
        let bias = Array1::from_shape_fn(neurons, |_| rng.random_range(-bound..bound));

        FeedForwardLayer {
            inputs,
            neurons,
            weights: Param::new(weights),
            bias: Param::new(bias),
            input_cache: None,
        }
    }

    pub fn forward(&mut self, input: &Array2<f64>) -> Array2<f64> {
        let output = self.infer(input);
        self.input_cache = Some(input.clone());
        output
    }

    pub fn infer(&self, input: &Array2<f64>) -> Array2<f64> {
        assert_eq!(input.ncols(), self.inputs, "Input size does not match layer's input size");

        // input is (batch × inputs), weights is (neurons × inputs), result is (batch × neurons)
        input.dot(&self.weights.value.t()) + &self.bias.value
    }

    pub fn backward(&mut self, grad_output: &Array2<f64>) -> Array2<f64> {
        let input = self.input_cache.take().expect("backward called before forward");

        self.bias.grad += &grad_output.sum_axis(Axis(0));
        self.weights.grad += &grad_output.t().dot(&input);

        // Gradient for the previous layer, (batch × inputs)
        grad_output.dot(&self.weights.value)
    }

    pub fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.weights.view(), self.bias.view()]
    }

    pub fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        vec![self.weights.slot(), self.bias.slot()]
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_layer_initialization() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = FeedForwardLayer::new(3, 4, &mut rng);

        assert_eq!(layer.weights.value.dim(), (4, 3));
        assert_eq!(layer.bias.len(), 4);
        assert_eq!(layer.parameter_count(), 3 * 4 + 4);

        let bound = 1.0 / 3f64.sqrt();
        assert!(layer.weights.value.iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn backward_accumulates_gradients() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = FeedForwardLayer::new(2, 1, &mut rng);
        let input = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();

        layer.forward(&input);
        let grad_input = layer.backward(&Array2::ones((2, 1)));

        assert_eq!(layer.bias.grad[0], 2.0);
        assert_eq!(layer.weights.grad[[0, 0]], 4.0);
        assert_eq!(layer.weights.grad[[0, 1]], 6.0);
        assert_eq!(grad_input.row(0), layer.weights.value.row(0));
    }

    #[test]
    #[should_panic(expected = "Input size does not match layer's input size")]
    fn test_forward_invalid_input_size() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = FeedForwardLayer::new(3, 2, &mut rng);
        layer.infer(&Array2::zeros((1, 2)));
    }
}
