use ndarray::Array4;

use crate::layers::Layer;

/// Enum representing different activation function types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationType {
    ReLU,
    Linear,
}

impl ActivationType {
    /// Applies the activation function to a given input
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            // NaN passes through
            ActivationType::ReLU => if x < 0.0 { 0.0 } else { x },
            ActivationType::Linear => x,
        }
    }

    /// Computes the derivative of the activation function
    pub fn derivative(&self, x: f64) -> f64 {
        match self {
            ActivationType::ReLU => if x > 0.0 { 1.0 } else { 0.0 },
            ActivationType::Linear => 1.0,
        }
    }
}

/// Element-wise activation as a layer. Keeps the pre-activation around for backprop.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    pub activation: ActivationType,
    preactivation_cache: Option<Array4<f64>>,
}

impl ActivationLayer {
    pub fn new(activation: ActivationType) -> Self {
        ActivationLayer {
            activation,
            preactivation_cache: None,
        }
    }

    pub fn relu() -> Self {
        Self::new(ActivationType::ReLU)
    }
}

impl Layer for ActivationLayer {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64> {
        self.preactivation_cache = Some(input.clone());
        self.infer(input)
    }

    fn infer(&self, input: &Array4<f64>) -> Array4<f64> {
        let activation = self.activation;
        input.mapv(|x| activation.apply(x))
    }

    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64> {
        let preactivation = self
            .preactivation_cache
            .take()
            .expect("backward called before forward");
        let activation = self.activation;
        let mut grad = grad_output.clone();
        grad.zip_mut_with(&preactivation, |g, &x| *g *= activation.derivative(x));
        grad
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_activation_functions() {
        // ReLU tests
        assert_eq!(ActivationType::ReLU.apply(-1.0), 0.0);
        assert_eq!(ActivationType::ReLU.apply(2.0), 2.0);
        assert!(ActivationType::ReLU.apply(f64::NAN).is_nan());

        // Linear tests
        assert_eq!(ActivationType::Linear.apply(5.0), 5.0);
    }

    #[test]
    fn test_activation_derivatives() {
        // ReLU derivative
        assert_eq!(ActivationType::ReLU.derivative(-1.0), 0.0);
        assert_eq!(ActivationType::ReLU.derivative(0.0), 0.0);
        assert_eq!(ActivationType::ReLU.derivative(2.0), 1.0);

        // Linear derivative
        assert_eq!(ActivationType::Linear.derivative(5.0), 1.0);
    }

    #[test]
    fn relu_layer_masks_gradient() {
        let mut layer = ActivationLayer::relu();
        let input = Array::from_shape_vec((1, 1, 2, 2), vec![-1.0, 2.0, 0.5, -3.0]).unwrap();
        let out = layer.forward(&input);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 2.0, 0.5, 0.0]);

        let grad = layer.backward(&Array4::ones((1, 1, 2, 2)));
        assert_eq!(grad.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 1.0, 0.0]);
    }
}
