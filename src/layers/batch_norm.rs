use ndarray::{s, Array1, Array4, ArrayViewD, ArrayViewMutD, Axis, Ix1};

use super::{Layer, Param, ParamSlot};

/// Per-channel batch normalization over `(batch, height, width)`.
///
/// Training uses the batch statistics and folds them into the running
/// estimates with `momentum`; inference uses the running estimates.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub gamma: Param<Ix1>,
    pub beta: Param<Ix1>,
    pub running_mean: Array1<f64>,
    pub running_var: Array1<f64>,
    pub momentum: f64,
    pub epsilon: f64,
    cache: Option<NormCache>,
}

#[derive(Debug, Clone)]
struct NormCache {
    normalized: Array4<f64>,
    inv_std: Array1<f64>,
}

impl BatchNorm2d {
    pub fn new(channels: usize, momentum: f64, epsilon: f64) -> Self {
        BatchNorm2d {
            gamma: Param::new(Array1::ones(channels)),
            beta: Param::new(Array1::zeros(channels)),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            momentum,
            epsilon,
            cache: None,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    fn normalize(
        &self,
        input: &Array4<f64>,
        mean: &Array1<f64>,
        inv_std: &Array1<f64>,
    ) -> (Array4<f64>, Array4<f64>) {
        let mut normalized = Array4::zeros(input.raw_dim());
        let mut output = Array4::zeros(input.raw_dim());
        for c in 0..self.channels() {
            let (m, inv) = (mean[c], inv_std[c]);
            let (g, b) = (self.gamma.value[c], self.beta.value[c]);
            let x = input.slice(s![.., c, .., ..]);
            let mut x_hat = normalized.slice_mut(s![.., c, .., ..]);
            let mut y = output.slice_mut(s![.., c, .., ..]);
            ndarray::Zip::from(&mut x_hat)
                .and(&mut y)
                .and(&x)
                .for_each(|x_hat, y, &x| {
                    *x_hat = (x - m) * inv;
                    *y = g * *x_hat + b;
                });
        }
        (normalized, output)
    }

    fn inv_std(&self, var: &Array1<f64>) -> Array1<f64> {
        var.mapv(|v| 1.0 / (v + self.epsilon).sqrt())
    }
}

impl Layer for BatchNorm2d {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64> {
        assert_eq!(input.dim().1, self.channels(), "Input channels do not match batch norm channels");
        let channels = self.channels();
        let mut mean = Array1::zeros(channels);
        let mut var = Array1::zeros(channels);
        for (c, x) in input.axis_iter(Axis(1)).enumerate() {
            let count = x.len().max(1) as f64;
            let m = x.sum() / count;
            mean[c] = m;
            var[c] = x.fold(0.0, |acc, &v| acc + (v - m) * (v - m)) / count;
        }

        let inv_std = self.inv_std(&var);
        let (normalized, output) = self.normalize(input, &mean, &inv_std);

        let momentum = self.momentum;
        self.running_mean
            .zip_mut_with(&mean, |r, &m| *r = (1.0 - momentum) * *r + momentum * m);
        self.running_var
            .zip_mut_with(&var, |r, &v| *r = (1.0 - momentum) * *r + momentum * v);

        self.cache = Some(NormCache { normalized, inv_std });
        output
    }

    fn infer(&self, input: &Array4<f64>) -> Array4<f64> {
        assert_eq!(input.dim().1, self.channels(), "Input channels do not match batch norm channels");
        let inv_std = self.inv_std(&self.running_var);
        self.normalize(input, &self.running_mean, &inv_std).1
    }

    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64> {
        let NormCache { normalized, inv_std } = self.cache.take().expect("backward called before forward");
        let mut grad_input = Array4::zeros(grad_output.raw_dim());

        for c in 0..self.channels() {
            let dy = grad_output.slice(s![.., c, .., ..]);
            let x_hat = normalized.slice(s![.., c, .., ..]);
            let count = dy.len().max(1) as f64;

            let dbeta = dy.sum();
            let dgamma = ndarray::Zip::from(&dy)
                .and(&x_hat)
                .fold(0.0, |acc, &g, &x| acc + g * x);
            self.gamma.grad[c] += dgamma;
            self.beta.grad[c] += dbeta;

            let scale = self.gamma.value[c] * inv_std[c] / count;
            ndarray::Zip::from(grad_input.slice_mut(s![.., c, .., ..]))
                .and(&dy)
                .and(&x_hat)
                .for_each(|dx, &g, &x| *dx = scale * (count * g - dbeta - x * dgamma));
        }
        grad_input
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.gamma.view(), self.beta.view()]
    }

    fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        vec![self.gamma.slot(), self.beta.slot()]
    }

    fn buffers(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.running_mean.view().into_dyn(), self.running_var.view().into_dyn()]
    }

    fn buffers_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![self.running_mean.view_mut().into_dyn(), self.running_var.view_mut().into_dyn()]
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn sample_input() -> Array4<f64> {
        Array::from_shape_fn((3, 2, 2, 2), |(n, c, y, x)| {
            ((n * 8 + c * 4 + y * 2 + x) as f64 * 0.37).cos() * (c + 1) as f64
        })
    }

    #[test]
    fn training_output_is_standardized() {
        let mut bn = BatchNorm2d::new(2, 0.1, 1e-5);
        let out = bn.forward(&sample_input());
        for c in 0..2 {
            let channel = out.slice(s![.., c, .., ..]);
            let mean = channel.sum() / channel.len() as f64;
            let var = channel.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / channel.len() as f64;
            assert!(mean.abs() < 1e-9);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn full_momentum_makes_inference_match_training() {
        let input = sample_input();
        let mut bn = BatchNorm2d::new(2, 1.0, 1e-5);
        let train = bn.forward(&input);
        let eval = bn.infer(&input);
        for (a, b) in train.iter().zip(eval.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let input = sample_input();
        let weights = Array::from_shape_fn(input.raw_dim(), |(n, c, y, x)| {
            ((n + 2 * c + 3 * y + 5 * x) as f64).sin()
        });
        let objective = |bn: &mut BatchNorm2d, x: &Array4<f64>| (bn.forward(x) * &weights).sum();

        let mut bn = BatchNorm2d::new(2, 0.1, 1e-5);
        bn.gamma.value[1] = 1.5;
        bn.forward(&input);
        let grad = bn.backward(&weights);

        let eps = 1e-6;
        for idx in [[0, 0, 0, 0], [1, 1, 0, 1], [2, 0, 1, 1]] {
            let mut plus = input.clone();
            plus[idx] += eps;
            let mut minus = input.clone();
            minus[idx] -= eps;
            let numeric = (objective(&mut bn, &plus) - objective(&mut bn, &minus)) / (2.0 * eps);
            assert!((numeric - grad[idx]).abs() < 1e-5, "{numeric} vs {}", grad[idx]);
        }
    }
}
