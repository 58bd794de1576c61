use ndarray::{Array2, Array4, Axis};

/// Averages every feature map down to one value: `(n, c, h, w) -> (n, c)`.
#[derive(Debug, Clone, Default)]
pub struct GlobalAvgPool {
    input_shape: Option<(usize, usize, usize, usize)>,
}

impl GlobalAvgPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, input: &Array4<f64>) -> Array2<f64> {
        self.input_shape = Some(input.dim());
        self.infer(input)
    }

    pub fn infer(&self, input: &Array4<f64>) -> Array2<f64> {
        let (_, _, height, width) = input.dim();
        let area = (height * width).max(1) as f64;
        input.sum_axis(Axis(3)).sum_axis(Axis(2)) / area
    }

    pub fn backward(&mut self, grad_output: &Array2<f64>) -> Array4<f64> {
        let shape = self.input_shape.take().expect("backward called before forward");
        let (_, _, height, width) = shape;
        let area = (height * width).max(1) as f64;
        Array4::from_shape_fn(shape, |(n, c, _, _)| grad_output[[n, c]] / area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn averages_and_spreads_gradient() {
        let mut pool = GlobalAvgPool::new();
        let input = Array::from_shape_fn((2, 3, 2, 2), |(n, c, y, x)| (n * 12 + c * 4 + y * 2 + x) as f64);
        let out = pool.forward(&input);
        assert_eq!(out.dim(), (2, 3));
        assert_eq!(out[[0, 0]], 1.5);
        assert_eq!(out[[1, 2]], 21.5);

        let grad = pool.backward(&Array2::ones((2, 3)));
        assert!(grad.iter().all(|&g| g == 0.25));
    }
}
