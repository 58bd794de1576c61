use ndarray::Array4;

use super::Layer;

#[derive(Debug, Clone)]
pub struct MaxPoolLayer {
    pub pool_size: (usize, usize),
    pub stride: usize,
    pub padding: usize,
    pub cached_input_shape: Option<(usize, usize, usize, usize)>,
    pub max_indices: Option<Array4<(usize, usize)>>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize), stride: usize, padding: usize) -> Self {
        MaxPoolLayer {
            pool_size,
            stride,
            padding,
            cached_input_shape: None,
            max_indices: None,
        }
    }

    pub fn output_hw(&self, height: usize, width: usize) -> (usize, usize) {
        let output_height = (height + 2 * self.padding - self.pool_size.0) / self.stride + 1;
        let output_width = (width + 2 * self.padding - self.pool_size.1) / self.stride + 1;
        (output_height, output_width)
    }

    /// Max pooling that also reports where every maximum came from.
    /// Padded positions never win.
    fn pool(&self, input: &Array4<f64>) -> (Array4<f64>, Array4<(usize, usize)>) {
        let (batch, channels, height, width) = input.dim();
        let (output_height, output_width) = self.output_hw(height, width);

        let mut output = Array4::<f64>::zeros((batch, channels, output_height, output_width));
        let mut max_indices =
            Array4::<(usize, usize)>::from_elem((batch, channels, output_height, output_width), (0, 0));

        for n in 0..batch {
            for c in 0..channels {
                for h in 0..output_height {
                    for w in 0..output_width {
                        let h_start = h * self.stride;
                        let w_start = w * self.stride;

                        let mut max_val = f64::NEG_INFINITY;
                        let mut max_pos = None;

                        // Find maximum in pooling window
                        for ph in 0..self.pool_size.0 {
                            let Some(ih) = (h_start + ph).checked_sub(self.padding).filter(|&i| i < height) else {
                                continue;
                            };
                            for pw in 0..self.pool_size.1 {
                                let Some(iw) = (w_start + pw).checked_sub(self.padding).filter(|&i| i < width) else {
                                    continue;
                                };
                                let val = input[[n, c, ih, iw]];
                                if max_pos.is_none() || val > max_val {
                                    max_val = val;
                                    max_pos = Some((ih, iw));
                                }
                            }
                        }

                        // The window always overlaps the input because padding < pool size
                        let (ih, iw) = max_pos.unwrap_or((h_start.min(height - 1), w_start.min(width - 1)));
                        output[[n, c, h, w]] = input[[n, c, ih, iw]];
                        max_indices[[n, c, h, w]] = (ih, iw);
                    }
                }
            }
        }

        (output, max_indices)
    }
}

impl Layer for MaxPoolLayer {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64> {
        let (output, max_indices) = self.pool(input);
        self.cached_input_shape = Some(input.dim());
        self.max_indices = Some(max_indices);
        output
    }

    fn infer(&self, input: &Array4<f64>) -> Array4<f64> {
        self.pool(input).0
    }

    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64> {
        let input_shape = self.cached_input_shape.take().expect("backward called before forward");
        let max_indices = self.max_indices.take().expect("backward called before forward");

        let mut input_gradient = Array4::<f64>::zeros(input_shape);
        let (batch, channels, output_height, output_width) = grad_output.dim();

        for n in 0..batch {
            for c in 0..channels {
                for h in 0..output_height {
                    for w in 0..output_width {
                        let (max_h, max_w) = max_indices[[n, c, h, w]];
                        input_gradient[[n, c, max_h, max_w]] += grad_output[[n, c, h, w]];
                    }
                }
            }
        }

        input_gradient
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
    fn picks_window_maximum_with_padding() {
        let mut pool = MaxPoolLayer::new((3, 3), 2, 1);
        let input = Array::from_shape_vec(
            (1, 1, 4, 4),
            vec![
                1.0, 2.0, 3.0, 4.0, //
                5.0, 6.0, 7.0, 8.0, //
                -9.0, -10.0, -11.0, -12.0, //
                -13.0, -14.0, -15.0, -16.0,
            ],
        )
        .unwrap();

        let out = pool.forward(&input);
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_eq!(out[[0, 0, 0, 0]], 6.0);
        assert_eq!(out[[0, 0, 0, 1]], 8.0);
        assert_eq!(out[[0, 0, 1, 0]], 6.0);
        assert_eq!(out[[0, 0, 1, 1]], 8.0);

        // Negative inputs must not lose to zero padding
        let negative = input.mapv(|v: f64| -v.abs());
        let out = pool.infer(&negative);
        assert_eq!(out[[0, 0, 0, 0]], -1.0);
    }

    #[test]
    fn routes_gradient_to_argmax() {
        let mut pool = MaxPoolLayer::new((2, 2), 2, 0);
        let input = Array::from_shape_vec((1, 1, 2, 2), vec![0.5, 3.0, -1.0, 2.0]).unwrap();
        pool.forward(&input);
        let grad = pool.backward(&Array4::from_elem((1, 1, 1, 1), 4.0));
        assert_eq!(grad.iter().copied().collect::<Vec<_>>(), vec![0.0, 4.0, 0.0, 0.0]);
    }
}
