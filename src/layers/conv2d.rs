use crate::layers::{Layer, Param, ParamSlot};
use ndarray::{s, Array2, Array4, ArrayViewD, Ix2};
use rand::Rng;
use rand_distr::StandardNormal;

/// Bias-free 2-D convolution lowered to a matrix product through im2col.
#[derive(Debug, Clone)]
pub struct Conv2DLayer {
    /// `(filters, channels * kernel_h * kernel_w)`
    pub weights: Param<Ix2>,
    pub in_channels: usize,
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub stride: usize,
    pub padding: usize,
    input_shape: Option<(usize, usize, usize, usize)>,
    cols_cache: Option<Array2<f64>>,
}

impl Conv2DLayer {
    pub fn new<R: Rng>(
        in_channels: usize,
        filters: usize,
        kernel_size: (usize, usize),
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let (kernel_h, kernel_w) = kernel_size;
        let fan_in = in_channels * kernel_h * kernel_w;

        // He initialization, fan-out mode
        let std_dev = (2.0 / (filters * kernel_h * kernel_w) as f64).sqrt();
        let weights = Array2::from_shape_fn((filters, fan_in), |_| {
            let z: f64 = rng.sample(StandardNormal);
            z * std_dev
        });

        Conv2DLayer {
            weights: Param::new(weights),
            in_channels,
            filters,
            kernel_size,
            stride,
            padding,
            input_shape: None,
            cols_cache: None,
        }
    }

    pub fn output_hw(&self, height: usize, width: usize) -> (usize, usize) {
        let out_h = (height + 2 * self.padding - self.kernel_size.0) / self.stride + 1;
        let out_w = (width + 2 * self.padding - self.kernel_size.1) / self.stride + 1;
        (out_h, out_w)
    }

    /// Unfolds every receptive field of the batch into one column.
    fn im2col(&self, input: &Array4<f64>) -> Array2<f64> {
        let (batch, channels, height, width) = input.dim();
        let (kernel_h, kernel_w) = self.kernel_size;
        let (out_h, out_w) = self.output_hw(height, width);
        let mut cols = Array2::zeros((channels * kernel_h * kernel_w, batch * out_h * out_w));

        for c in 0..channels {
            for ki in 0..kernel_h {
                for kj in 0..kernel_w {
                    let row = (c * kernel_h + ki) * kernel_w + kj;
                    for n in 0..batch {
                        for y in 0..out_h {
                            let Some(iy) = self.source_index(y, ki, height) else {
                                continue;
                            };
                            for x in 0..out_w {
                                let Some(ix) = self.source_index(x, kj, width) else {
                                    continue;
                                };
                                cols[[row, (n * out_h + y) * out_w + x]] = input[[n, c, iy, ix]];
                            }
                        }
                    }
                }
            }
        }
        cols
    }

    /// Scatters column gradients back onto the (unpadded) input grid.
    fn col2im(&self, cols: &Array2<f64>, shape: (usize, usize, usize, usize)) -> Array4<f64> {
        let (batch, channels, height, width) = shape;
        let (kernel_h, kernel_w) = self.kernel_size;
        let (out_h, out_w) = self.output_hw(height, width);
        let mut grad = Array4::zeros(shape);

        for c in 0..channels {
            for ki in 0..kernel_h {
                for kj in 0..kernel_w {
                    let row = (c * kernel_h + ki) * kernel_w + kj;
                    for n in 0..batch {
                        for y in 0..out_h {
                            let Some(iy) = self.source_index(y, ki, height) else {
                                continue;
                            };
                            for x in 0..out_w {
                                let Some(ix) = self.source_index(x, kj, width) else {
                                    continue;
                                };
                                grad[[n, c, iy, ix]] += cols[[row, (n * out_h + y) * out_w + x]];
                            }
                        }
                    }
                }
            }
        }
        grad
    }

    /// Input coordinate read by output position `out` at kernel offset `k`, if not padding.
    fn source_index(&self, out: usize, k: usize, extent: usize) -> Option<usize> {
        (out * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < extent)
    }

    fn convolve(&self, input: &Array4<f64>, cols: &Array2<f64>) -> Array4<f64> {
        let (batch, channels, height, width) = input.dim();
        assert_eq!(channels, self.in_channels, "Input channels do not match layer's input channels");
        let (out_h, out_w) = self.output_hw(height, width);

        // (filters, batch * out_h * out_w) -> (batch, filters, out_h, out_w)
        let output_2d = self.weights.value.dot(cols);
        let plane = out_h * out_w;
        let mut output = Array4::zeros((batch, self.filters, out_h, out_w));
        for n in 0..batch {
            let block = output_2d.slice(s![.., n * plane..(n + 1) * plane]);
            for f in 0..self.filters {
                output
                    .slice_mut(s![n, f, .., ..])
                    .iter_mut()
                    .zip(block.row(f))
                    .for_each(|(dst, &src)| *dst = src);
            }
        }
        output
    }
}

impl Layer for Conv2DLayer {
    fn forward(&mut self, input: &Array4<f64>) -> Array4<f64> {
        let cols = self.im2col(input);
        let output = self.convolve(input, &cols);
        self.input_shape = Some(input.dim());
        self.cols_cache = Some(cols);
        output
    }

    fn infer(&self, input: &Array4<f64>) -> Array4<f64> {
        let cols = self.im2col(input);
        self.convolve(input, &cols)
    }

    fn backward(&mut self, grad_output: &Array4<f64>) -> Array4<f64> {
        let cols = self.cols_cache.take().expect("backward called before forward");
        let input_shape = self.input_shape.take().expect("backward called before forward");
        let (batch, filters, out_h, out_w) = grad_output.dim();

        // (batch, filters, out_h, out_w) -> (filters, batch * out_h * out_w)
        let plane = out_h * out_w;
        let mut grad_2d = Array2::zeros((filters, batch * plane));
        for n in 0..batch {
            for f in 0..filters {
                grad_2d
                    .slice_mut(s![f, n * plane..(n + 1) * plane])
                    .iter_mut()
                    .zip(grad_output.slice(s![n, f, .., ..]))
                    .for_each(|(dst, &g)| *dst = g);
            }
        }

        self.weights.grad += &grad_2d.dot(&cols.t());
        let grad_cols = self.weights.value.t().dot(&grad_2d);
        self.col2im(&grad_cols, input_shape)
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.weights.view()]
    }

    fn slots(&mut self) -> Vec<ParamSlot<'_>> {
        vec![self.weights.slot()]
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::{rngs::StdRng, SeedableRng};

    fn layer(in_channels: usize, filters: usize, kernel: usize, stride: usize, padding: usize) -> Conv2DLayer {
        let mut rng = StdRng::seed_from_u64(7);
        Conv2DLayer::new(in_channels, filters, (kernel, kernel), stride, padding, &mut rng)
    }

    #[test]
    fn output_dimensions() {
        let conv = layer(1, 4, 7, 2, 3);
        assert_eq!(conv.output_hw(32, 32), (16, 16));
        assert_eq!(conv.output_hw(1, 1), (1, 1));

        let out = conv.infer(&Array4::zeros((2, 1, 32, 20)));
        assert_eq!(out.dim(), (2, 4, 16, 10));
    }

    #[test]
    fn matches_direct_convolution() {
        let mut conv = layer(2, 3, 3, 1, 1);
        let input = Array::from_shape_fn((2, 2, 4, 5), |(n, c, y, x)| {
            (n * 40 + c * 20 + y * 5 + x) as f64 * 0.1 - 1.0
        });
        let out = conv.forward(&input);

        let w = &conv.weights.value;
        for n in 0..2 {
            for f in 0..3 {
                for y in 0..4 {
                    for x in 0..5 {
                        let mut expected = 0.0;
                        for c in 0..2 {
                            for ki in 0..3 {
                                for kj in 0..3 {
                                    let iy = y as isize + ki as isize - 1;
                                    let ix = x as isize + kj as isize - 1;
                                    if iy < 0 || ix < 0 || iy >= 4 || ix >= 5 {
                                        continue;
                                    }
                                    expected += w[[f, (c * 3 + ki) * 3 + kj]]
                                        * input[[n, c, iy as usize, ix as usize]];
                                }
                            }
                        }
                        assert!((out[[n, f, y, x]] - expected).abs() < 1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let mut conv = layer(1, 2, 3, 2, 1);
        let input = Array::from_shape_fn((1, 1, 5, 5), |(_, _, y, x)| ((y * 5 + x) as f64).sin());

        // loss = sum(output), so dL/doutput = 1
        let out = conv.forward(&input);
        let grad_input = conv.backward(&Array4::ones(out.raw_dim()));

        let eps = 1e-6;
        for &(y, x) in &[(0, 0), (2, 3), (4, 4)] {
            let mut plus = input.clone();
            plus[[0, 0, y, x]] += eps;
            let mut minus = input.clone();
            minus[[0, 0, y, x]] -= eps;
            let numeric = (conv.infer(&plus).sum() - conv.infer(&minus).sum()) / (2.0 * eps);
            assert!((numeric - grad_input[[0, 0, y, x]]).abs() < 1e-6);
        }

        let analytic = conv.weights.grad[[1, 4]];
        conv.weights.value[[1, 4]] += eps;
        let up = conv.infer(&input).sum();
        conv.weights.value[[1, 4]] -= 2.0 * eps;
        let down = conv.infer(&input).sum();
        assert!(((up - down) / (2.0 * eps) - analytic).abs() < 1e-6);
    }
}
