use ndarray::Array1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loss {
    /// L1 loss: mean |prediction - target|, in the label's own units.
    #[default]
    MeanAbsoluteError,
}

impl Loss {
    /// Batch-mean loss, the quantity that gets differentiated.
    pub fn calculate(&self, prediction: &Array1<f64>, target: &Array1<f64>) -> f64 {
        if prediction.is_empty() {
            return 0.0;
        }
        self.sum(prediction, target) / prediction.len() as f64
    }

    /// Summed loss over the batch, used for sample-weighted reporting.
    pub fn sum(&self, prediction: &Array1<f64>, target: &Array1<f64>) -> f64 {
        match self {
            Loss::MeanAbsoluteError => ndarray::Zip::from(prediction)
                .and(target)
                .fold(0.0, |acc, &p, &t| acc + (p - t).abs()),
        }
    }

    /// d calculate / d prediction.
    pub fn gradient(&self, prediction: &Array1<f64>, target: &Array1<f64>) -> Array1<f64> {
        let n = prediction.len().max(1) as f64;
        match self {
            Loss::MeanAbsoluteError => {
                // Subgradient 0 where the prediction is exact
                ndarray::Zip::from(prediction)
                    .and(target)
                    .map_collect(|&p, &t| {
                        let diff = p - t;
                        if diff > 0.0 {
                            1.0 / n
                        } else if diff < 0.0 {
                            -1.0 / n
                        } else {
                            0.0
                        }
                    })
            }
        }
    }
}
