use ndarray::ArrayD;

use crate::layers::ParamSlot;
use crate::model::ResNet;
use crate::scheduler::StepLR;
use crate::{Error, Result};

/// Applies accumulated gradients to parameter values.
pub trait Optimizer {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    /// One update over `slots`, which must be the layout the optimizer was built for.
    fn step(&mut self, slots: Vec<ParamSlot<'_>>) -> Result<()>;
}

/// Adam with bias correction. Moment buffers mirror the parameter tensors
/// of the model it was created for.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    beta1_t: f64,
    beta2_t: f64,
    steps: u64,
    m: Vec<ArrayD<f64>>,
    v: Vec<ArrayD<f64>>,
}

impl Adam {
    pub fn new(model: &ResNet, learning_rate: f64) -> Self {
        Self::with_betas(model, learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(model: &ResNet, learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        let m: Vec<ArrayD<f64>> = model
            .parameters()
            .iter()
            .map(|p| ArrayD::zeros(p.raw_dim()))
            .collect();
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.0,
            beta2_t: 1.0,
            steps: 0,
            v: m.clone(),
            m,
        }
    }

    /// Number of optimizer steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer for Adam {
    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn step(&mut self, slots: Vec<ParamSlot<'_>>) -> Result<()> {
        if slots.len() != self.m.len() {
            return Err(Error::OptimizerMismatch { got: slots.len(), expected: self.m.len() });
        }
        if let Some((slot, m)) = slots.iter().zip(&self.m).find(|(s, m)| s.value.shape() != m.shape()) {
            return Err(Error::ShapeMismatch {
                what: "optimizer state",
                got: slot.value.shape().to_vec(),
                expected: m.shape().to_vec(),
            });
        }

        let Self { learning_rate: lr, beta1: b1, beta2: b2, epsilon: eps, .. } = *self;
        self.beta1_t *= b1;
        self.beta2_t *= b2;
        self.steps += 1;
        let bc1 = 1.0 - self.beta1_t;
        let bc2 = 1.0 - self.beta2_t;

        for ((mut slot, m), v) in slots.into_iter().zip(self.m.iter_mut()).zip(self.v.iter_mut()) {
            ndarray::Zip::from(&mut slot.value)
                .and(&slot.grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

/// Optimizer plus learning-rate schedule, bound to one model's parameter set.
#[derive(Debug, Clone)]
pub struct OptimizationState<O: Optimizer = Adam> {
    pub optimizer: O,
    pub scheduler: StepLR,
}

impl OptimizationState<Adam> {
    /// Fresh Adam state for `model`; the schedule decays by `gamma` every epoch.
    pub fn adam(model: &ResNet, learning_rate: f64, gamma: f64) -> Self {
        OptimizationState {
            optimizer: Adam::new(model, learning_rate),
            scheduler: StepLR::new(learning_rate, 1, gamma),
        }
    }
}

impl<O: Optimizer> OptimizationState<O> {
    pub fn zero_grad(&self, model: &mut ResNet) {
        model.zero_gradients();
    }

    pub fn step(&mut self, model: &mut ResNet) -> Result<()> {
        self.optimizer.step(model.slots())
    }

    /// Moves the schedule one epoch forward and returns the new learning rate.
    pub fn advance_schedule(&mut self) -> f64 {
        let learning_rate = self.scheduler.step();
        self.optimizer.set_learning_rate(learning_rate);
        learning_rate
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}
