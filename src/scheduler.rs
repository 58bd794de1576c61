/// Step decay: the learning rate is multiplied by `gamma` every `step_size`
/// epochs, whatever the loss does.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLR {
    pub base_lr: f64,
    pub step_size: usize,
    pub gamma: f64,
    epoch: usize,
}

impl StepLR {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        StepLR {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }

    /// Epochs completed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Learning rate in effect for the current epoch.
    pub fn learning_rate(&self) -> f64 {
        let decays = (self.epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Closes an epoch and returns the learning rate for the next one.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.learning_rate()
    }
}
