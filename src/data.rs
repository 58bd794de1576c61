use std::fs;
use std::path::Path;

use ndarray::{Array1, Array4};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One labelled image as produced by the upstream preparation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Pixels in `(channel, row, column)` order.
    pub image: Vec<f64>,
    /// Skeletal age in months.
    pub age: f64,
}

/// A materialized dataset: every image already rescaled, cropped and
/// converted, sharing one `(channels, height, width)` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedDataset {
    pub shape: [usize; 3],
    pub samples: Vec<Sample>,
}

impl PreparedDataset {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let dataset: PreparedDataset = serde_json::from_str(&json)?;
        dataset.check()?;
        Ok(dataset)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Random images in `[0, 1)` with ages in `[0, 228)` months, reproducible from `seed`.
    pub fn synthetic(samples: usize, shape: [usize; 3], seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let pixels = shape.iter().product();
        let samples = (0..samples)
            .map(|_| Sample {
                image: (0..pixels).map(|_| rng.f64()).collect(),
                age: rng.f64() * 228.0,
            })
            .collect();
        PreparedDataset { shape, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn check(&self) -> Result<()> {
        let pixels: usize = self.shape.iter().product();
        if let Some(bad) = self.samples.iter().find(|s| s.image.len() != pixels) {
            return Err(Error::ShapeMismatch {
                what: "dataset sample",
                got: vec![bad.image.len()],
                expected: vec![pixels],
            });
        }
        Ok(())
    }

    /// Groups samples into batches of `batch_size`, after one shuffle when a
    /// seed is given. The last batch may be smaller.
    pub fn into_loader(self, batch_size: usize, shuffle_seed: Option<u64>) -> Result<DataLoader> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".to_string()));
        }
        self.check()?;

        let PreparedDataset { shape, mut samples } = self;
        if let Some(seed) = shuffle_seed {
            fastrand::Rng::with_seed(seed).shuffle(&mut samples);
        }

        let [channels, height, width] = shape;
        let mut batches = Vec::with_capacity(samples.len().div_ceil(batch_size));
        for chunk in samples.chunks(batch_size) {
            let pixels: Vec<f64> = chunk.iter().flat_map(|s| s.image.iter().copied()).collect();
            let images = Array4::from_shape_vec((chunk.len(), channels, height, width), pixels)
                .map_err(|_| Error::ShapeMismatch {
                    what: "batch images",
                    got: vec![chunk.len()],
                    expected: vec![chunk.len(), channels, height, width],
                })?;
            let targets = chunk.iter().map(|s| s.age).collect();
            batches.push(Batch { images, targets });
        }

        Ok(DataLoader::new(batches, batch_size))
    }
}

/// Images and their labels, consumed once per loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array4<f64>,
    pub targets: Array1<f64>,
}

impl Batch {
    pub fn new(images: Array4<f64>, targets: Array1<f64>) -> Result<Self> {
        let batch = Batch { images, targets };
        batch.check()?;
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Image count and label count must agree.
    pub fn check(&self) -> Result<()> {
        let images = self.images.dim().0;
        if images != self.targets.len() {
            return Err(Error::ShapeMismatch {
                what: "batch targets",
                got: vec![self.targets.len()],
                expected: vec![images],
            });
        }
        Ok(())
    }
}

/// An ordered, reusable sequence of batches.
#[derive(Debug, Clone, Default)]
pub struct DataLoader {
    batches: Vec<Batch>,
    batch_size: usize,
    num_samples: usize,
}

impl DataLoader {
    pub fn new(batches: Vec<Batch>, batch_size: usize) -> Self {
        let num_samples = batches.iter().map(|b| b.len()).sum();
        DataLoader {
            batches,
            batch_size,
            num_samples,
        }
    }

    /// Nominal batch size, used for progress reporting only.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Total samples across all batches, the divisor of every pass average.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = &'a Batch;
    type IntoIter = std::slice::Iter<'a, Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
