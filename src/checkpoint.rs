use std::fs;
use std::mem::size_of;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::hyperparameters::Hyperparameters;
use crate::model::{ModelConfig, ResNet};
use crate::registry::ARCHITECTURES;
use crate::{Error, Result};

const MAGIC: [u8; 8] = *b"HTOACKPT";
const VERSION: u32 = 1;

/// Fixed-size start of every checkpoint file. Integers are little-endian.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Preamble {
    magic: [u8; 8],
    version: u32,
    header_len: u32,
}

/// Describes the tensors that follow it, enough to check a file against a
/// freshly built model before any value is copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Registry index, when the network is one of the registered variants.
    pub architecture: Option<usize>,
    pub block: BlockKind,
    pub depths: Vec<usize>,
    pub model: ModelConfig,
    pub parameter_count: usize,
    pub parameter_shapes: Vec<Vec<usize>>,
    pub buffer_shapes: Vec<Vec<usize>>,
}

impl CheckpointHeader {
    fn describe(model: &ResNet) -> Self {
        let architecture = ARCHITECTURES
            .iter()
            .find(|a| a.block == model.block && a.depths[..] == model.depths[..])
            .map(|a| a.index());
        CheckpointHeader {
            architecture,
            block: model.block,
            depths: model.depths.clone(),
            model: model.config,
            parameter_count: model.parameter_count(),
            parameter_shapes: shapes(&model.parameters()),
            buffer_shapes: shapes(&model.buffers()),
        }
    }
}

fn shapes(tensors: &[ArrayViewD<'_, f64>]) -> Vec<Vec<usize>> {
    tensors.iter().map(|t| t.shape().to_vec()).collect()
}

/// Writes model snapshots to a fixed path, overwriting the previous one.
#[derive(Debug, Clone)]
pub struct CheckpointSink {
    path: PathBuf,
}

impl CheckpointSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the run configuration is stored alongside the snapshot.
    pub fn config_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".json");
        PathBuf::from(path)
    }

    /// Serializes parameters and running statistics. The same model state
    /// always yields the same bytes.
    pub fn save(&self, model: &ResNet) -> Result<()> {
        let header = serde_json::to_vec(&CheckpointHeader::describe(model))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::InvalidConfig("checkpoint header too large".to_string()))?;
        let preamble = Preamble {
            magic: MAGIC,
            version: VERSION.to_le(),
            header_len: header_len.to_le(),
        };

        let values: Vec<u64> = model
            .parameters()
            .iter()
            .chain(model.buffers().iter())
            .flat_map(|t| t.iter().map(|x| x.to_bits().to_le()))
            .collect();

        let mut bytes = Vec::with_capacity(size_of::<Preamble>() + header.len() + values.len() * 8);
        bytes.extend_from_slice(bytemuck::bytes_of(&preamble));
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(bytemuck::cast_slice(&values));

        self.ensure_dir()?;
        fs::write(&self.path, bytes)?;
        info!("saved {} parameters to {}", model.parameter_count(), self.path.display());
        Ok(())
    }

    pub fn save_config(&self, hyperparameters: &Hyperparameters) -> Result<()> {
        let path = self.config_path();
        self.ensure_dir()?;
        hyperparameters.save(&path)?;
        debug!("saved run configuration to {}", path.display());
        Ok(())
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Reads only the header, e.g. to rebuild the matching network.
    pub fn read_header(path: impl AsRef<Path>) -> Result<CheckpointHeader> {
        let bytes = fs::read(path)?;
        let (header, _) = split(&bytes)?;
        Ok(header)
    }

    /// Restores a snapshot into `model`, which must have the same layout.
    pub fn load(path: impl AsRef<Path>, model: &mut ResNet) -> Result<CheckpointHeader> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let (header, payload) = split(&bytes)?;

        let expected = CheckpointHeader::describe(model);
        if header.parameter_shapes != expected.parameter_shapes
            || header.buffer_shapes != expected.buffer_shapes
        {
            return Err(Error::CheckpointMismatch(format!(
                "{} holds a {} network with depths {:?}, model is a {} network with depths {:?}",
                path.display(),
                header.block,
                header.depths,
                expected.block,
                expected.depths
            )));
        }

        let total: usize = header
            .parameter_shapes
            .iter()
            .chain(&header.buffer_shapes)
            .map(|s| s.iter().product::<usize>())
            .sum();
        if payload.len() != total * 8 {
            return Err(Error::CheckpointMismatch(format!(
                "expected {} bytes of tensor data, found {}",
                total * 8,
                payload.len()
            )));
        }
        let words: Vec<u64> = bytemuck::pod_collect_to_vec(payload);
        let mut values = words.into_iter().map(|w| f64::from_bits(u64::from_le(w)));

        for mut slot in model.slots() {
            slot.value.iter_mut().zip(values.by_ref()).for_each(|(dst, src)| *dst = src);
        }
        for mut buffer in model.buffers_mut() {
            buffer.iter_mut().zip(values.by_ref()).for_each(|(dst, src)| *dst = src);
        }

        info!("restored {} parameters from {}", header.parameter_count, path.display());
        Ok(header)
    }
}

fn split(bytes: &[u8]) -> Result<(CheckpointHeader, &[u8])> {
    let corrupt = |msg: &str| Error::CheckpointMismatch(msg.to_string());
    let start = size_of::<Preamble>();
    if bytes.len() < start {
        return Err(corrupt("file is shorter than the preamble"));
    }
    let preamble: Preamble = bytemuck::pod_read_unaligned(&bytes[..start]);
    if preamble.magic != MAGIC {
        return Err(corrupt("not a checkpoint file"));
    }
    if u32::from_le(preamble.version) != VERSION {
        return Err(corrupt("unsupported checkpoint version"));
    }
    let end = start + u32::from_le(preamble.header_len) as usize;
    if bytes.len() < end {
        return Err(corrupt("truncated header"));
    }
    let header = serde_json::from_slice(&bytes[start..end])?;
    Ok((header, &bytes[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn tiny(block: BlockKind, seed: u64) -> ResNet {
        let config = ModelConfig { base_width: 2, ..ModelConfig::default() };
        ResNet::new(block, &[1, 1, 1, 1], config, seed).unwrap()
    }

    #[test]
    fn load_restores_parameters_and_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CheckpointSink::new(dir.path().join("HtoA.ckpt"));

        let mut trained = tiny(BlockKind::Basic, 1);
        trained.forward(&Array4::from_elem((2, 1, 16, 16), 0.5)).unwrap();
        sink.save(&trained).unwrap();

        let mut fresh = tiny(BlockKind::Basic, 2);
        assert_ne!(fresh.flat_parameters(), trained.flat_parameters());
        let header = CheckpointSink::load(sink.path(), &mut fresh).unwrap();

        assert_eq!(header.parameter_count, trained.parameter_count());
        assert_eq!(header.architecture, None);
        assert_eq!(fresh.flat_parameters(), trained.flat_parameters());
        let stats = |m: &ResNet| m.buffers().iter().flat_map(|b| b.iter().copied().collect::<Vec<f64>>()).collect::<Vec<_>>();
        assert_eq!(stats(&fresh), stats(&trained));
    }

    #[test]
    fn rejects_a_different_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CheckpointSink::new(dir.path().join("HtoA.ckpt"));
        sink.save(&tiny(BlockKind::Basic, 1)).unwrap();

        let mut other = tiny(BlockKind::Bottleneck, 1);
        let err = CheckpointSink::load(sink.path(), &mut other).unwrap_err();
        assert!(matches!(err, Error::CheckpointMismatch(_)));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.ckpt");
        fs::write(&path, b"definitely not a checkpoint").unwrap();
        assert!(matches!(
            CheckpointSink::read_header(&path),
            Err(Error::CheckpointMismatch(_))
        ));
    }

    #[test]
    fn config_lives_next_to_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CheckpointSink::new(dir.path().join("HtoA.ckpt"));
        let hp = Hyperparameters { epochs: 3, ..Default::default() };
        sink.save_config(&hp).unwrap();
        assert_eq!(sink.config_path(), dir.path().join("HtoA.ckpt.json"));
        assert_eq!(Hyperparameters::load(sink.config_path()).unwrap(), hp);
    }
}
