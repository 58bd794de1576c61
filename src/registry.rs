use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::block::BlockKind;
use crate::model::{ModelConfig, ResNet};
use crate::{Error, Result};

/// The fixed set of variants a run can choose from, indexed by position.
pub const ARCHITECTURES: [Architecture; 4] = [
    Architecture { index: 0, block: BlockKind::Basic, depths: [2, 2, 2, 2] },
    Architecture { index: 1, block: BlockKind::Basic, depths: [3, 4, 6, 3] },
    Architecture { index: 2, block: BlockKind::Bottleneck, depths: [3, 4, 6, 3] },
    Architecture { index: 3, block: BlockKind::Bottleneck, depths: [3, 4, 23, 3] },
];

/// One registry entry: block kind and blocks per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Architecture {
    index: usize,
    pub block: BlockKind,
    pub depths: [usize; 4],
}

impl Architecture {
    /// Looks up a variant, failing before anything is allocated.
    pub fn from_index(index: usize) -> Result<Self> {
        ARCHITECTURES.get(index).copied().ok_or_else(|| Error::UnknownArchitecture {
            given: index.to_string(),
            available: ARCHITECTURES.len(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Conventional name of the variant, e.g. `resnet18`.
    pub fn name(&self) -> String {
        let convs_per_block = match self.block {
            BlockKind::Basic => 2,
            BlockKind::Bottleneck => 3,
        };
        let layers = self.depths.iter().sum::<usize>() * convs_per_block + 2;
        format!("resnet{layers}")
    }

    pub fn build(&self, config: ModelConfig, seed: u64) -> Result<ResNet> {
        ResNet::new(self.block, &self.depths, config, seed)
    }
}

impl Default for Architecture {
    fn default() -> Self {
        ARCHITECTURES[0]
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || Error::UnknownArchitecture {
            given: s.to_string(),
            available: ARCHITECTURES.len(),
        };
        let s = s.trim();
        if let Ok(index) = s.parse::<usize>() {
            return Architecture::from_index(index).map_err(|_| unknown());
        }
        ARCHITECTURES
            .iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(unknown)
    }
}

impl TryFrom<usize> for Architecture {
    type Error = Error;

    fn try_from(index: usize) -> Result<Self> {
        Architecture::from_index(index)
    }
}

impl From<Architecture> for usize {
    fn from(architecture: Architecture) -> Self {
        architecture.index
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} blocks, depths {:?})",
            self.name(),
            self.block,
            self.depths
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_layer_count() {
        let names: Vec<_> = ARCHITECTURES.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["resnet18", "resnet34", "resnet50", "resnet101"]);
    }

    #[test]
    fn parses_index_and_name() {
        assert_eq!("2".parse::<Architecture>().unwrap(), ARCHITECTURES[2]);
        assert_eq!("ResNet34".parse::<Architecture>().unwrap(), ARCHITECTURES[1]);
    }

    #[test]
    fn rejects_unknown_selectors() {
        for bad in ["4", "-1", "resnet152", ""] {
            let err = bad.parse::<Architecture>().unwrap_err();
            assert!(matches!(err, Error::UnknownArchitecture { available: 4, .. }), "{bad}");
        }
    }

    #[test]
    fn serializes_as_index() {
        let json = serde_json::to_string(&ARCHITECTURES[3]).unwrap();
        assert_eq!(json, "3");
        let back: Architecture = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ARCHITECTURES[3]);
        assert!(serde_json::from_str::<Architecture>("7").is_err());
    }
}
