//! `.slck` checkpoint format: topology plus weights in one file.
//!
//! Layout:
//! ```text
//! ┌──────────────────────────────────┐
//! │ Magic: "SLCK" (4 bytes)          │
//! │ Version: u32 LE                  │
//! │ Header size: u32 LE              │
//! ├──────────────────────────────────┤
//! │ Header JSON (topology)           │
//! ├──────────────────────────────────┤
//! │ Padding to 64-byte alignment     │
//! ├──────────────────────────────────┤
//! │ Weight blob (f64 LE)             │
//! └──────────────────────────────────┘
//! ```
//!
//! The blob stores, per layer in order, the biases followed by every filter in
//! input-major order (`filters[0][0], filters[0][1], ..., filters[1][0], ...`),
//! each filter x-fastest.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sluice_core::{Cube, Result, SluiceError};

use crate::topology::{LayerWeights, NetworkSpec};

/// Magic bytes identifying a checkpoint.
pub const MAGIC: &[u8; 4] = b"SLCK";

/// Current format version.
pub const VERSION: u32 = 1;

const PREAMBLE: usize = 12;
const BLOB_ALIGNMENT: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointHeader {
    spec: NetworkSpec,
    params: usize,
}

/// A network topology together with its weights.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub spec: NetworkSpec,
    pub weights: Vec<LayerWeights>,
}

impl Checkpoint {
    pub fn new(spec: NetworkSpec, weights: Vec<LayerWeights>) -> Result<Self> {
        spec.validate()?;
        if weights.len() != spec.num_layers() {
            return Err(SluiceError::InvalidTopology(format!(
                "{} weight sets for {} layers",
                weights.len(),
                spec.num_layers()
            )));
        }
        for (l, w) in weights.iter().enumerate() {
            w.check(&spec, l)?;
        }
        Ok(Self { spec, weights })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = CheckpointHeader {
            spec: self.spec.clone(),
            params: self.spec.param_count(),
        };
        let header_json = serde_json::to_vec(&header)?;
        let header_size = u32::try_from(header_json.len())
            .map_err(|_| SluiceError::Checkpoint("header exceeds 4 GiB".into()))?;

        let blob_start = align_up(PREAMBLE + header_json.len(), BLOB_ALIGNMENT);
        let mut buf = Vec::with_capacity(blob_start + header.params * 8);

        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&header_json);
        buf.resize(blob_start, 0);

        for layer in &self.weights {
            for b in &layer.biases {
                buf.extend_from_slice(&b.to_le_bytes());
            }
            for row in &layer.filters {
                for filter in row {
                    for v in filter.as_slice() {
                        buf.extend_from_slice(&v.to_le_bytes());
                    }
                }
            }
        }
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PREAMBLE {
            return Err(SluiceError::Checkpoint("file too small".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(SluiceError::Checkpoint("invalid magic bytes (expected SLCK)".into()));
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != VERSION {
            return Err(SluiceError::Checkpoint(format!("unsupported version: {version}")));
        }

        let header_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if data.len() < PREAMBLE + header_size {
            return Err(SluiceError::Checkpoint("truncated header".into()));
        }
        let header: CheckpointHeader = serde_json::from_slice(&data[PREAMBLE..PREAMBLE + header_size])?;
        header
            .spec
            .validate()
            .map_err(|e| SluiceError::Checkpoint(format!("header topology: {e}")))?;
        if header.params != header.spec.param_count() {
            return Err(SluiceError::Checkpoint(format!(
                "header declares {} parameters, topology has {}",
                header.params,
                header.spec.param_count()
            )));
        }

        let blob_start = align_up(PREAMBLE + header_size, BLOB_ALIGNMENT);
        let blob = data.get(blob_start..).unwrap_or_default();
        if blob.len() != header.params * 8 {
            return Err(SluiceError::Checkpoint(format!(
                "weight blob is {} bytes, expected {}",
                blob.len(),
                header.params * 8
            )));
        }

        let mut values = blob
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]));

        let spec = header.spec;
        let mut weights = Vec::with_capacity(spec.num_layers());
        for (l, layer) in spec.layers.iter().enumerate() {
            let biases: Vec<f64> = values.by_ref().take(layer.num_outputs).collect();
            let mut filters = Vec::with_capacity(spec.layer_inputs(l));
            for _ in 0..spec.layer_inputs(l) {
                let mut row = Vec::with_capacity(layer.num_outputs);
                for _ in 0..layer.num_outputs {
                    let data = values.by_ref().take(layer.filter.numel()).collect();
                    row.push(Cube::from_vec(layer.filter, data));
                }
                filters.push(row);
            }
            weights.push(LayerWeights { filters, biases });
        }

        Ok(Self { spec, weights })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes()?)?;
        tracing::info!(path = %path.display(), params = self.spec.param_count(), "checkpoint saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let checkpoint = Self::from_bytes(&data)?;
        tracing::info!(path = %path.display(), layers = checkpoint.spec.num_layers(), "checkpoint loaded");
        Ok(checkpoint)
    }
}

/// Round `n` up to the next multiple of `align`.
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{random_weights, LayerSpec};

    fn sample() -> Checkpoint {
        let spec = NetworkSpec::new(2)
            .with_layer(LayerSpec::new(3, [3, 3, 1], 0.1))
            .with_layer(LayerSpec::new(1, [2, 2, 2], 0.01));
        let weights = random_weights(&spec, 9);
        Checkpoint::new(spec, weights).unwrap()
    }

    #[test]
    fn test_roundtrip_bytes() {
        let ckpt = sample();
        let bytes = ckpt.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(Checkpoint::from_bytes(&bytes).unwrap(), ckpt);
    }

    #[test]
    fn test_blob_is_aligned() {
        let ckpt = sample();
        let bytes = ckpt.to_bytes().unwrap();
        let header_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let blob_start = align_up(PREAMBLE + header_size, BLOB_ALIGNMENT);
        assert_eq!(blob_start % 64, 0);
        assert_eq!(bytes.len() - blob_start, ckpt.spec.param_count() * 8);
        // first value of the blob is layer 0's first bias
        let first = f64::from_le_bytes(bytes[blob_start..blob_start + 8].try_into().unwrap());
        assert_eq!(first, ckpt.weights[0].biases[0]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Checkpoint::from_bytes(&bytes), Err(SluiceError::Checkpoint(_))));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        let err = Checkpoint::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().to_bytes().unwrap();
        assert!(Checkpoint::from_bytes(&bytes[..bytes.len() - 8]).is_err());
        assert!(Checkpoint::from_bytes(&bytes[..20]).is_err());
        assert!(Checkpoint::from_bytes(&bytes[..4]).is_err());
    }

    fn frame(header: &CheckpointHeader) -> Vec<u8> {
        let json = serde_json::to_vec(header).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(json.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&json);
        bytes.resize(align_up(bytes.len(), BLOB_ALIGNMENT), 0);
        bytes
    }

    #[test]
    fn test_overflowing_header_is_rejected() {
        let header = CheckpointHeader {
            spec: NetworkSpec::new(1).with_layer(LayerSpec::new(1, [1 << 32, 1 << 32, 16], 0.1)),
            params: 0,
        };
        let err = Checkpoint::from_bytes(&frame(&header)).unwrap_err();
        assert!(matches!(err, SluiceError::Checkpoint(_)));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_param_count_mismatch() {
        let header = CheckpointHeader {
            spec: NetworkSpec::new(1).with_layer(LayerSpec::new(1, [2, 2, 1], 0.1)),
            params: 4,
        };
        let err = Checkpoint::from_bytes(&frame(&header)).unwrap_err();
        assert!(err.to_string().contains("declares 4 parameters"));
    }

    #[test]
    fn test_new_rejects_mismatched_weights() {
        let ckpt = sample();
        let mut weights = ckpt.weights.clone();
        weights.pop();
        assert!(Checkpoint::new(ckpt.spec.clone(), weights).is_err());
    }

    #[test]
    fn test_save_load_file() {
        let ckpt = sample();
        let path = std::env::temp_dir().join(format!("sluice-ckpt-{}.slck", std::process::id()));
        ckpt.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, ckpt);
    }
}
