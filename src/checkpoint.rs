//! Checkpoint Save/Load
//!
//! A checkpoint is a complete snapshot of the model parameters, plus the
//! optimizer moments when training should be resumable. One file is written
//! per checkpoint event, named `chkpt_<iteration>.bin`.
//!
//! ## Format (version 1, little-endian)
//!
//! ```text
//! "SCRIBE_CKPT"                       magic
//! u8                                  format version
//! u32 + bytes                         Config as JSON
//! u32 + bytes                         CheckpointMetadata as JSON
//! u32                                 parameter tensor count
//! per tensor:
//!     u32 + bytes                     name (UTF-8)
//!     u32                             rank
//!     u32 × rank                      dims
//!     f32 × prod(dims)                data
//! u8                                  1 if optimizer state follows
//! optimizer state:
//!     u64                             step
//!     f32 × 5                         lr, beta1, beta2, epsilon, weight_decay
//!     tensor × count                  first moments (same names as parameters)
//!     tensor × count                  second moments
//! ```
//!
//! Loading rebuilds the model from the stored config and then requires every
//! stored tensor to match that model's parameter name and shape, in order.
//! Shapes are checked before any tensor data is read.

use crate::config::Config;
use crate::error::{Result, ScribeError};
use crate::layers::{Visit, VisitMut};
use crate::model::LanguageModel;
use crate::optimizer::{AdamW, AdamWConfig};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 11] = b"SCRIBE_CKPT";
const VERSION: u8 = 1;

/// Training progress stored next to the weights.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub iteration: usize,
    pub epoch: usize,
    pub train_loss: Option<f32>,
    pub val_loss: Option<f32>,
}

/// A loaded checkpoint.
pub struct Checkpoint {
    pub model: LanguageModel,
    pub optimizer: Option<AdamW>,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// File name used for the checkpoint written at `iteration`.
    pub fn file_name(iteration: usize) -> String {
        format!("chkpt_{}.bin", iteration)
    }

    /// Write a checkpoint file.
    ///
    /// The data goes to `<path>.tmp` first and is renamed into place once
    /// complete, so a file under the final name is never partial.
    pub fn save<P: AsRef<Path>>(
        path: P,
        model: &LanguageModel,
        optimizer: Option<&AdamW>,
        metadata: &CheckpointMetadata,
    ) -> Result<()> {
        let path = path.as_ref();
        println!("💾 Saving checkpoint to {}...", path.display());

        let tmp_path = path.with_extension("bin.tmp");
        let written = write_file(&tmp_path, model, optimizer, metadata)
            .and_then(|()| fs::rename(&tmp_path, path).map_err(ScribeError::from));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        let size = fs::metadata(path)?.len() as f64 / 1_000_000.0;
        println!(
            "   {:.2} MB, iteration {}{}",
            size,
            metadata.iteration,
            if optimizer.is_some() { ", with optimizer state" } else { "" }
        );
        Ok(())
    }

    /// Read a checkpoint file and rebuild the model it describes.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        println!("📂 Loading checkpoint from {}...", path.display());
        let mut reader = BufReader::new(File::open(path)?);
        decode(&mut reader)
    }
}

fn write_file(
    path: &Path,
    model: &LanguageModel,
    optimizer: Option<&AdamW>,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    encode(&mut writer, &model.config, model, optimizer, metadata)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Serialize a checkpoint into any writer.
pub fn encode<W: Write>(
    writer: &mut W,
    config: &Config,
    params: &dyn Visit,
    optimizer: Option<&AdamW>,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;
    write_bytes(writer, serde_json::to_string(config)?.as_bytes())?;
    write_bytes(writer, serde_json::to_string(metadata)?.as_bytes())?;

    let mut tensors = Vec::new();
    params.visit("", &mut |name, t| tensors.push((name.to_string(), t)));
    writer.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for (name, tensor) in &tensors {
        write_tensor(writer, name, tensor)?;
    }

    match optimizer {
        Some(opt) => {
            writer.write_all(&[1u8])?;
            writer.write_all(&opt.step.to_le_bytes())?;
            let c = opt.config;
            for value in [c.lr, c.beta1, c.beta2, c.epsilon, c.weight_decay] {
                writer.write_all(&value.to_le_bytes())?;
            }
            for (name, m) in opt.names.iter().zip(&opt.m) {
                write_tensor(writer, name, m)?;
            }
            for (name, v) in opt.names.iter().zip(&opt.v) {
                write_tensor(writer, name, v)?;
            }
        }
        None => writer.write_all(&[0u8])?,
    }
    Ok(())
}

/// Deserialize a checkpoint from any reader.
pub fn decode<R: Read>(reader: &mut R) -> Result<Checkpoint> {
    let mut magic = [0u8; 11];
    read_exact(reader, &mut magic)?;
    if &magic != MAGIC {
        return Err(ScribeError::Checkpoint(
            "invalid header, expected SCRIBE_CKPT".to_string(),
        ));
    }
    let mut version = [0u8; 1];
    read_exact(reader, &mut version)?;
    if version[0] != VERSION {
        return Err(ScribeError::Checkpoint(format!(
            "unsupported format version {}",
            version[0]
        )));
    }

    let config: Config = serde_json::from_slice(&read_bytes(reader)?)?;
    let metadata: CheckpointMetadata = serde_json::from_slice(&read_bytes(reader)?)?;
    let mut model = LanguageModel::new(&config)?;
    let expected = model.parameter_shapes();

    let count = read_u32(reader)? as usize;
    if count != expected.len() {
        return Err(ScribeError::Checkpoint(format!(
            "checkpoint holds {} tensors, model has {} parameters",
            count,
            expected.len()
        )));
    }
    let mut params: Vec<Tensor> = Vec::with_capacity(count);
    for (name, shape) in &expected {
        params.push(read_expected_tensor(reader, name, shape)?);
    }
    let mut slots: Vec<&mut Tensor> = Vec::with_capacity(count);
    model.visit_mut("", &mut |_, t| slots.push(t));
    for (slot, tensor) in slots.into_iter().zip(params) {
        *slot = tensor;
    }

    let mut flag = [0u8; 1];
    read_exact(reader, &mut flag)?;
    let optimizer = match flag[0] {
        0 => None,
        1 => {
            let step = read_u64(reader)?;
            let config = AdamWConfig {
                lr: read_f32(reader)?,
                beta1: read_f32(reader)?,
                beta2: read_f32(reader)?,
                epsilon: read_f32(reader)?,
                weight_decay: read_f32(reader)?,
            };
            let mut m = Vec::with_capacity(count);
            for (name, shape) in &expected {
                m.push((name.clone(), read_expected_tensor(reader, name, shape)?));
            }
            let mut v = Vec::with_capacity(count);
            for (name, shape) in &expected {
                v.push((name.clone(), read_expected_tensor(reader, name, shape)?));
            }
            let mut optimizer = AdamW::new(&model, config.lr);
            optimizer.config = config;
            optimizer.restore(step, m, v)?;
            Some(optimizer)
        }
        other => {
            return Err(ScribeError::Checkpoint(format!(
                "invalid optimizer flag {}",
                other
            )))
        }
    };

    Ok(Checkpoint {
        model,
        optimizer,
        metadata,
    })
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn write_tensor<W: Write>(writer: &mut W, name: &str, tensor: &Tensor) -> Result<()> {
    write_bytes(writer, name.as_bytes())?;
    writer.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
    for &dim in &tensor.shape {
        writer.write_all(&(dim as u32).to_le_bytes())?;
    }
    for &value in &tensor.data {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// `read_exact` with end-of-file reported as a truncated checkpoint.
fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ScribeError::Checkpoint("file is truncated".to_string())
        } else {
            ScribeError::Io(e)
        }
    })
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(reader)? as usize;
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(ScribeError::Checkpoint("file is truncated".to_string()));
    }
    Ok(bytes)
}

/// Read one tensor, failing on a name or shape other than the expected one.
fn read_expected_tensor<R: Read>(reader: &mut R, name: &str, shape: &[usize]) -> Result<Tensor> {
    let stored_name = String::from_utf8(read_bytes(reader)?)
        .map_err(|_| ScribeError::Checkpoint("tensor name is not UTF-8".to_string()))?;
    if stored_name != name {
        return Err(ScribeError::Checkpoint(format!(
            "found tensor {}, expected {}",
            stored_name, name
        )));
    }

    let rank = read_u32(reader)? as usize;
    if rank != shape.len() {
        return Err(ScribeError::Checkpoint(format!(
            "tensor {} has rank {}, expected {}",
            name,
            rank,
            shape.len()
        )));
    }
    let mut stored_shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        stored_shape.push(read_u32(reader)? as usize);
    }
    if stored_shape != shape {
        return Err(ScribeError::Checkpoint(format!(
            "tensor {} has shape {:?}, expected {:?}",
            name, stored_shape, shape
        )));
    }

    let numel: usize = shape.iter().product();
    let mut bytes = vec![0u8; numel * 4];
    read_exact(reader, &mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn trained_model() -> (LanguageModel, AdamW) {
        let mut model = LanguageModel::new(&Config::tiny(12)).unwrap();
        let mut optimizer = AdamW::new(&model, 1e-3);
        for _ in 0..3 {
            let (_, cache) = model
                .forward_train(&[vec![1, 2, 3], vec![4, 5, 6]], &[vec![2, 3, 4], vec![5, 6, 7]])
                .unwrap();
            let grads = model.backward(&cache);
            optimizer.step(&mut model, &grads);
        }
        (model, optimizer)
    }

    #[test]
    fn test_roundtrip_reproduces_logits_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(Checkpoint::file_name(3));
        let (model, optimizer) = trained_model();
        let input = [vec![3, 1, 4, 1, 5]];
        let before = model.forward(&input, None).unwrap().logits;

        let metadata = CheckpointMetadata {
            iteration: 3,
            epoch: 0,
            train_loss: Some(2.4),
            val_loss: None,
        };
        Checkpoint::save(&path, &model, Some(&optimizer), &metadata).unwrap();
        assert!(path.ends_with("chkpt_3.bin"));

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.metadata, metadata);
        assert_eq!(loaded.model.config, model.config);
        assert_eq!(loaded.model.named_parameters(), model.named_parameters());

        let after = loaded.model.forward(&input, None).unwrap().logits;
        assert_eq!(before.data, after.data);

        let restored = loaded.optimizer.unwrap();
        assert_eq!(restored.step, 3);
        assert_eq!(restored.config, optimizer.config);
        assert_eq!(restored.m, optimizer.m);
        assert_eq!(restored.v, optimizer.v);
    }

    #[test]
    fn test_save_leaves_only_the_final_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(Checkpoint::file_name(7));
        let (model, optimizer) = trained_model();
        Checkpoint::save(&path, &model, Some(&optimizer), &CheckpointMetadata::default()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["chkpt_7.bin".to_string()]);
    }

    #[test]
    fn test_failed_save_cleans_up_temporary_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(Checkpoint::file_name(7));
        // a directory under the final name makes the rename fail
        fs::create_dir(&path).unwrap();
        let (model, _) = trained_model();

        assert!(Checkpoint::save(&path, &model, None, &CheckpointMetadata::default()).is_err());
        assert!(path.is_dir());
        assert!(!path.with_extension("bin.tmp").exists());
    }

    #[test]
    fn test_weights_only_checkpoint() {
        let (model, _) = trained_model();
        let mut bytes = Vec::new();
        encode(&mut bytes, &model.config, &model, None, &CheckpointMetadata::default()).unwrap();
        let loaded = decode(&mut Cursor::new(bytes)).unwrap();
        assert!(loaded.optimizer.is_none());
        assert_eq!(loaded.model.lm_head.weight, model.lm_head.weight);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let (model, _) = trained_model();
        let mut bytes = Vec::new();
        encode(&mut bytes, &model.config, &model, None, &CheckpointMetadata::default()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode(&mut Cursor::new(bytes)),
            Err(ScribeError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let (model, optimizer) = trained_model();
        let mut bytes = Vec::new();
        encode(
            &mut bytes,
            &model.config,
            &model,
            Some(&optimizer),
            &CheckpointMetadata::default(),
        )
        .unwrap();
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            decode(&mut Cursor::new(bytes)),
            Err(ScribeError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_with_stored_config_is_rejected() {
        let (model, _) = trained_model();
        let wider = Config {
            n_embd: 32,
            ..model.config.clone()
        };
        let mut bytes = Vec::new();
        encode(&mut bytes, &wider, &model, None, &CheckpointMetadata::default()).unwrap();

        match decode(&mut Cursor::new(bytes)) {
            Err(ScribeError::Checkpoint(msg)) => assert!(msg.contains("shape"), "{}", msg),
            other => panic!("expected shape error, got {:?}", other.map(|c| c.metadata)),
        }
    }
}
