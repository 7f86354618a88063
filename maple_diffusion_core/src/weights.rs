use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use candle_core::{DType, Device, Result as CandleResult, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{Init, VarBuilder};
use memmap2::Mmap;

use crate::error::{DiffusionError, Result};

/// Handle to a flat, content-addressed model directory.
///
/// Every tensor lives in its own raw little-endian dump named
/// `<layerPath>.<weight|bias>[_fp32].bin`. Files are memory-mapped on demand
/// and validated against the declared shape: a byte-length mismatch is an
/// unrecoverable data-integrity failure, not something to paper over.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    dir: PathBuf,
}

impl ModelWeights {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(DiffusionError::MissingModelFile(dir));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bin_path(&self, name: &str, fp32: bool) -> PathBuf {
        let suffix = if fp32 { "_fp32" } else { "" };
        self.dir.join(format!("{name}{suffix}.bin"))
    }

    /// Whether a half-precision constant of this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.bin_path(name, false).is_file()
    }

    fn mapped(&self, path: &Path, expected: usize) -> Result<Mmap> {
        let file =
            File::open(path).map_err(|_| DiffusionError::MissingModelFile(path.to_path_buf()))?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() != expected {
            return Err(DiffusionError::WeightSize {
                path: path.to_path_buf(),
                expected,
                found: map.len(),
            });
        }
        Ok(map)
    }

    /// Load a half-precision constant of the given shape.
    pub fn load(&self, name: &str, shape: &[usize], device: &Device) -> Result<Tensor> {
        let path = self.bin_path(name, false);
        let expected = shape.iter().product::<usize>() * DType::F16.size_in_bytes();
        let map = self.mapped(&path, expected)?;
        Ok(Tensor::from_raw_buffer(&map, DType::F16, shape, device)?)
    }

    /// Load a single-precision constant (stored with the `_fp32` suffix).
    pub fn load_fp32(&self, name: &str, shape: &[usize], device: &Device) -> Result<Tensor> {
        let path = self.bin_path(name, true);
        let expected = shape.iter().product::<usize>() * DType::F32.size_in_bytes();
        let map = self.mapped(&path, expected)?;
        Ok(Tensor::from_raw_buffer(&map, DType::F32, shape, device)?)
    }

    /// Read a half-precision table into host memory, widened to f32.
    pub fn read_f16_values(&self, name: &str, count: usize) -> Result<Vec<f32>> {
        let path = self.bin_path(name, false);
        let map = self.mapped(&path, count * 2)?;
        Ok(map
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect())
    }

    /// Read a single-precision table into host memory.
    pub fn read_f32_values(&self, name: &str, count: usize) -> Result<Vec<f32>> {
        let path = self.bin_path(name, true);
        let map = self.mapped(&path, count * 4)?;
        let mut values = vec![0f32; count];
        LittleEndian::read_f32_into(&map, &mut values);
        Ok(values)
    }

    /// Read a text file (the merge-rank table) from the model directory.
    pub fn text_file(&self, file_name: &str) -> Result<String> {
        let path = self.dir.join(file_name);
        std::fs::read_to_string(&path).map_err(|_| DiffusionError::MissingModelFile(path))
    }

    /// A `VarBuilder` over this directory, so model constructors can pull
    /// weights by dotted path the usual way. All stored tensors are f16 and
    /// are converted to `dtype` on load. Load failures cross the `candle`
    /// boundary wrapped (surfacing as [`DiffusionError::Core`]), with the
    /// typed size/missing-file error carried inside.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_backend(
            Box::new(WeightsBackend {
                weights: self.clone(),
            }),
            dtype,
            device.clone(),
        )
    }
}

struct WeightsBackend {
    weights: ModelWeights,
}

impl SimpleBackend for WeightsBackend {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _: Init,
        dtype: DType,
        dev: &Device,
    ) -> CandleResult<Tensor> {
        let tensor = self
            .weights
            .load(name, s.dims(), dev)
            .map_err(candle_core::Error::wrap)?;
        tensor.to_dtype(dtype)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.weights.contains(name)
    }
}
