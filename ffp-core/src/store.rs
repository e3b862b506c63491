//! Chunked on-disk storage of footprint volumes
//!
//! A volume store is a Zarr v3 hierarchy:
//!
//! ```text
//! 2021-05_ffp/
//! ├── zarr.json       root group: batch, covariate names, format version
//! ├── fp/             footprint (time, y, x), one chunk per time index
//! ├── time/           seconds since 1970-01-01
//! ├── y/
//! ├── x/
//! └── USTAR/ ...      one (time) array per covariate
//! ```
//!
//! Every time index is its own chunk so that independent worker processes can write their
//! results without coordinating. A chunk that was never written reads as the fill value.
//!
//! The final volumes gzip their footprint chunks. The quantized form is a `uint16` array
//! whose attributes carry `scale_factor`, `add_offset`, `missing_value` and `_FillValue`, the
//! names a CF-style reader uses to decode it.

use crate::errors::{FfpError, FfpResult};
use crate::quantize::{QuantizationParams, SENTINEL};
use crate::record::BatchKey;
use crate::volume::{FootprintVolume, FOOTPRINT_VARIABLE};
use chrono::DateTime;
use indexmap::IndexMap;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::codec::GzipCodec;
use zarrs::array::{Array, ArrayBuilder, FillValue};
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::store::FilesystemStore;
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

/// Metadata document at the root of every store
pub const METADATA_FILE: &str = "zarr.json";
const FORMAT_VERSION: u32 = 1;
const TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";

type StoredArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Fill value of the `float32` footprint arrays
///
/// A NaN with its own payload: zarrs skips chunks equal to the fill value, and a missing
/// field (all `NaN`) must still be stored.
fn unwritten() -> f32 {
    f32::from_bits(0x7fc0_0fff)
}

/// Element type of the stored footprint values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Uint16,
}

impl DataType {
    fn zarr(self) -> zarrs::array::DataType {
        match self {
            DataType::Float32 => zarrs::array::DataType::Float32,
            DataType::Uint16 => zarrs::array::DataType::UInt16,
        }
    }

    fn fill_value(self) -> FillValue {
        match self {
            DataType::Float32 => FillValue::from(unwritten()),
            DataType::Uint16 => FillValue::from(SENTINEL),
        }
    }
}

/// Bytes-to-bytes compression of the footprint chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Codec {
    Raw,
    Gzip { level: u32 },
}

/// How the footprint variable of a store is encoded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkEncoding {
    /// Plain 32-bit floats, the transient form written by the workers
    Raw,
    /// 32-bit floats with gzip compression
    Lossless { level: u32 },
    /// Quantized 16-bit integers with gzip compression
    Lossy {
        params: QuantizationParams,
        level: u32,
    },
}

/// Attributes of the footprint array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMetadata {
    pub dtype: DataType,
    pub codec: Codec,
    pub chunk_shape: [usize; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_value: Option<u16>,
    #[serde(
        rename = "_FillValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub fill_value: Option<u16>,
}

impl VariableMetadata {
    fn for_encoding(encoding: &ChunkEncoding, chunk_shape: (usize, usize)) -> Self {
        let (dtype, codec, params) = match *encoding {
            ChunkEncoding::Raw => (DataType::Float32, Codec::Raw, None),
            ChunkEncoding::Lossless { level } => (DataType::Float32, Codec::Gzip { level }, None),
            ChunkEncoding::Lossy { params, level } => {
                (DataType::Uint16, Codec::Gzip { level }, Some(params))
            }
        };
        Self {
            dtype,
            codec,
            chunk_shape: [1, chunk_shape.0, chunk_shape.1],
            scale_factor: params.map(|p| p.scale_factor),
            add_offset: params.map(|p| p.add_offset),
            missing_value: params.map(|_| SENTINEL),
            fill_value: params.map(|_| SENTINEL),
        }
    }

    /// Quantization parameters of a `uint16` variable
    pub fn quantization(&self) -> Option<QuantizationParams> {
        match (self.scale_factor, self.add_offset) {
            (Some(scale_factor), Some(add_offset)) => Some(QuantizationParams {
                scale_factor,
                add_offset,
            }),
            _ => None,
        }
    }
}

/// Attributes of the root group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GroupAttributes {
    format_version: u32,
    batch: BatchKey,
    /// Covariate arrays in column order
    covariates: Vec<String>,
}

/// Everything a store records about its volume
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMetadata {
    pub format_version: u32,
    pub volume: FootprintVolume,
    pub footprint: VariableMetadata,
}

/// A volume read fully into memory
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedVolume {
    pub volume: FootprintVolume,
    /// Decoded footprint values, `(time, y, x)`, with missing values as `NaN`
    pub footprint: Array3<f32>,
}

/// Handle on a Zarr volume store
pub struct VolumeStore {
    root: PathBuf,
    metadata: VolumeMetadata,
    footprint: StoredArray,
}

impl fmt::Debug for VolumeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeStore")
            .field("root", &self.root)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn store_error(path: &Path, err: impl fmt::Display) -> FfpError {
    FfpError::Store {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn is_volume_store(path: &Path) -> bool {
    path.join(METADATA_FILE).is_file()
}

/// Remove a previous store at `path`, refusing to touch anything that is not a store
fn remove_existing_store(path: &Path) -> FfpResult<()> {
    if !path.exists() {
        return Ok(());
    }
    if !is_volume_store(path) {
        return Err(FfpError::Error(format!(
            "refusing to replace {}: it exists and is not a volume store",
            path.display()
        )));
    }
    fs::remove_dir_all(path).map_err(|e| FfpError::io(path, e))
}

fn staging_path(root: &Path) -> PathBuf {
    let mut name = root
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".staging");
    root.with_file_name(name)
}

fn open_storage(root: &Path) -> FfpResult<ReadableWritableListableStorage> {
    let store = FilesystemStore::new(root).map_err(|e| store_error(root, e))?;
    Ok(Arc::new(store))
}

fn to_attributes<T: Serialize>(root: &Path, value: &T) -> FfpResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(store_error(
            root,
            format!("attributes must be an object, not {other}"),
        )),
        Err(e) => Err(store_error(root, e)),
    }
}

fn from_attributes<T: DeserializeOwned>(root: &Path, attributes: &Map<String, Value>) -> FfpResult<T> {
    serde_json::from_value(Value::Object(attributes.clone())).map_err(|e| store_error(root, e))
}

fn node(name: &str) -> String {
    format!("/{name}")
}

/// Create a one-chunk 1-D array along `dimension`
fn series_array(
    storage: &ReadableWritableListableStorage,
    root: &Path,
    name: &str,
    dimension: &str,
    len: usize,
    data_type: zarrs::array::DataType,
    fill_value: FillValue,
    attributes: Map<String, Value>,
) -> FfpResult<StoredArray> {
    let array = ArrayBuilder::new(
        vec![len as u64],
        data_type,
        vec![len as u64]
            .try_into()
            .map_err(|e| store_error(root, e))?,
        fill_value,
    )
    .dimension_names([dimension].into())
    .attributes(attributes)
    .build(Arc::clone(storage), &node(name))
    .map_err(|e| store_error(root, e))?;
    array.store_metadata().map_err(|e| store_error(root, e))?;
    Ok(array)
}

fn open_array(
    storage: &ReadableWritableListableStorage,
    root: &Path,
    name: &str,
) -> FfpResult<StoredArray> {
    Array::open(Arc::clone(storage), &node(name)).map_err(|e| store_error(root, e))
}

fn units(units: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("units".to_string(), json!(units));
    map
}

impl VolumeStore {
    /// Create an empty store for `volume`, replacing any previous store at `root`
    ///
    /// Coordinates and covariates are written immediately, the footprint chunks are left
    /// for the workers.
    pub fn create(
        root: impl Into<PathBuf>,
        volume: &FootprintVolume,
        encoding: ChunkEncoding,
    ) -> FfpResult<Self> {
        let root = root.into();
        remove_existing_store(&root)?;
        fs::create_dir_all(&root).map_err(|e| FfpError::io(&root, e))?;
        let storage = open_storage(&root)?;

        let header = GroupAttributes {
            format_version: FORMAT_VERSION,
            batch: volume.key,
            covariates: volume.covariates.keys().cloned().collect(),
        };
        let group = GroupBuilder::new()
            .attributes(to_attributes(&root, &header)?)
            .build(Arc::clone(&storage), "/")
            .map_err(|e| store_error(&root, e))?;
        group.store_metadata().map_err(|e| store_error(&root, e))?;

        let n = volume.n_chunks();
        let seconds: Vec<i64> = volume
            .time
            .iter()
            .map(|t| t.and_utc().timestamp())
            .collect();
        let mut time_attributes = units(TIME_UNITS);
        time_attributes.insert("calendar".to_string(), json!("standard"));
        series_array(
            &storage,
            &root,
            "time",
            "time",
            n,
            zarrs::array::DataType::Int64,
            FillValue::from(0i64),
            time_attributes,
        )?
        .store_chunk_elements(&[0], &seconds)
        .map_err(|e| store_error(&root, e))?;

        for (name, coordinates) in [("y", &volume.y), ("x", &volume.x)] {
            series_array(
                &storage,
                &root,
                name,
                name,
                coordinates.len(),
                zarrs::array::DataType::Int32,
                FillValue::from(0i32),
                units("m"),
            )?
            .store_chunk_elements(&[0], coordinates.as_slice())
            .map_err(|e| store_error(&root, e))?;
        }

        for (name, values) in &volume.covariates {
            series_array(
                &storage,
                &root,
                name,
                "time",
                n,
                zarrs::array::DataType::Float32,
                FillValue::from(f32::NAN),
                Map::new(),
            )?
            .store_chunk_elements(&[0], values.as_slice())
            .map_err(|e| store_error(&root, e))?;
        }

        let (ny, nx) = volume.chunk_shape();
        let variable = VariableMetadata::for_encoding(&encoding, (ny, nx));
        let mut builder = ArrayBuilder::new(
            vec![n as u64, ny as u64, nx as u64],
            variable.dtype.zarr(),
            vec![1, ny as u64, nx as u64]
                .try_into()
                .map_err(|e| store_error(&root, e))?,
            variable.dtype.fill_value(),
        );
        builder
            .dimension_names(["time", "y", "x"].into())
            .attributes(to_attributes(&root, &variable)?);
        if let Codec::Gzip { level } = variable.codec {
            let gzip = GzipCodec::new(level).map_err(|e| store_error(&root, e))?;
            builder.bytes_to_bytes_codecs(vec![Box::new(gzip)]);
        }
        let footprint = builder
            .build(Arc::clone(&storage), &node(FOOTPRINT_VARIABLE))
            .map_err(|e| store_error(&root, e))?;
        footprint
            .store_metadata()
            .map_err(|e| store_error(&root, e))?;

        Ok(Self {
            root,
            metadata: VolumeMetadata {
                format_version: FORMAT_VERSION,
                volume: volume.clone(),
                footprint: variable,
            },
            footprint,
        })
    }

    /// Open an existing store
    pub fn open(root: impl Into<PathBuf>) -> FfpResult<Self> {
        let root = root.into();
        if !is_volume_store(&root) {
            return Err(store_error(&root, "not a volume store"));
        }
        let storage = open_storage(&root)?;

        let group = Group::open(Arc::clone(&storage), "/").map_err(|e| store_error(&root, e))?;
        let header: GroupAttributes = from_attributes(&root, group.attributes())?;
        if header.format_version != FORMAT_VERSION {
            return Err(store_error(
                &root,
                format!("unsupported format version {}", header.format_version),
            ));
        }

        let time = open_array(&storage, &root, "time")?
            .retrieve_chunk_elements::<i64>(&[0])
            .map_err(|e| store_error(&root, e))?
            .into_iter()
            .map(|s| {
                DateTime::from_timestamp(s, 0)
                    .map(|t| t.naive_utc())
                    .ok_or_else(|| store_error(&root, format!("time {s} is out of range")))
            })
            .collect::<FfpResult<Vec<_>>>()?;
        let y = open_array(&storage, &root, "y")?
            .retrieve_chunk_elements::<i32>(&[0])
            .map_err(|e| store_error(&root, e))?;
        let x = open_array(&storage, &root, "x")?
            .retrieve_chunk_elements::<i32>(&[0])
            .map_err(|e| store_error(&root, e))?;

        let mut covariates = IndexMap::new();
        for name in header.covariates {
            let values = open_array(&storage, &root, &name)?
                .retrieve_chunk_elements::<f32>(&[0])
                .map_err(|e| store_error(&root, e))?;
            covariates.insert(name, values);
        }

        let volume = FootprintVolume {
            key: header.batch,
            time,
            y,
            x,
            covariates,
        };

        let footprint = open_array(&storage, &root, FOOTPRINT_VARIABLE)?;
        let variable: VariableMetadata = from_attributes(&root, footprint.attributes())?;
        if footprint.data_type() != &variable.dtype.zarr() {
            return Err(store_error(
                &root,
                format!(
                    "footprint is stored as {:?} but described as {:?}",
                    footprint.data_type(),
                    variable.dtype
                ),
            ));
        }
        let (n, (ny, nx)) = (volume.n_chunks(), volume.chunk_shape());
        if footprint.shape() != [n as u64, ny as u64, nx as u64].as_slice() {
            return Err(store_error(
                &root,
                format!(
                    "footprint has shape {:?}, coordinates give {:?}",
                    footprint.shape(),
                    volume.shape()
                ),
            ));
        }

        Ok(Self {
            root,
            metadata: VolumeMetadata {
                format_version: header.format_version,
                volume,
                footprint: variable,
            },
            footprint,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &VolumeMetadata {
        &self.metadata
    }

    pub fn volume(&self) -> &FootprintVolume {
        &self.metadata.volume
    }

    pub fn n_chunks(&self) -> usize {
        self.metadata.volume.n_chunks()
    }

    /// File holding the footprint chunk of a time index
    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.root
            .join(FOOTPRINT_VARIABLE)
            .join("c")
            .join(index.to_string())
            .join("0")
            .join("0")
    }

    fn chunk_indices(index: usize) -> [u64; 3] {
        [index as u64, 0, 0]
    }

    fn chunk_error(&self, index: usize, err: impl fmt::Display) -> FfpError {
        FfpError::CorruptChunk {
            path: self.root.clone(),
            index,
            reason: err.to_string(),
        }
    }

    pub fn has_chunk(&self, index: usize) -> FfpResult<bool> {
        self.check_index(index)?;
        self.footprint
            .retrieve_encoded_chunk(&Self::chunk_indices(index))
            .map(|chunk| chunk.is_some())
            .map_err(|e| self.chunk_error(index, e))
    }

    /// Time indices whose chunk has not been written
    pub fn missing_chunks(&self) -> FfpResult<Vec<usize>> {
        let mut missing = Vec::new();
        for index in 0..self.n_chunks() {
            if !self.has_chunk(index)? {
                missing.push(index);
            }
        }
        Ok(missing)
    }

    /// Fail unless every chunk has been written
    pub fn ensure_complete(&self) -> FfpResult<()> {
        let missing = self.missing_chunks()?;
        if missing.is_empty() {
            return Ok(());
        }
        Err(FfpError::IncompleteVolume {
            path: self.root.clone(),
            missing: missing.len(),
            total: self.n_chunks(),
        })
    }

    fn check_index(&self, index: usize) -> FfpResult<()> {
        if index >= self.n_chunks() {
            return Err(self.chunk_error(
                index,
                format!("index out of range for {} chunks", self.n_chunks()),
            ));
        }
        Ok(())
    }

    /// Encode and write the field of one time index
    pub fn write_chunk(&self, index: usize, field: ArrayView2<f32>) -> FfpResult<()> {
        self.check_index(index)?;
        let expected = self.metadata.volume.chunk_shape();
        if field.dim() != expected {
            return Err(self.chunk_error(
                index,
                format!("field has shape {:?}, expected {:?}", field.dim(), expected),
            ));
        }

        let indices = Self::chunk_indices(index);
        let stored = match self.metadata.footprint.dtype {
            DataType::Float32 => {
                let values: Vec<f32> = field.iter().copied().collect();
                self.footprint.store_chunk_elements(&indices, &values)
            }
            DataType::Uint16 => {
                let params = self.quantization(index)?;
                let values: Vec<u16> = field.iter().map(|&v| params.encode(v)).collect();
                self.footprint.store_chunk_elements(&indices, &values)
            }
        };
        stored.map_err(|e| self.chunk_error(index, e))
    }

    fn to_field<T>(&self, index: usize, values: Vec<T>) -> FfpResult<Array2<T>> {
        Array2::from_shape_vec(self.metadata.volume.chunk_shape(), values)
            .map_err(|e| self.chunk_error(index, e))
    }

    /// Read and decode the field of one time index
    ///
    /// A chunk that was never written decodes to `NaN` everywhere.
    pub fn read_chunk(&self, index: usize) -> FfpResult<Array2<f32>> {
        self.check_index(index)?;
        let indices = Self::chunk_indices(index);
        let values = match self.metadata.footprint.dtype {
            DataType::Float32 => self
                .footprint
                .retrieve_chunk_elements::<f32>(&indices)
                .map_err(|e| self.chunk_error(index, e))?,
            DataType::Uint16 => {
                let params = self.quantization(index)?;
                self.footprint
                    .retrieve_chunk_elements::<u16>(&indices)
                    .map_err(|e| self.chunk_error(index, e))?
                    .into_iter()
                    .map(|e| params.decode(e))
                    .collect()
            }
        };
        self.to_field(index, values)
    }

    /// Stored integers of a quantized chunk, without decoding
    pub fn read_encoded_chunk(&self, index: usize) -> FfpResult<Array2<u16>> {
        self.check_index(index)?;
        if self.metadata.footprint.dtype != DataType::Uint16 {
            return Err(self.chunk_error(index, "variable is not quantized"));
        }
        let values = self
            .footprint
            .retrieve_chunk_elements::<u16>(&Self::chunk_indices(index))
            .map_err(|e| self.chunk_error(index, e))?;
        self.to_field(index, values)
    }

    fn quantization(&self, index: usize) -> FfpResult<QuantizationParams> {
        self.metadata
            .footprint
            .quantization()
            .ok_or_else(|| {
                self.chunk_error(index, "uint16 variable without scale_factor/add_offset")
            })
    }

    /// Read every chunk into memory
    pub fn load(&self) -> FfpResult<LoadedVolume> {
        let mut footprint = Array3::<f32>::zeros(self.metadata.volume.shape());
        for (index, mut slice) in footprint.axis_iter_mut(Axis(0)).enumerate() {
            slice.assign(&self.read_chunk(index)?);
        }

        Ok(LoadedVolume {
            volume: self.metadata.volume.clone(),
            footprint,
        })
    }

    /// Write a loaded volume to `root` with a new encoding
    ///
    /// The store is assembled next to `root` and swapped in once complete, so `root` may be
    /// the store the volume was loaded from.
    pub fn write_volume(
        root: impl Into<PathBuf>,
        loaded: &LoadedVolume,
        encoding: ChunkEncoding,
    ) -> FfpResult<Self> {
        let root = root.into();
        let staging = staging_path(&root);
        if staging.exists() {
            // left behind by an interrupted rewrite
            fs::remove_dir_all(&staging).map_err(|e| FfpError::io(&staging, e))?;
        }

        {
            let store = VolumeStore::create(&staging, &loaded.volume, encoding)?;
            for (index, field) in loaded.footprint.axis_iter(Axis(0)).enumerate() {
                store.write_chunk(index, field)?;
            }
        }

        remove_existing_store(&root)?;
        fs::rename(&staging, &root).map_err(|e| FfpError::io(&root, e))?;
        VolumeStore::open(root)
    }
}
