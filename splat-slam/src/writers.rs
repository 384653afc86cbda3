use crate::{
    frame::{ColorImage, DepthImage},
    StorageError,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use ndarray::{Array1, Array3};
use ndarray_npy::NpzWriter;
use splat_core::{CameraToWorld, Pose};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Writes a file through a temporary file in the same directory and moves it into place,
/// so readers only ever see the previous or the complete new contents.
pub(crate) fn persist_atomic(
    path: &Path,
    write: impl FnOnce(&mut File) -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(StorageError::io(&dir))?;
    let mut file = NamedTempFile::new_in(&dir).map_err(StorageError::io(&dir))?;
    write(file.as_file_mut())?;
    file.as_file_mut()
        .sync_all()
        .map_err(StorageError::io(path))?;
    file.persist(path).map_err(|source| StorageError::Persist {
        path: path.to_owned(),
        source,
    })?;
    Ok(())
}

pub const TUM_HEADER: &str = "# timestamp tx ty tz qx qy qz qw";

/// Appends poses to a trajectory file in the TUM RGB-D text format.
pub struct TumTrajectoryWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl TumTrajectoryWriter {
    /// Creates or truncates the file and writes the header line.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_owned();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(StorageError::io(dir))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(StorageError::io(&path))?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path,
        };
        writeln!(writer.file, "{}", TUM_HEADER).map_err(StorageError::io(&writer.path))?;
        writer.file.flush().map_err(StorageError::io(&writer.path))?;
        Ok(writer)
    }

    /// Appends one pose and flushes it to disk.
    pub fn write(&mut self, timestamp: f64, pose: CameraToWorld) -> Result<(), StorageError> {
        let [tx, ty, tz, qx, qy, qz, qw] = pose.to_tum();
        writeln!(
            self.file,
            "{} {} {} {} {} {} {} {}",
            timestamp, tx, ty, tz, qx, qy, qz, qw
        )
        .map_err(StorageError::io(&self.path))?;
        self.file.flush().map_err(StorageError::io(&self.path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every pose of a TUM RGB-D trajectory file, skipping comments and blank lines.
pub fn read_tum(path: impl AsRef<Path>) -> Result<Vec<(f64, CameraToWorld)>, StorageError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(StorageError::io(path))?;
    let mut poses = vec![];
    for (ix, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(StorageError::io(path))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parse_error = || StorageError::Parse {
            path: path.to_owned(),
            line: ix + 1,
        };
        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| parse_error())?;
        if values.len() != 8 {
            return Err(parse_error());
        }
        let mut tum = [0.0; 7];
        tum.copy_from_slice(&values[1..]);
        let pose = CameraToWorld::from_tum(tum).ok_or_else(parse_error)?;
        poses.push((values[0], pose));
    }
    Ok(poses)
}

/// Keeps a compressed `.npz` archive of poses consistent with every write.
///
/// The archive holds `poses` (N x 4 x 4 camera to world matrices) and `timestamps` (N).
/// It is rewritten in full on every write. Entries keep the order their timestamps were first seen.
pub struct NpzTrajectoryWriter {
    path: PathBuf,
    entries: Vec<(f64, CameraToWorld)>,
    /// Position in `entries` by timestamp bits, with `-0.0` folded into `0.0`.
    index: BTreeMap<u64, usize>,
}

impl NpzTrajectoryWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            entries: vec![],
            index: BTreeMap::new(),
        }
    }

    fn insert(&mut self, timestamp: f64, pose: CameraToWorld) {
        let key = (timestamp + 0.0).to_bits();
        match self.index.get(&key) {
            Some(&ix) => self.entries[ix].1 = pose,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((timestamp, pose));
            }
        }
    }

    /// Adds a pose, replacing any pose with the same timestamp, and rewrites the archive.
    pub fn write(&mut self, timestamp: f64, pose: CameraToWorld) -> Result<(), StorageError> {
        self.insert(timestamp, pose);
        self.flush()
    }

    /// Adds every pose like [`NpzTrajectoryWriter::write`] but rewrites the archive once.
    pub fn write_all(
        &mut self,
        poses: impl IntoIterator<Item = (f64, CameraToWorld)>,
    ) -> Result<(), StorageError> {
        for (timestamp, pose) in poses {
            self.insert(timestamp, pose);
        }
        self.flush()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn flush(&self) -> Result<(), StorageError> {
        let mut poses = Array3::<f64>::zeros((self.entries.len(), 4, 4));
        for (ix, (_, pose)) in self.entries.iter().enumerate() {
            let matrix = pose.homogeneous();
            for r in 0..4 {
                for c in 0..4 {
                    poses[[ix, r, c]] = matrix[(r, c)];
                }
            }
        }
        let timestamps: Array1<f64> = self.entries.iter().map(|&(t, _)| t).collect();
        let archive_error = |source| StorageError::Archive {
            path: self.path.clone(),
            source,
        };
        persist_atomic(&self.path, |file| {
            let mut npz = NpzWriter::new_compressed(file);
            npz.add_array("poses", &poses).map_err(archive_error)?;
            npz.add_array("timestamps", &timestamps)
                .map_err(archive_error)?;
            npz.finish().map_err(archive_error)?;
            Ok(())
        })
    }
}

/// How an image is encoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageCategory {
    /// Quantized to 8 bits per channel and written as PNG.
    Color,
    /// Written with full float precision as OpenEXR.
    Raw,
}

#[derive(Copy, Clone, Debug)]
pub enum ImageData<'a> {
    Rgb(&'a ColorImage),
    Luma(&'a DepthImage),
}

/// Writes evaluation images under a work directory.
#[derive(Clone, Debug)]
pub struct ImageWriter {
    pub workdir: PathBuf,
    pub enabled: bool,
}

impl ImageWriter {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            enabled: true,
        }
    }

    pub fn disabled(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            enabled: false,
        }
    }

    /// Writes `<workdir>/<rel_path>/<name>.<png|exr>` and returns its path.
    ///
    /// Returns `None` without touching the disk when the writer is disabled.
    pub fn write_image(
        &self,
        name: &str,
        category: ImageCategory,
        data: ImageData<'_>,
        rel_path: impl AsRef<Path>,
    ) -> Result<Option<PathBuf>, StorageError> {
        if !self.enabled {
            return Ok(None);
        }
        let (image, format, extension) = match category {
            ImageCategory::Color => (quantize(data), ImageFormat::Png, "png"),
            ImageCategory::Raw => (raw(data), ImageFormat::OpenExr, "exr"),
        };
        let path = self
            .workdir
            .join(rel_path)
            .join(format!("{}.{}", name, extension));
        persist_atomic(&path, |file| {
            image
                .write_to(file, format)
                .map_err(|source| StorageError::Image {
                    path: path.clone(),
                    source,
                })
        })?;
        Ok(Some(path))
    }
}

/// `255 * clamp(x, 0, 1)`, rounded toward zero.
fn to8b(x: f32) -> u8 {
    (255.0 * x.clamp(0.0, 1.0)) as u8
}

fn quantize(data: ImageData<'_>) -> DynamicImage {
    match data {
        ImageData::Rgb(image) => DynamicImage::ImageRgb8(RgbImage::from_fn(
            image.width(),
            image.height(),
            |u, v| {
                let Rgb([r, g, b]) = *image.get_pixel(u, v);
                Rgb([to8b(r), to8b(g), to8b(b)])
            },
        )),
        ImageData::Luma(image) => DynamicImage::ImageLuma8(GrayImage::from_fn(
            image.width(),
            image.height(),
            |u, v| Luma([to8b(image.get_pixel(u, v).0[0])]),
        )),
    }
}

fn raw(data: ImageData<'_>) -> DynamicImage {
    match data {
        ImageData::Rgb(image) => DynamicImage::ImageRgb32F(image.clone()),
        ImageData::Luma(image) => DynamicImage::ImageRgb32F(ColorImage::from_fn(
            image.width(),
            image.height(),
            |u, v| {
                let d = image.get_pixel(u, v).0[0];
                Rgb([d, d, d])
            },
        )),
    }
}
