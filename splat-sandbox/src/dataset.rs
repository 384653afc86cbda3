use image::Luma;
use splat_core::CameraIntrinsics;
use splat_slam::{DepthImage, Frame, StorageError};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

/// One line of an association file: a color image and the depth image taken with it.
#[derive(Clone, Debug, PartialEq)]
pub struct Association {
    pub timestamp: f64,
    pub color: PathBuf,
    pub depth: PathBuf,
}

/// Reads `timestamp color_path depth_timestamp depth_path` lines as written by the TUM
/// RGB-D `associate.py` tool. Relative image paths are resolved against the file's directory.
pub fn read_associations(path: impl AsRef<Path>) -> Result<Vec<Association>, StorageError> {
    let path = path.as_ref();
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let file = File::open(path).map_err(|source| StorageError::Io {
        path: path.to_owned(),
        source,
    })?;
    let mut associations = vec![];
    for (ix, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StorageError::Io {
            path: path.to_owned(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let timestamp = match (fields.len(), fields.first().map(|t| t.parse::<f64>())) {
            (4, Some(Ok(timestamp))) => timestamp,
            _ => {
                return Err(StorageError::Parse {
                    path: path.to_owned(),
                    line: ix + 1,
                })
            }
        };
        associations.push(Association {
            timestamp,
            color: base.join(fields[1]),
            depth: base.join(fields[3]),
        });
    }
    Ok(associations)
}

fn open(path: &Path) -> Result<image::DynamicImage, StorageError> {
    image::open(path).map_err(|source| StorageError::Image {
        path: path.to_owned(),
        source,
    })
}

/// Loads a frame, converting 16 bit depth to meters by dividing by `depth_scale`.
pub fn load_frame(
    id: u64,
    association: &Association,
    intrinsics: CameraIntrinsics,
    depth_scale: f64,
) -> Result<Frame, StorageError> {
    let color = open(&association.color)?.into_rgb32f();
    let raw = open(&association.depth)?.into_luma16();
    let depth = DepthImage::from_fn(raw.width(), raw.height(), |u, v| {
        Luma([(raw.get_pixel(u, v).0[0] as f64 / depth_scale) as f32])
    });
    Ok(Frame::new(id, association.timestamp, color, depth, intrinsics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    #[test]
    fn associations_resolve_next_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("associations.txt");
        std::fs::write(
            &path,
            "# color depth\n1305031102.175304 rgb/a.png 1305031102.160407 depth/a.png\n\n",
        )
        .unwrap();
        let associations = read_associations(&path).unwrap();
        assert_eq!(
            associations,
            vec![Association {
                timestamp: 1305031102.175304,
                color: dir.path().join("rgb/a.png"),
                depth: dir.path().join("depth/a.png"),
            }]
        );
    }

    #[test]
    fn short_lines_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("associations.txt");
        std::fs::write(&path, "1.0 rgb/a.png\n").unwrap();
        assert!(matches!(
            read_associations(&path),
            Err(StorageError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn depth_is_scaled_to_meters() {
        let dir = tempfile::tempdir().unwrap();
        let association = Association {
            timestamp: 0.5,
            color: dir.path().join("color.png"),
            depth: dir.path().join("depth.png"),
        };
        RgbImage::from_pixel(4, 3, Rgb([255, 0, 0]))
            .save(&association.color)
            .unwrap();
        ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(4, 3, Luma([10000]))
            .save(&association.depth)
            .unwrap();
        let frame = load_frame(7, &association, CameraIntrinsics::identity(), 5000.0).unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(frame.dimensions(), (4, 3));
        assert_eq!(frame.depth.get_pixel(1, 1).0[0], 2.0);
        assert_eq!(frame.color.get_pixel(0, 0).0, [1.0, 0.0, 0.0]);
    }
}
