use crate::{map::SplatPoint, writers::persist_atomic, StorageError};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use splat_core::{
    nalgebra::{Point3, Vector3},
    CameraToWorld,
};
use std::{
    io::{BufWriter, Write},
    path::Path,
};

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    pub focal_length: f64,
}

impl ExportCamera {
    /// A camera marker of the given size placed at a camera pose.
    pub fn from_pose(pose: CameraToWorld, focal_length: f64) -> Self {
        Self {
            optical_center: Point3::from(pose.center()),
            // Camera space y points down.
            up_direction: pose.0.rotation * -Vector3::y(),
            forward_direction: pose.forward(),
            focal_length,
        }
    }
}

fn to8b(x: f64) -> u8 {
    (255.0 * x.clamp(0.0, 1.0)) as u8
}

pub fn export(
    mut writer: impl Write,
    points: &[SplatPoint],
    cameras: Vec<ExportCamera>,
    camera_faces: bool,
) -> std::io::Result<usize> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from splat-slam".to_string());

    // Camera marker vertices share the element with the points and get zero normals.
    let mut point_element = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z", "nx", "ny", "nz"] {
        let p = PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::Double));
        point_element.properties.add(p);
    }
    for name in ["red", "green", "blue"] {
        let p = PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::UChar));
        point_element.properties.add(p);
    }
    ply.header.elements.add(point_element);

    if camera_faces {
        let mut face_element = ElementDef::new("face".to_string());
        let vertex_list = PropertyDef::new(
            "vertex_index".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        );
        face_element.properties.add(vertex_list);
        ply.header.elements.add(face_element);
    }

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, n: Vector3<f64>, rgb: [u8; 3]| -> usize {
        let mut vertex = DefaultElement::new();
        let coordinates = p.iter().chain(n.iter());
        for (name, &value) in ["x", "y", "z", "nx", "ny", "nz"].iter().zip(coordinates) {
            vertex.insert(name.to_string(), Property::Double(value));
        }
        for (name, value) in ["red", "green", "blue"].iter().zip(rgb) {
            vertex.insert(name.to_string(), Property::UChar(value));
        }
        vertices.push(vertex);
        vertices.len() - 1
    };

    let mut add_triangle = |corners: [usize; 3]| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(corners.iter().map(|&i| i as i32).collect()),
        );
        faces.push(face);
    };

    for ExportCamera {
        optical_center,
        up_direction,
        forward_direction,
        focal_length,
    } in cameras
    {
        let right_direction = forward_direction.cross(&up_direction);
        let center_point = add_vertex(optical_center, Vector3::zeros(), CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    optical_center
                        + forward_direction * focal_length
                        + up as f64 * up_direction * focal_length
                        + right as f64 * right_direction * focal_length,
                    Vector3::zeros(),
                    CAMERA_COLOR,
                )
            });

        if camera_faces {
            // A pyramid with its apex on the optical center.
            let rim = [down_right, up_right, up_left, down_left];
            for (i, &corner) in rim.iter().enumerate() {
                add_triangle([center_point, corner, rim[(i + 1) % 4]]);
            }
        }
    }

    for point in points.iter().filter(|p| p.is_finite()) {
        add_vertex(
            point.position,
            point.normal,
            [to8b(point.color.x), to8b(point.color.y), to8b(point.color.z)],
        );
    }

    ply.payload.insert("vertex".to_string(), vertices);
    if camera_faces {
        ply.payload.insert("face".to_string(), faces);
    }

    let w = Writer::new();
    w.write_ply(&mut writer, &mut ply)
}

/// Exports points and camera markers to an ASCII PLY file, replacing it atomically.
pub fn export_file(
    path: impl AsRef<Path>,
    points: &[SplatPoint],
    cameras: Vec<ExportCamera>,
    camera_faces: bool,
) -> Result<(), StorageError> {
    let path = path.as_ref();
    persist_atomic(path, |file| {
        let mut writer = BufWriter::new(file);
        export(&mut writer, points, cameras, camera_faces).map_err(StorageError::io(path))?;
        writer.flush().map_err(StorageError::io(path))
    })
}
