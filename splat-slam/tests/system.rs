mod common;

use common::*;
use image::Luma;
use splat_core::{nalgebra::Vector3, CameraToWorld, Pose};
use splat_slam::{
    read_tum, Checkpoint, Confidence, DepthImage, PointSplatRenderer, SlamError, SlamSystem,
};
use std::sync::atomic::Ordering;

fn system(dir: &std::path::Path) -> SlamSystem<PointSplatRenderer> {
    SlamSystem::new(settings(dir), PointSplatRenderer::default()).unwrap()
}

#[test]
fn identical_frames_stay_put() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut system = system(dir.path());

    let first = system.process_frame(plane_frame(0, Vector3::zeros())).unwrap();
    assert!(first.tracking.converged);
    assert!(first.mapping.keyframe);
    assert!(first.mapping.allocated > 0);
    let points = system.mapper().get_unstable_num();

    for id in 1..3 {
        let report = system.process_frame(plane_frame(id, Vector3::zeros())).unwrap();
        assert!(report.tracking.converged);
        assert!(report.tracking.pose.translation_distance(CameraToWorld::identity()) < 1e-6);
        assert!(report.tracking.pose.rotation_angle(CameraToWorld::identity()) < 1e-6);
        assert_eq!(report.mapping.allocated, 0);
        assert!(!report.mapping.keyframe);
        assert!(report.status.depth_residual < 1e-4);
    }
    assert_eq!(system.mapper().get_unstable_num(), points);
    assert!(system.tracker().warnings().is_empty());
    assert!(counters_hold(system.mapper()));
}

#[test]
fn a_full_run_writes_every_artifact() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut system = system(dir.path());
    let summary = system
        .run((0..3).map(|id| plane_frame(id, Vector3::zeros())))
        .unwrap();

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.keyframes, 1);
    assert!(summary.global.is_some());
    assert!(summary.global_error.is_none());
    assert!(summary.storage_errors.is_empty());
    assert!(summary.psnr.is_finite() && summary.psnr > 0.0);
    let text = summary.to_string();
    assert!(text.contains("System FPS:"));
    assert!(text.contains("PSNR:"));

    let save = dir.path();
    let trajectory = read_tum(save.join("traj_tum.txt")).unwrap();
    assert_eq!(trajectory.len(), 3);
    for (_, pose) in &trajectory {
        assert!(pose.translation_distance(CameraToWorld::identity()) < 1e-6);
    }
    for file in [
        "config.json",
        "traj.npz",
        "traj_tracking.txt",
        "timings.json",
        "save_model/latest.bin",
        "eval_render/000000_rgb.png",
        "eval_render/000000_gt.png",
        "eval_render/000000_depth.exr",
        "renders/000002_rgb.png",
    ] {
        assert!(save.join(file).is_file(), "{} is missing", file);
    }

    let checkpoint = Checkpoint::load(save.join("save_model/latest.bin")).unwrap();
    assert_eq!(checkpoint.time, 3);
    assert_eq!(checkpoint.trajectory.len(), 3);
    assert_eq!(checkpoint.frames.map(|f| f.len()), Some(3));
    assert_eq!(
        checkpoint.stable.len() + checkpoint.unstable.len(),
        summary.stable_points + summary.unstable_points
    );
}

#[test]
fn checkpoints_carry_frames_and_the_last_keyframe_is_evaluated() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    // Every frame becomes a keyframe.
    settings.mapping.keyframe_coverage_gap = -1.0;
    let mut system = SlamSystem::new(settings, PointSplatRenderer::default()).unwrap();

    let report = system.process_frame(plane_frame(0, Vector3::zeros())).unwrap();
    let checkpoint = Checkpoint::load(report.checkpoint.unwrap()).unwrap();
    assert_eq!(checkpoint.frames.map(|f| f.len()), Some(1));

    for id in 1..3 {
        system.process_frame(plane_frame(id, Vector3::zeros())).unwrap();
    }
    let last = dir.path().join("eval_render/000002_rgb.png");
    assert!(!last.exists());
    let summary = system.finish().unwrap();
    assert_eq!(summary.keyframes, 3);
    assert!(last.is_file());
}

#[test]
fn a_large_jump_still_yields_a_usable_pose() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut system = system(dir.path());
    for id in 0..3 {
        system.process_frame(plane_frame(id, Vector3::zeros())).unwrap();
    }

    let report = system
        .process_frame(plane_frame(3, Vector3::new(0.3, 0.0, 0.0)))
        .unwrap();
    let pose = report.tracking.pose;
    assert!(pose.is_rigid(1e-6));
    assert!(pose.center().iter().all(|c| c.is_finite()));
    let confidence = system.history()[3].confidence;
    if report.tracking.converged {
        assert_eq!(confidence, Confidence::Nominal);
        assert!(report.tracking.warning.is_none());
    } else {
        assert_eq!(confidence, Confidence::LowConfidence);
        assert!(system
            .tracker()
            .warnings()
            .iter()
            .any(|w| w.frame_id == 3));
    }

    // The run goes on after a bad frame.
    system
        .process_frame(plane_frame(4, Vector3::new(0.3, 0.0, 0.0)))
        .unwrap();
    assert_eq!(system.mapper().trajectory().len(), 5);
    assert!(counters_hold(system.mapper()));
}

#[test]
fn failed_checkpoints_do_not_touch_the_map() {
    init_logging();
    let broken = tempfile::tempdir().unwrap();
    let clean = tempfile::tempdir().unwrap();
    let mut broken_system = system(broken.path());
    let mut clean_system = system(clean.path());

    // A regular file where the checkpoint directory should be.
    let save_model = broken.path().join("save_model");
    std::fs::remove_dir(&save_model).unwrap();
    std::fs::write(&save_model, b"in the way").unwrap();

    let report = broken_system
        .process_frame(plane_frame(0, Vector3::zeros()))
        .unwrap();
    assert!(report.checkpoint.is_none());
    assert!(!report.storage_errors.is_empty());
    let control = clean_system
        .process_frame(plane_frame(0, Vector3::zeros()))
        .unwrap();
    assert!(control.checkpoint.is_some());
    assert_eq!(report.mapping, control.mapping);
    assert_eq!(
        broken_system.mapper().get_unstable_num(),
        clean_system.mapper().get_unstable_num()
    );

    broken_system
        .process_frame(plane_frame(1, Vector3::zeros()))
        .unwrap();
    assert_eq!(broken_system.mapper().time, 2);
    let summary = broken_system.finish().unwrap();
    assert!(!summary.storage_errors.is_empty());
    assert!(broken.path().join("traj_tum.txt").is_file());
}

#[test]
fn save_path_below_a_file_is_a_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("file");
    std::fs::write(&file, b"").unwrap();
    let result = SlamSystem::new(settings(&file.join("run")), PointSplatRenderer::default());
    assert!(matches!(result, Err(SlamError::Storage(_))));
}

#[test]
fn frames_without_valid_depth_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut system = system(dir.path());
    let mut frame = plane_frame(0, Vector3::zeros());
    frame.depth = DepthImage::from_pixel(WIDTH, HEIGHT, Luma([0.0]));
    assert!(matches!(
        system.process_frame(frame),
        Err(SlamError::InvalidFrame { frame_id: 0, .. })
    ));
    assert!(system.mapper().trajectory().is_empty());

    // The rejected frame left nothing behind.
    system.process_frame(plane_frame(0, Vector3::zeros())).unwrap();
    assert_eq!(system.mapper().time, 1);
}

#[test]
fn frames_out_of_order_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut system = system(dir.path());
    system.process_frame(plane_frame(1, Vector3::zeros())).unwrap();
    assert!(matches!(
        system.process_frame(plane_frame(1, Vector3::zeros())),
        Err(SlamError::OutOfOrderFrame { frame_id: 1, last: 1 })
    ));
    assert!(matches!(
        system.process_frame(plane_frame(0, Vector3::zeros())),
        Err(SlamError::OutOfOrderFrame { frame_id: 0, last: 1 })
    ));
    assert_eq!(system.mapper().time, 1);
}

#[test]
fn cancellation_stops_before_the_next_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut system = system(dir.path());
    system.process_frame(plane_frame(0, Vector3::zeros())).unwrap();
    system.process_frame(plane_frame(1, Vector3::zeros())).unwrap();

    system.cancel_flag().store(true, Ordering::SeqCst);
    assert!(matches!(
        system.process_frame(plane_frame(2, Vector3::zeros())),
        Err(SlamError::Cancelled { frame_id: 2 })
    ));
    let summary = system
        .run((2..5).map(|id| plane_frame(id, Vector3::zeros())))
        .unwrap();
    assert!(summary.cancelled);
    assert!(summary.global.is_none());
    assert_eq!(summary.frames, 2);
    assert_eq!(read_tum(dir.path().join("traj_tum.txt")).unwrap().len(), 2);
}
