mod common;

use common::*;
use splat_core::nalgebra::Vector3;
use splat_slam::{FrameMap, Mapper, PointSplatRenderer};

#[test]
fn sliding_views_promote_points_and_never_demote_them() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let mut mapper = Mapper::new(&settings, PointSplatRenderer::default());

    let mut promoted = 0;
    let mut stable = 0;
    for id in 0..6 {
        let center = Vector3::new(0.05 * id as f64, 0.0, 0.0);
        let mut frame = plane_frame(id, center).with_pose(camera_at(center));
        let frame_map = FrameMap::from_frame(&frame, 0.1, 10.0, 4, frame.pose).unwrap();
        mapper.receive(&frame).unwrap();
        let report = mapper
            .mapping(&mut frame, &frame_map, id, &settings.optimization)
            .unwrap();

        promoted += report.promoted;
        assert_eq!(mapper.get_stable_num(), stable + report.promoted);
        stable = mapper.get_stable_num();
        if id >= 3 {
            assert!(promoted > 0, "nothing promoted after frame {}", id);
        }
        assert!(counters_hold(&mapper));
    }
    assert!(mapper.map().stable().all(|(_, p)| p.observations >= 3));
    assert_eq!(mapper.optimized_frame_ids(), &[0, 1, 2, 3, 4, 5]);
}
