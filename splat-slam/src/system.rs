use crate::{
    eval::{eval_frame, EvalReport},
    export::{export_file, ExportCamera},
    frame::Frame,
    global::GlobalReport,
    mapper::{MappingReport, Mapper},
    render::Renderer,
    settings::SlamSettings,
    timing::{TimeRecorder, Timings},
    tracker::{Tracker, TrackingReport, TrackingStatus},
    writers::{ImageWriter, NpzTrajectoryWriter, TumTrajectoryWriter},
    Result, SlamError, StorageError,
};
use average::{Estimate, Mean};
use log::*;
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// Everything that happened to one frame in the main loop.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub tracking: TrackingReport,
    pub mapping: MappingReport,
    pub status: TrackingStatus,
    /// Present on frames that hit the evaluation cadence.
    pub eval: Option<EvalReport>,
    /// The checkpoint written on this frame, if any.
    pub checkpoint: Option<PathBuf>,
    /// Writes that failed on this frame. They do not stop the loop.
    pub storage_errors: Vec<String>,
}

/// The final state of a run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub frames: usize,
    pub timings: Timings,
    /// Mean PSNR over every frame at its final pose.
    pub psnr: f64,
    pub depth_l1: f64,
    pub stable_points: usize,
    pub unstable_points: usize,
    pub keyframes: usize,
    pub low_confidence_frames: usize,
    pub mapping_warnings: usize,
    pub global: Option<GlobalReport>,
    /// Why global optimization was rolled back, if it was.
    pub global_error: Option<String>,
    pub storage_errors: Vec<String>,
    pub cancelled: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Frames: {}", self.frames)?;
        writeln!(f, "System FPS: {:.4}", self.timings.fps)?;
        writeln!(f, "Tracking seconds: {:.4}", self.timings.mean_tracking_seconds)?;
        writeln!(f, "Mapping seconds: {:.4}", self.timings.mean_mapping_seconds)?;
        writeln!(f, "PSNR: {:.4}", self.psnr)?;
        writeln!(f, "Depth L1: {:.4}", self.depth_l1)?;
        writeln!(
            f,
            "Points: {} stable, {} unstable",
            self.stable_points, self.unstable_points
        )?;
        writeln!(f, "Keyframes: {}", self.keyframes)?;
        write!(
            f,
            "Warnings: {} low confidence frames, {} mapping, {} storage",
            self.low_confidence_frames,
            self.mapping_warnings,
            self.storage_errors.len()
        )
    }
}

/// Runs tracking, mapping, evaluation and checkpointing over a stream of frames.
pub struct SlamSystem<R> {
    settings: SlamSettings,
    tracker: Tracker<R>,
    mapper: Mapper<R>,
    history: Vec<Frame>,
    time_recorder: TimeRecorder,
    image_writer: ImageWriter,
    cancel: Arc<AtomicBool>,
    storage_errors: Vec<String>,
}

impl<R: Renderer + Clone> SlamSystem<R> {
    /// Creates the run directories and writes the settings snapshot.
    pub fn new(settings: SlamSettings, renderer: R) -> Result<Self> {
        let mapper = Mapper::new(&settings, renderer.clone());
        mapper.create_workspace()?;
        let snapshot = settings.write_snapshot()?;
        info!(
            "writing run to {} with settings {} on devices {:?}",
            settings.save_path.display(),
            snapshot.display(),
            settings.device_list
        );
        Ok(Self {
            tracker: Tracker::new(
                settings.tracking,
                (settings.min_depth, settings.max_depth),
                renderer,
            ),
            mapper,
            history: vec![],
            time_recorder: TimeRecorder::new(),
            image_writer: ImageWriter::new(&settings.save_path),
            cancel: Arc::new(AtomicBool::new(false)),
            storage_errors: vec![],
            settings,
        })
    }

    /// A flag that stops the run before the next frame and skips the final global optimization.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn record_storage_error(&mut self, context: &str, error: StorageError) -> String {
        error!("{} failed, continuing: {}", context, error);
        let message = format!("{}: {}", context, error);
        self.storage_errors.push(message.clone());
        message
    }

    /// Tracks a frame, integrates it into the map, and evaluates and checkpoints on the
    /// configured cadence.
    pub fn process_frame(&mut self, mut frame: Frame) -> Result<FrameReport> {
        let frame_id = frame.id;
        if self.cancelled() {
            return Err(SlamError::Cancelled { frame_id });
        }

        let tracking_start = Instant::now();
        let frame_map = self.tracker.preprocess(&frame, frame_id)?;
        self.mapper.receive(&frame)?;
        let tracking = self.tracker.track(&mut frame, &frame_map, self.mapper.map());
        self.time_recorder.record_tracking(tracking_start.elapsed());

        let mapping_start = Instant::now();
        let poses = self.tracker.get_new_poses();
        self.mapper.update_poses(&poses)?;
        let mapping =
            self.mapper
                .mapping(&mut frame, &frame_map, frame_id, &self.settings.optimization)?;
        self.time_recorder.record_mapping(mapping_start.elapsed());

        let render = self.mapper.get_render_output(&frame);
        let status = self.tracker.update_last_status(
            &frame,
            &render.depth,
            &frame_map.depth,
            &render.camera_normals(),
            &frame_map.normals,
        );

        let mut eval = None;
        let mut checkpoint = None;
        let mut storage_errors = vec![];
        let time = self.mapper.time;
        if time == 1 || time % self.settings.save_step() == 0 {
            match eval_frame(
                &frame,
                &render,
                (self.settings.min_depth, self.settings.max_depth),
                &self.image_writer,
                "eval_render",
            ) {
                Ok(report) => eval = Some(report),
                Err(e) => storage_errors.push(self.record_storage_error("evaluation", e)),
            }
            match self.mapper.save_model(true) {
                Ok(path) => {
                    info!("saved checkpoint {}", path.display());
                    checkpoint = Some(path);
                }
                Err(e) => storage_errors.push(self.record_storage_error("checkpoint", e)),
            }
        }
        frame.rendered = Some(render);

        if self.settings.record_mem {
            let history: usize = self
                .history
                .iter()
                .map(|f| {
                    (f.color.as_raw().len() + f.depth.as_raw().len()) * std::mem::size_of::<f32>()
                })
                .sum();
            info!(
                "retained memory after frame {}: {:.2} MiB map and frames, {:.2} MiB history",
                frame_id,
                self.mapper.memory_estimate() as f64 / (1 << 20) as f64,
                history as f64 / (1 << 20) as f64
            );
        }

        // The history only keeps what the final evaluation needs.
        frame.rendered = None;
        self.history.push(frame);

        Ok(FrameReport {
            tracking,
            mapping,
            status,
            eval,
            checkpoint,
            storage_errors,
        })
    }

    /// Runs the terminal global optimization and writes every final artifact.
    pub fn finish(&mut self) -> Result<RunSummary> {
        info!(
            "main loop finished with {} stable and {} unstable points",
            self.mapper.get_stable_num(),
            self.mapper.get_unstable_num()
        );
        info!("processed frames: {:?}", self.mapper.optimized_frame_ids());
        info!(
            "keyframes: {:?}",
            self.mapper.keyframes().iter().map(|k| k.frame_id).collect::<Vec<_>>()
        );

        let poses = self.tracker.get_new_poses();
        self.mapper.update_poses(&poses)?;

        let cancelled = self.cancelled();
        let mut global = None;
        let mut global_error = None;
        if cancelled {
            warn!("run was cancelled, skipping global optimization");
        } else {
            match self
                .mapper
                .global_optimization(&self.settings.optimization, true)
            {
                Ok(report) => global = Some(report),
                Err(SlamError::OptimizationDivergence(reason)) => {
                    error!("global optimization rolled back: {}", reason);
                    global_error = Some(reason);
                }
                Err(e) => return Err(e),
            }
        }

        for frame in &mut self.history {
            if let Some(pose) = self.mapper.trajectory().pose(frame.id) {
                frame.pose = pose;
            }
        }

        let mut failures = vec![];
        let last_keyframe = self.mapper.keyframes().last().map(|k| k.frame_id);
        if let Some(frame) = last_keyframe.and_then(|id| self.history.iter().find(|f| f.id == id)) {
            let render = self.mapper.get_render_output(frame);
            if let Err(e) = eval_frame(
                frame,
                &render,
                (self.settings.min_depth, self.settings.max_depth),
                &self.image_writer,
                "eval_render",
            ) {
                failures.push(("last keyframe evaluation", e));
            }
        }

        let mut psnr = Mean::new();
        let mut depth_l1 = Mean::new();
        for frame in &self.history {
            let render = self.mapper.get_render_output(frame);
            match eval_frame(
                frame,
                &render,
                (self.settings.min_depth, self.settings.max_depth),
                &self.image_writer,
                "renders",
            ) {
                Ok(report) => {
                    if report.pixels > 0 {
                        psnr.add(report.psnr);
                        depth_l1.add(report.depth_l1);
                    }
                }
                Err(e) => failures.push(("final evaluation", e)),
            }
        }
        for (context, e) in failures {
            self.record_storage_error(context, e);
        }

        if let Err(e) = self.write_trajectories() {
            self.record_storage_error("trajectory", e);
        }
        if let Err(e) = self.mapper.save_model(true) {
            self.record_storage_error("final checkpoint", e);
        }
        if let Err(e) = self
            .tracker
            .save_trajectory(self.settings.save_path.join("traj_tracking.txt"))
        {
            self.record_storage_error("tracking trajectory", e);
        }

        let timings = self.time_recorder.timings();
        if let Err(e) = timings.save(self.settings.save_path.join("timings.json")) {
            self.record_storage_error("timings", e);
        }

        if self.settings.pcd_densify {
            let points = self.mapper.densify(&self.settings.densify);
            let cameras = self
                .mapper
                .keyframe_poses()
                .into_iter()
                .map(|pose| ExportCamera::from_pose(pose, 0.05))
                .collect();
            let path = self
                .settings
                .save_path
                .join("save_model")
                .join("pcd_densify.ply");
            match export_file(&path, &points, cameras, false) {
                Ok(()) => info!("exported {} points to {}", points.len(), path.display()),
                Err(e) => {
                    self.record_storage_error("densified point cloud", e);
                }
            }
        }

        let mean = |m: &Mean| if m.is_empty() { 0.0 } else { m.mean() };
        let summary = RunSummary {
            frames: self.history.len(),
            timings,
            psnr: mean(&psnr),
            depth_l1: mean(&depth_l1),
            stable_points: self.mapper.get_stable_num(),
            unstable_points: self.mapper.get_unstable_num(),
            keyframes: self.mapper.keyframes().len(),
            low_confidence_frames: self.tracker.warnings().len(),
            mapping_warnings: self.mapper.warnings().len(),
            global,
            global_error,
            storage_errors: self.storage_errors.clone(),
            cancelled,
        };
        for line in summary.to_string().lines() {
            info!("{}", line);
        }
        Ok(summary)
    }

    fn write_trajectories(&self) -> std::result::Result<(), StorageError> {
        let mut tum = TumTrajectoryWriter::create(self.settings.save_path.join("traj_tum.txt"))?;
        let mut npz = NpzTrajectoryWriter::new(self.settings.save_path.join("traj.npz"));
        for entry in self.mapper.trajectory().iter() {
            tum.write(entry.timestamp, entry.pose)?;
        }
        npz.write_all(self.mapper.trajectory().iter().map(|e| (e.timestamp, e.pose)))
    }

    /// Processes every frame, stopping early if cancelled, then finishes the run.
    pub fn run(&mut self, frames: impl IntoIterator<Item = Frame>) -> Result<RunSummary> {
        for frame in frames {
            match self.process_frame(frame) {
                Ok(_) => {}
                Err(SlamError::Cancelled { frame_id }) => {
                    warn!("cancelled before frame {}", frame_id);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.finish()
    }

    pub fn settings(&self) -> &SlamSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &Tracker<R> {
        &self.tracker
    }

    pub fn mapper(&self) -> &Mapper<R> {
        &self.mapper
    }

    /// Frames processed so far, posed as last known.
    pub fn history(&self) -> &[Frame] {
        &self.history
    }

    pub fn storage_errors(&self) -> &[String] {
        &self.storage_errors
    }
}
