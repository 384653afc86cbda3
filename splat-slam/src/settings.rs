use crate::StorageError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The settings for a whole SLAM run.
///
/// Every field has a default, so a partial JSON file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlamSettings {
    /// Compute devices requested for the run. The built-in renderer runs on the CPU and only logs these.
    #[serde(default = "default_device_list")]
    pub device_list: Vec<usize>,
    /// The directory all run artifacts are written under.
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,
    /// Evaluate and checkpoint on the first frame and every time this many frames have been integrated.
    #[serde(default = "default_save_step")]
    pub save_step: u64,
    /// Observed depth below this is treated as invalid.
    #[serde(default = "default_min_depth")]
    pub min_depth: f64,
    /// Observed depth above this is treated as invalid.
    #[serde(default = "default_max_depth")]
    pub max_depth: f64,
    /// Only log warnings and errors.
    #[serde(default)]
    pub quiet: bool,
    /// Log an estimate of retained memory after every frame.
    #[serde(default)]
    pub record_mem: bool,
    /// Export a densified copy of the stable points at the end of the run.
    #[serde(default)]
    pub pcd_densify: bool,
    #[serde(default)]
    pub densify: DensifySettings,
    #[serde(default)]
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub mapping: MappingSettings,
    #[serde(default)]
    pub optimization: OptimizationParams,
}

impl Default for SlamSettings {
    fn default() -> Self {
        Self {
            device_list: default_device_list(),
            save_path: default_save_path(),
            save_step: default_save_step(),
            min_depth: default_min_depth(),
            max_depth: default_max_depth(),
            quiet: false,
            record_mem: false,
            pcd_densify: false,
            densify: Default::default(),
            tracking: Default::default(),
            mapping: Default::default(),
            optimization: Default::default(),
        }
    }
}

impl SlamSettings {
    /// Reads settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(StorageError::io(path))?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|source| {
            StorageError::Json {
                path: path.to_owned(),
                source,
            }
        })
    }

    /// Writes the settings as pretty JSON to `<save_path>/config.json`.
    pub fn write_snapshot(&self) -> Result<PathBuf, StorageError> {
        let path = self.save_path.join("config.json");
        std::fs::create_dir_all(&self.save_path).map_err(StorageError::io(&self.save_path))?;
        let json = serde_json::to_string_pretty(self).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(StorageError::io(&path))?;
        Ok(path)
    }

    /// The evaluation and checkpoint cadence, never zero.
    pub fn save_step(&self) -> u64 {
        self.save_step.max(1)
    }
}

/// Settings of the per-frame pose tracker.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// The pixel spacing of the alignment samples drawn from each frame.
    #[serde(default = "default_tracking_stride")]
    pub stride: usize,
    /// The maximum number of render and align rounds per frame.
    #[serde(default = "default_tracking_rounds")]
    pub rounds: usize,
    /// The maximum Nelder-Mead iterations per round.
    #[serde(default = "default_tracking_patience")]
    pub patience: usize,
    /// A round that starts at or below this mean cost stops tracking as converged.
    #[serde(default = "default_convergence_cost")]
    pub convergence_cost: f64,
    /// A round that improves the cost by less than this stops the rounds.
    #[serde(default = "default_convergence_delta")]
    pub convergence_delta: f64,
    /// The final mean cost at or below which tracking counts as converged.
    #[serde(default = "default_accept_cost")]
    pub accept_cost: f64,
    /// The simplex step in meters for translation.
    #[serde(default = "default_translation_step")]
    pub translation_step: f64,
    /// The simplex step in radians for rotation.
    #[serde(default = "default_rotation_step")]
    pub rotation_step: f64,
    /// The cost standard deviation across the simplex that terminates a round.
    #[serde(default = "default_std_dev_threshold")]
    pub std_dev_threshold: f64,
    /// How much of the last frame-to-frame motion is carried into the next initial guess.
    #[serde(default = "default_velocity_damping")]
    pub velocity_damping: f64,
    /// The number of recent frames whose residuals are kept for spike detection.
    #[serde(default = "default_status_window")]
    pub window: usize,
    /// A depth residual this many times the window mean is a spike.
    #[serde(default = "default_spike_ratio")]
    pub spike_ratio: f64,
    /// The weight of squared color error relative to squared metric error.
    #[serde(default = "default_color_weight")]
    pub color_weight: f64,
    /// The maximum cost of a single sample.
    #[serde(default = "default_loss_cutoff")]
    pub loss_cutoff: f64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            stride: default_tracking_stride(),
            rounds: default_tracking_rounds(),
            patience: default_tracking_patience(),
            convergence_cost: default_convergence_cost(),
            convergence_delta: default_convergence_delta(),
            accept_cost: default_accept_cost(),
            translation_step: default_translation_step(),
            rotation_step: default_rotation_step(),
            std_dev_threshold: default_std_dev_threshold(),
            velocity_damping: default_velocity_damping(),
            window: default_status_window(),
            spike_ratio: default_spike_ratio(),
            color_weight: default_color_weight(),
            loss_cutoff: default_loss_cutoff(),
        }
    }
}

/// Stability promotion, keyframe selection and windowing policy of the mapper.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSettings {
    /// The number of recent frames the local optimization revisits.
    #[serde(default = "default_mapping_window")]
    pub window: usize,
    /// The minimum number of frames that must have observed a point before it can become stable.
    #[serde(default = "default_stable_min_observations")]
    pub stable_min_observations: usize,
    /// The maximum running depth residual in meters of a point that becomes stable.
    #[serde(default = "default_stable_max_residual")]
    pub stable_max_residual: f64,
    /// The minimum cosine distance between two viewing directions of a point for it to become stable.
    #[serde(default = "default_stable_min_incidence_cosine_distance")]
    pub stable_min_incidence_cosine_distance: f64,
    /// The number of viewing directions remembered per point.
    #[serde(default = "default_max_viewing_directions")]
    pub max_viewing_directions: usize,
    /// Camera travel in meters since the last keyframe that makes a new keyframe.
    #[serde(default = "default_keyframe_translation")]
    pub keyframe_translation: f64,
    /// Camera rotation in radians since the last keyframe that makes a new keyframe.
    #[serde(default = "default_keyframe_rotation")]
    pub keyframe_rotation: f64,
    /// The fraction of valid observed pixels without rendered coverage that makes a new keyframe.
    #[serde(default = "default_keyframe_coverage_gap")]
    pub keyframe_coverage_gap: f64,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            window: default_mapping_window(),
            stable_min_observations: default_stable_min_observations(),
            stable_max_residual: default_stable_max_residual(),
            stable_min_incidence_cosine_distance: default_stable_min_incidence_cosine_distance(),
            max_viewing_directions: default_max_viewing_directions(),
            keyframe_translation: default_keyframe_translation(),
            keyframe_rotation: default_keyframe_rotation(),
            keyframe_coverage_gap: default_keyframe_coverage_gap(),
        }
    }
}

/// Iteration counts, learning rates, loss weights and densities of the mapper's
/// local and global optimization.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationParams {
    /// The pixel spacing of the grid new points are allocated on.
    #[serde(default = "default_point_stride")]
    pub point_stride: usize,
    /// An observed pixel whose rendered depth differs by more than this in meters is novel geometry.
    #[serde(default = "default_novel_depth_threshold")]
    pub novel_depth_threshold: f64,
    /// The splat radius as a fraction of the allocation grid spacing.
    #[serde(default = "default_point_scale_factor")]
    pub point_scale_factor: f64,
    /// Passes over the rolling window per integrated frame.
    #[serde(default = "default_mapping_iterations")]
    pub mapping_iterations: usize,
    /// The fraction of the remaining error each pass removes from a point.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// The depth distance in meters within which an observation is associated with a point.
    #[serde(default = "default_association_threshold")]
    pub association_threshold: f64,
    /// A point this far in front of the observed surface is a floater.
    #[serde(default = "default_floater_margin")]
    pub floater_margin: f64,
    #[serde(default = "default_initial_opacity")]
    pub initial_opacity: f64,
    /// The factor applied to the opacity of a floater on every observation.
    #[serde(default = "default_opacity_decay")]
    pub opacity_decay: f64,
    /// Unstable points with less opacity than this are removed.
    #[serde(default = "default_min_opacity")]
    pub min_opacity: f64,
    /// The mean depth residual in meters above which local optimization reports a convergence warning.
    #[serde(default = "default_mapping_convergence_residual")]
    pub mapping_convergence_residual: f64,
    /// The maximum Nelder-Mead iterations of an intermediate global optimization.
    #[serde(default = "default_global_patience")]
    pub global_patience: usize,
    /// The maximum Nelder-Mead iterations of the terminal global optimization.
    #[serde(default = "default_final_global_patience")]
    pub final_global_patience: usize,
    #[serde(default = "default_global_translation_step")]
    pub global_translation_step: f64,
    #[serde(default = "default_global_rotation_step")]
    pub global_rotation_step: f64,
    #[serde(default = "default_global_std_dev_threshold")]
    pub global_std_dev_threshold: f64,
    /// The weight of consecutive keyframe agreement relative to map agreement.
    #[serde(default = "default_global_pair_weight")]
    pub global_pair_weight: f64,
    /// Observations per keyframe scored by global optimization, spread evenly over the image.
    #[serde(default = "default_global_max_samples")]
    pub global_max_samples: usize,
    /// Free keyframes per Nelder-Mead solve. Longer chains are solved in consecutive pieces.
    #[serde(default = "default_global_max_keyframes")]
    pub global_max_keyframes: usize,
    /// Passes of point refinement over all keyframes after the poses are optimized.
    #[serde(default = "default_global_point_iterations")]
    pub global_point_iterations: usize,
    /// A final cost above this multiple of the initial cost is divergence.
    #[serde(default = "default_global_divergence_ratio")]
    pub global_divergence_ratio: f64,
}

impl Default for OptimizationParams {
    fn default() -> Self {
        Self {
            point_stride: default_point_stride(),
            novel_depth_threshold: default_novel_depth_threshold(),
            point_scale_factor: default_point_scale_factor(),
            mapping_iterations: default_mapping_iterations(),
            learning_rate: default_learning_rate(),
            association_threshold: default_association_threshold(),
            floater_margin: default_floater_margin(),
            initial_opacity: default_initial_opacity(),
            opacity_decay: default_opacity_decay(),
            min_opacity: default_min_opacity(),
            mapping_convergence_residual: default_mapping_convergence_residual(),
            global_patience: default_global_patience(),
            final_global_patience: default_final_global_patience(),
            global_translation_step: default_global_translation_step(),
            global_rotation_step: default_global_rotation_step(),
            global_std_dev_threshold: default_global_std_dev_threshold(),
            global_pair_weight: default_global_pair_weight(),
            global_max_samples: default_global_max_samples(),
            global_max_keyframes: default_global_max_keyframes(),
            global_point_iterations: default_global_point_iterations(),
            global_divergence_ratio: default_global_divergence_ratio(),
        }
    }
}

/// Parameters of the end of run point cloud densification.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensifySettings {
    /// How many times the densification is repeated over its own output.
    #[serde(default = "default_densify_iterations")]
    pub iterations: usize,
    /// The nearest neighbors considered around each point.
    #[serde(default = "default_densify_neighbors")]
    pub neighbors: usize,
    /// The maximum number of new points created around each point per iteration.
    #[serde(default = "default_densify_samples_per_point")]
    pub samples_per_point: usize,
}

impl Default for DensifySettings {
    fn default() -> Self {
        Self {
            iterations: default_densify_iterations(),
            neighbors: default_densify_neighbors(),
            samples_per_point: default_densify_samples_per_point(),
        }
    }
}

fn default_device_list() -> Vec<usize> {
    vec![0]
}

fn default_save_path() -> PathBuf {
    PathBuf::from("output")
}

fn default_save_step() -> u64 {
    10
}

fn default_min_depth() -> f64 {
    0.1
}

fn default_max_depth() -> f64 {
    10.0
}

fn default_tracking_stride() -> usize {
    4
}

fn default_tracking_rounds() -> usize {
    3
}

fn default_tracking_patience() -> usize {
    120
}

fn default_convergence_cost() -> f64 {
    1e-6
}

fn default_convergence_delta() -> f64 {
    1e-6
}

fn default_accept_cost() -> f64 {
    2e-3
}

fn default_translation_step() -> f64 {
    0.01
}

fn default_rotation_step() -> f64 {
    0.005
}

fn default_std_dev_threshold() -> f64 {
    1e-10
}

fn default_velocity_damping() -> f64 {
    0.9
}

fn default_status_window() -> usize {
    5
}

fn default_spike_ratio() -> f64 {
    3.0
}

fn default_color_weight() -> f64 {
    0.1
}

fn default_loss_cutoff() -> f64 {
    0.01
}

fn default_mapping_window() -> usize {
    4
}

fn default_stable_min_observations() -> usize {
    3
}

fn default_stable_max_residual() -> f64 {
    0.02
}

fn default_stable_min_incidence_cosine_distance() -> f64 {
    0.0001
}

fn default_max_viewing_directions() -> usize {
    16
}

fn default_keyframe_translation() -> f64 {
    0.1
}

fn default_keyframe_rotation() -> f64 {
    0.2
}

fn default_keyframe_coverage_gap() -> f64 {
    0.2
}

fn default_point_stride() -> usize {
    2
}

fn default_novel_depth_threshold() -> f64 {
    0.05
}

fn default_point_scale_factor() -> f64 {
    0.75
}

fn default_mapping_iterations() -> usize {
    3
}

fn default_learning_rate() -> f64 {
    0.5
}

fn default_association_threshold() -> f64 {
    0.1
}

fn default_floater_margin() -> f64 {
    0.1
}

fn default_initial_opacity() -> f64 {
    0.5
}

fn default_opacity_decay() -> f64 {
    0.6
}

fn default_min_opacity() -> f64 {
    0.1
}

fn default_mapping_convergence_residual() -> f64 {
    0.02
}

fn default_global_patience() -> usize {
    100
}

fn default_final_global_patience() -> usize {
    300
}

fn default_global_translation_step() -> f64 {
    0.01
}

fn default_global_rotation_step() -> f64 {
    0.005
}

fn default_global_std_dev_threshold() -> f64 {
    1e-12
}

fn default_global_pair_weight() -> f64 {
    1.0
}

fn default_global_max_samples() -> usize {
    600
}

fn default_global_max_keyframes() -> usize {
    8
}

fn default_global_point_iterations() -> usize {
    2
}

fn default_global_divergence_ratio() -> f64 {
    1.5
}

fn default_densify_iterations() -> usize {
    1
}

fn default_densify_neighbors() -> usize {
    30
}

fn default_densify_samples_per_point() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: SlamSettings =
            serde_json::from_str(r#"{"save_step": 5, "mapping": {"keyframe_translation": 0.5}}"#)
                .unwrap();
        assert_eq!(settings.save_step, 5);
        assert_eq!(settings.mapping.keyframe_translation, 0.5);
        assert_eq!(settings.mapping.window, default_mapping_window());
        assert_eq!(settings.tracking, TrackingSettings::default());
        assert_eq!(settings.save_path, PathBuf::from("output"));
    }

    #[test]
    fn snapshot_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SlamSettings {
            save_path: dir.path().join("run"),
            quiet: true,
            ..Default::default()
        };
        let path = settings.write_snapshot().unwrap();
        let read = SlamSettings::from_json_file(path).unwrap();
        assert_eq!(read.save_path, settings.save_path);
        assert!(read.quiet);
        assert_eq!(read.tracking.stride, settings.tracking.stride);
        assert_eq!(read.device_list, vec![0]);
    }

    #[test]
    fn zero_save_step_is_clamped() {
        let settings = SlamSettings {
            save_step: 0,
            ..Default::default()
        };
        assert_eq!(settings.save_step(), 1);
    }
}
