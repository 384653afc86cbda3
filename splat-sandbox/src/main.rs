mod dataset;

use log::*;
use splat_core::{
    nalgebra::{Point2, Vector2},
    CameraIntrinsics,
};
use splat_slam::{PointSplatRenderer, SlamError, SlamSettings, SlamSystem};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(name = "splat-sandbox", about = "A tool for running splat-slam over RGB-D sequences")]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `splat_slam::SlamSettings`. Defaults are used if it doesn't exist.
    #[structopt(short, long, default_value = "splat-settings.json")]
    settings: PathBuf,
    /// The directory run artifacts are written to, overriding the settings.
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// The x focal length
    #[structopt(long, default_value = "517.3")]
    x_focal: f64,
    /// The y focal length
    #[structopt(long, default_value = "516.5")]
    y_focal: f64,
    /// The x optical center coordinate
    #[structopt(long, default_value = "318.6")]
    x_center: f64,
    /// The y optical center coordinate
    #[structopt(long, default_value = "255.3")]
    y_center: f64,
    /// The skew
    #[structopt(long, default_value = "0.0")]
    skew: f64,
    /// Raw depth units per meter
    #[structopt(long, default_value = "5000.0")]
    depth_scale: f64,
    /// Stop after this many frames
    #[structopt(long)]
    max_frames: Option<usize>,
    /// Export a densified point cloud at the end of the run
    #[structopt(long)]
    densify: bool,
    /// Association file listing color and depth images
    ///
    /// Default intrinsics are for the TUM RGB-D freiburg1 sequences.
    #[structopt(parse(from_os_str))]
    associations: PathBuf,
}

fn main() {
    let opt = Opt::from_args();

    let loaded = if opt.settings.exists() {
        Some(SlamSettings::from_json_file(&opt.settings))
    } else {
        None
    };
    let quiet = matches!(&loaded, Some(Ok(settings)) if settings.quiet);
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();

    let mut settings = match loaded {
        Some(Ok(settings)) => {
            info!("loaded settings from {}", opt.settings.display());
            settings
        }
        Some(Err(e)) => {
            error!("unable to load settings: {}", e);
            std::process::exit(1);
        }
        None => {
            info!("used default settings");
            SlamSettings::default()
        }
    };
    if let Some(output) = &opt.output {
        settings.save_path = output.clone();
    }
    settings.pcd_densify |= opt.densify;

    if let Err(e) = run(&opt, settings) {
        error!("run failed: {}", e);
        std::process::exit(1);
    }
}

fn run(opt: &Opt, settings: SlamSettings) -> Result<(), SlamError> {
    let intrinsics = CameraIntrinsics {
        focals: Vector2::new(opt.x_focal, opt.y_focal),
        principal_point: Point2::new(opt.x_center, opt.y_center),
        skew: opt.skew,
    };
    let mut associations = dataset::read_associations(&opt.associations)?;
    if let Some(max_frames) = opt.max_frames {
        associations.truncate(max_frames);
    }
    info!("running over {} frames", associations.len());

    let mut system = SlamSystem::new(settings, PointSplatRenderer::default())?;
    for (id, association) in associations.iter().enumerate() {
        let frame = match dataset::load_frame(id as u64, association, intrinsics, opt.depth_scale) {
            Ok(frame) => frame,
            Err(e) => {
                error!("stopping early, unable to load frame {}: {}", id, e);
                break;
            }
        };
        let report = system.process_frame(frame)?;
        debug!(
            "frame {} tracked with cost {} and {} new points",
            id, report.tracking.cost, report.mapping.allocated
        );
    }

    let summary = system.finish()?;
    println!("{}", summary);
    Ok(())
}
