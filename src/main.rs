//! `ar-calib`: offline tools around calibration records.
//!
//! Usage:
//! ```bash
//! ar-calib check --settings samples/settings.yaml
//! ar-calib recalibrate --input out_camera_data.yml --output recalibrated.yml --per-view-csv views.csv
//! ar-calib frustum --params samples/camera_params.yaml
//! ar-calib pose --rvec 0.1 0.2 0.0 --tvec 0 0 5
//! ```

use ar_calib_tools::calibration::{
    CalibrationOptions, CalibrationRun, CalibrationSolver, ObservationSet, PlanarCalibrator,
};
use ar_calib_tools::camera::Resolution;
use ar_calib_tools::geometry::{Pattern, PatternGeometry};
use ar_calib_tools::input::NoCaptureBackend;
use ar_calib_tools::render::{build_frustum, FrustumConvention, FrustumOptions, PoseTransform};
use ar_calib_tools::settings::Settings;
use ar_calib_tools::store::{self, RecordLayout};
use ar_calib_tools::util;
use clap::{Parser, Subcommand};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info, warn};
use nalgebra::{Matrix4, Vector3};
use std::path::{Path, PathBuf};

/// Planar-pattern calibration tools for AR rendering
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a settings document and describe the configured input
    Check {
        #[arg(short, long)]
        settings: PathBuf,
    },
    /// Solve the calibration again from the image points stored in a record
    Recalibrate {
        /// Record written with `Write_DetectedFeaturePoints` enabled
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Pattern the stored points were detected on
        #[arg(short, long, default_value = "CHESSBOARD")]
        pattern: String,
        #[arg(long, default_value_t = 100)]
        max_iterations: usize,
        /// Write the per-view reprojection errors and poses as CSV
        #[arg(long)]
        per_view_csv: Option<PathBuf>,
    },
    /// Print the projection matrix matching a calibrated camera
    Frustum {
        #[arg(short, long)]
        params: PathBuf,
        /// Viewport width; defaults to the calibrated image width
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long, default_value_t = 0.1)]
        near: f64,
        #[arg(long, default_value_t = 1000.0)]
        far: f64,
        /// Reproduce the legacy bounds (bottom taken from the horizontal extent)
        #[arg(long)]
        legacy: bool,
    },
    /// Print the model-view transform and Euler angles of a board pose
    Pose {
        #[arg(long, num_args = 3, allow_negative_numbers = true)]
        rvec: Vec<f64>,
        #[arg(long, num_args = 3, allow_negative_numbers = true)]
        tvec: Vec<f64>,
    },
}

fn print_matrix(name: &str, m: &Matrix4<f64>) {
    println!("{}:", name);
    for r in 0..4 {
        println!(
            "  [{:>12.6} {:>12.6} {:>12.6} {:>12.6}]",
            m[(r, 0)],
            m[(r, 1)],
            m[(r, 2)],
            m[(r, 3)]
        );
    }
}

fn vector3(values: &[f64]) -> Result<Vector3<f64>, Box<dyn std::error::Error>> {
    match values {
        [x, y, z] => Ok(Vector3::new(*x, *y, *z)),
        _ => Err(format!("expected 3 values, got {}", values.len()).into()),
    }
}

fn check(settings_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (settings, source) = Settings::load(settings_path, &NoCaptureBackend)?;
    info!("Settings are valid: {}", settings);
    info!("Input: {:?}", source);
    info!(
        "Calibration flags: {}",
        settings.calibration_options().flags.annotation()
    );
    Ok(())
}

fn recalibrate(
    input: &Path,
    output: &Path,
    pattern: &str,
    max_iterations: usize,
    per_view_csv: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pattern =
        Pattern::from_name(pattern).ok_or_else(|| format!("Unknown pattern: {}", pattern))?;
    let stored = store::load_image_points(input)?;
    info!(
        "Loaded {} views of a {}x{} board from {:?}",
        stored.views.len(),
        stored.board_size.width,
        stored.board_size.height,
        input
    );

    let geometry = PatternGeometry::new(pattern, stored.board_size, stored.square_size);
    let mut observations = ObservationSet::new(geometry.point_count());
    for view in stored.views {
        observations.push(view)?;
    }

    let calibrator = PlanarCalibrator::new(CalibrationOptions {
        flags: stored.flags,
        aspect_ratio: stored.aspect_ratio,
        max_iterations,
        verbose: true,
    });
    let result = calibrator.calibrate(&observations, &geometry, stored.image_size)?;

    match util::error_statistics(&result.per_view_errors) {
        Ok(stats) => info!("Per-view reprojection error: {:?}", stats),
        Err(e) => warn!("No per-view statistics: {}", e),
    }
    info!("Camera matrix: {}", result.camera_matrix);
    info!("Distortion: {:?}", result.distortion);

    if let Some(csv_path) = per_view_csv {
        util::ensure_parent_dir(csv_path)?;
        let mut writer = csv::Writer::from_path(csv_path)?;
        writer.write_record(["view", "error", "rx", "ry", "rz", "tx", "ty", "tz"])?;
        for (i, ((error, r), t)) in result
            .per_view_errors
            .iter()
            .zip(&result.rvecs)
            .zip(&result.tvecs)
            .enumerate()
        {
            writer.write_record(&[
                i.to_string(),
                error.to_string(),
                r.x.to_string(),
                r.y.to_string(),
                r.z.to_string(),
                t.x.to_string(),
                t.y.to_string(),
                t.z.to_string(),
            ])?;
        }
        writer.flush()?;
        info!("Per-view report written to {:?}", csv_path);
    }

    let layout = RecordLayout {
        board_size: stored.board_size,
        square_size: stored.square_size,
        write_points: true,
        write_extrinsics: true,
    };
    let run = CalibrationRun {
        observations,
        image_size: stored.image_size,
        result,
    };
    if !store::save_if_valid(output, &layout, &run)? {
        return Err("Calibration produced out-of-range parameters".into());
    }
    Ok(())
}

fn frustum(
    params: &Path,
    width: Option<u32>,
    height: Option<u32>,
    options: FrustumOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let camera = store::load_camera_parameters(params)?;
    let viewport = match (width, height, camera.image_size) {
        (Some(width), Some(height), _) => Resolution { width, height },
        (w, h, Some(size)) => Resolution {
            width: w.unwrap_or(size.width),
            height: h.unwrap_or(size.height),
        },
        _ => return Err("No viewport size given and none stored in the record".into()),
    };
    info!(
        "Viewport {}x{}, convention {:?}",
        viewport.width, viewport.height, options.convention
    );

    let frustum = build_frustum(&camera.camera_matrix, viewport, &options)?;
    print_matrix("Projection", &frustum.matrix);
    println!("Column-major: {:?}", frustum.to_column_major());
    Ok(())
}

fn pose(rvec: &[f64], tvec: &[f64]) -> Result<(), Box<dyn std::error::Error>> {
    let pose = PoseTransform::from_rotation_vector(&vector3(rvec)?, &vector3(tvec)?);
    print_matrix("Model-view", &pose.matrix);
    println!(
        "Euler angles (deg): x {:.4}, y {:.4}, z {:.4}",
        pose.euler_degrees.x, pose.euler_degrees.y, pose.euler_degrees.z
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Command::Check { settings } => check(settings),
        Command::Recalibrate {
            input,
            output,
            pattern,
            max_iterations,
            per_view_csv,
        } => recalibrate(input, output, pattern, *max_iterations, per_view_csv.as_deref()),
        Command::Frustum {
            params,
            width,
            height,
            near,
            far,
            legacy,
        } => {
            let options = FrustumOptions {
                near: *near,
                far: *far,
                convention: if *legacy {
                    FrustumConvention::Legacy
                } else {
                    FrustumConvention::Symmetric
                },
            };
            frustum(params, *width, *height, options)
        }
        Command::Pose { rvec, tvec } => pose(rvec, tvec),
    };

    if let Err(e) = &outcome {
        error!("{}", e);
    }
    outcome
}
