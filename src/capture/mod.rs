//! The capture loop: pulls frames from an [`InputSource`], detects the
//! pattern, accumulates observations and hands them to a
//! [`CalibrationSolver`] once enough views were collected.
//!
//! Pattern detection and sub-pixel refinement are external; they are reached
//! through [`PatternDetector`] and [`CornerRefiner`].

use crate::calibration::{CalibrationError, CalibrationRun, CalibrationSolver, ObservationSet};
use crate::camera::Resolution;
use crate::geometry::{BoardSize, Pattern, PatternGeometry};
use crate::input::InputSource;
use crate::settings::Settings;
use image::RgbImage;
use log::{debug, info, warn};
use nalgebra::Vector2;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Fewest views a finite source must deliver before calibration is attempted.
pub const MIN_OBSERVATIONS: usize = 1;

/// Finds the pattern's feature points in a frame, in row-major board order.
pub trait PatternDetector {
    fn detect(
        &mut self,
        frame: &RgbImage,
        pattern: Pattern,
        board_size: BoardSize,
    ) -> Option<Vec<Vector2<f64>>>;
}

/// Sub-pixel refinement of detected corners, applied in place.
pub trait CornerRefiner {
    fn refine(&mut self, frame: &RgbImage, points: &mut [Vector2<f64>]);
}

/// Monotonic time source used for the acceptance delay.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock, measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }

    pub fn set(&self, at: Duration) {
        self.0.set(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Detecting,
    Capturing,
    Calibrated,
}

/// What happened to one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// The frame as it should be displayed (flipped, inverted on acceptance).
    pub frame: RgbImage,
    pub found: bool,
    pub accepted: bool,
    pub points: Option<Vec<Vector2<f64>>>,
    pub observation_count: usize,
}

#[derive(Debug, Clone)]
pub enum FrameOutcome {
    Frame(FrameReport),
    /// A finite source has no frames left.
    Exhausted,
}

/// Reply of the per-frame callback of [`CaptureSession::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    Continue,
    /// Drop the collected views and start over (streams only).
    Reset,
    Abort,
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Completed(CalibrationRun),
    Aborted,
}

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("Camera stopped delivering frames")]
    AcquisitionFailure,
    #[error("Input exhausted after {found} views, at least {required} needed")]
    NotEnoughObservations { found: usize, required: usize },
    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
}

/// One calibration session over an opened input.
pub struct CaptureSession<'s, D, C = SystemClock> {
    settings: &'s Settings,
    geometry: PatternGeometry,
    source: InputSource,
    detector: D,
    refiner: Option<Box<dyn CornerRefiner + 's>>,
    clock: C,
    state: CaptureState,
    observations: ObservationSet,
    image_size: Option<Resolution>,
    last_accepted: Option<Duration>,
}

impl<'s, D: PatternDetector> CaptureSession<'s, D, SystemClock> {
    pub fn new(settings: &'s Settings, source: InputSource, detector: D) -> Self {
        Self::with_clock(settings, source, detector, SystemClock::new())
    }
}

impl<'s, D: PatternDetector, C: Clock> CaptureSession<'s, D, C> {
    pub fn with_clock(settings: &'s Settings, source: InputSource, detector: D, clock: C) -> Self {
        let geometry = settings.geometry();
        let observations = ObservationSet::new(geometry.point_count());
        CaptureSession {
            settings,
            geometry,
            source,
            detector,
            refiner: None,
            clock,
            state: CaptureState::Detecting,
            observations,
            image_size: None,
            last_accepted: None,
        }
    }

    /// Sub-pixel refinement applied to detections on streams.
    pub fn with_refiner(mut self, refiner: impl CornerRefiner + 's) -> Self {
        self.refiner = Some(Box::new(refiner));
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn observations(&self) -> &ObservationSet {
        &self.observations
    }

    pub fn image_size(&self) -> Option<Resolution> {
        self.image_size
    }

    fn debounce_elapsed(&self) -> bool {
        match self.last_accepted {
            None => true,
            Some(last) => self.clock.now().saturating_sub(last) > self.settings.delay,
        }
    }

    /// Processes a single frame.
    pub fn step(&mut self) -> Result<FrameOutcome, CaptureError> {
        let Some(mut frame) = self.source.next_image() else {
            if self.source.is_live() {
                return Err(CaptureError::AcquisitionFailure);
            }
            debug!("Input exhausted with {} views", self.observations.len());
            return Ok(FrameOutcome::Exhausted);
        };

        if self.settings.flip_vertical {
            image::imageops::flip_vertical_in_place(&mut frame);
        }
        let (width, height) = frame.dimensions();
        self.image_size = Some(Resolution { width, height });

        let expected = self.geometry.point_count();
        let mut points = self
            .detector
            .detect(&frame, self.settings.pattern, self.settings.board_size)
            .filter(|points| {
                if points.len() != expected {
                    debug!("Detector returned {} points, expected {}", points.len(), expected);
                }
                points.len() == expected
            });
        let found = points.is_some();
        let stream = self.source.is_stream();

        if let (Some(points), true, Some(refiner)) = (points.as_mut(), stream, self.refiner.as_mut())
        {
            refiner.refine(&frame, points);
        }
        if found && self.state == CaptureState::Detecting {
            self.state = CaptureState::Capturing;
        }

        let accepted = found
            && self.state == CaptureState::Capturing
            && (!stream || self.debounce_elapsed());
        if accepted {
            if let Some(points) = &points {
                self.observations.push(points.clone())?;
            }
            if stream {
                self.last_accepted = Some(self.clock.now());
                image::imageops::invert(&mut frame);
            }
            debug!(
                "Accepted view {}/{}",
                self.observations.len(),
                self.settings.frame_count
            );
            if self.observations.len() >= self.settings.frame_count {
                self.state = CaptureState::Calibrated;
            }
        }

        Ok(FrameOutcome::Frame(FrameReport {
            frame,
            found,
            accepted,
            points,
            observation_count: self.observations.len(),
        }))
    }

    /// Drops the collected views; only honoured for streams.
    pub fn reset(&mut self) {
        if self.source.is_stream() {
            info!("Resetting capture, {} views dropped", self.observations.len());
            self.restart();
        } else {
            warn!("Reset ignored: static image lists cannot be restarted");
        }
    }

    /// Clears the observations so a new run can start, e.g. after a failed calibration.
    pub fn restart(&mut self) {
        self.observations.clear();
        self.state = CaptureState::Detecting;
        self.last_accepted = None;
    }

    /// Steps until the target view count is reached or the input runs out,
    /// then calibrates.
    ///
    /// `on_frame` sees every processed frame and steers the loop.
    pub fn run<S, F>(&mut self, solver: &S, mut on_frame: F) -> Result<CaptureOutcome, CaptureError>
    where
        S: CalibrationSolver + ?Sized,
        F: FnMut(&FrameReport) -> LoopSignal,
    {
        while self.state != CaptureState::Calibrated {
            match self.step()? {
                FrameOutcome::Exhausted => {
                    if self.observations.len() < MIN_OBSERVATIONS {
                        return Err(CaptureError::NotEnoughObservations {
                            found: self.observations.len(),
                            required: MIN_OBSERVATIONS,
                        });
                    }
                    break;
                }
                FrameOutcome::Frame(report) => match on_frame(&report) {
                    LoopSignal::Continue => {}
                    LoopSignal::Reset => self.reset(),
                    LoopSignal::Abort => {
                        info!("Capture aborted");
                        return Ok(CaptureOutcome::Aborted);
                    }
                },
            }
        }

        let image_size = self.image_size.ok_or(CaptureError::NotEnoughObservations {
            found: 0,
            required: MIN_OBSERVATIONS,
        })?;
        info!(
            "Calibrating from {} views of {}x{} images",
            self.observations.len(),
            image_size.width,
            image_size.height
        );
        let result = solver.calibrate(&self.observations, &self.geometry, image_size)?;
        self.state = CaptureState::Calibrated;

        Ok(CaptureOutcome::Completed(CalibrationRun {
            observations: self.observations.clone(),
            image_size,
            result,
        }))
    }
}
