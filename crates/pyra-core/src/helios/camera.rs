// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Camera abstraction for the Helios classifier.
//!
//! The station cameras differ per site, so the capture backend is
//! injected as a factory. The classifier only needs grayscale frames and
//! an integer exposure knob.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::GrayImage;
use tracing::{debug, info, warn};

use crate::error::{PyraError, Result};

/// Integer exposures every station camera accepts.
pub const EXPOSURE_RANGE: std::ops::RangeInclusive<i32> = -20..=20;

/// Settling time after an exposure change.
pub const EXPOSURE_SETTLE: Duration = Duration::from_millis(200);

/// Target mean pixel value of a well-exposed frame.
const TARGET_MEAN: f64 = 50.0;

const INIT_ATTEMPTS: usize = 5;
const INIT_RETRY_PAUSE: Duration = Duration::from_secs(2);

pub trait Camera: Send {
    fn set_exposure(&mut self, exposure: i32) -> Result<()>;
    /// Grab one grayscale frame.
    fn grab(&mut self) -> Result<GrayImage>;
}

/// Opens the camera with the given device id.
pub type CameraFactory = Arc<dyn Fn(u32) -> Result<Box<dyn Camera>> + Send + Sync>;

/// Open the camera, retrying on flaky USB enumeration.
pub fn initialize(factory: &CameraFactory, camera_id: u32) -> Result<Box<dyn Camera>> {
    let mut last_error = None;
    for attempt in 1..=INIT_ATTEMPTS {
        match factory(camera_id) {
            Ok(camera) => {
                info!(camera_id, attempt, "Camera initialized");
                return Ok(camera);
            }
            Err(error) => {
                warn!(camera_id, attempt, error = %error, "Camera init failed");
                last_error = Some(error);
                thread::sleep(INIT_RETRY_PAUSE);
            }
        }
    }
    Err(last_error.unwrap_or(PyraError::Camera {
        details: "camera init failed".to_string(),
    }))
}

pub fn mean_pixel_value(frame: &GrayImage) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: u64 = frame.pixels().map(|p| p.0[0] as u64).sum();
    sum as f64 / frame.len() as f64
}

/// Pick the exposure whose three-frame mean is closest to 50.
pub fn auto_adjust_exposure(camera: &mut dyn Camera) -> Result<i32> {
    let mut best: Option<(i32, f64)> = None;
    for exposure in EXPOSURE_RANGE {
        camera.set_exposure(exposure)?;
        thread::sleep(EXPOSURE_SETTLE);
        let mut means = Vec::with_capacity(3);
        for _ in 0..3 {
            means.push(mean_pixel_value(&camera.grab()?));
        }
        let mean = means.iter().sum::<f64>() / means.len() as f64;
        let distance = (mean - TARGET_MEAN).abs();
        if best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((exposure, distance));
        }
    }
    let (exposure, distance) = best.ok_or(PyraError::Camera {
        details: "no usable exposure".to_string(),
    })?;
    debug!(exposure, distance, "Exposure calibrated");
    camera.set_exposure(exposure)?;
    thread::sleep(EXPOSURE_SETTLE);
    Ok(exposure)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Camera whose frame brightness is a function of the exposure.
    pub(crate) struct SyntheticCamera {
        pub exposure: i32,
        pub fail_grabs: usize,
        /// brightness = base + gain * exposure
        pub base: f64,
        pub gain: f64,
    }

    impl SyntheticCamera {
        pub fn new(base: f64, gain: f64) -> Self {
            Self {
                exposure: 0,
                fail_grabs: 0,
                base,
                gain,
            }
        }
    }

    impl Camera for SyntheticCamera {
        fn set_exposure(&mut self, exposure: i32) -> Result<()> {
            self.exposure = exposure;
            Ok(())
        }

        fn grab(&mut self) -> Result<GrayImage> {
            if self.fail_grabs > 0 {
                self.fail_grabs -= 1;
                return Err(PyraError::Camera {
                    details: "frame dropped".to_string(),
                });
            }
            let value = (self.base + self.gain * self.exposure as f64).clamp(0.0, 255.0) as u8;
            Ok(GrayImage::from_pixel(32, 32, Luma([value])))
        }
    }

    #[test]
    fn test_mean_pixel_value() {
        let frame = GrayImage::from_pixel(4, 4, Luma([100]));
        assert_eq!(mean_pixel_value(&frame), 100.0);
    }

    #[test]
    #[ignore = "sweeps 41 exposures with settle pauses"]
    fn test_auto_exposure_picks_closest_to_target() {
        // brightness 90 + 4*e: 50 is hit exactly at e = -10
        let mut camera = SyntheticCamera::new(90.0, 4.0);
        let exposure = auto_adjust_exposure(&mut camera).unwrap();
        assert_eq!(exposure, -10);
    }

    #[test]
    fn test_initialize_gives_up_after_retries() {
        let factory: CameraFactory = Arc::new(|_| {
            Err(PyraError::Camera {
                details: "no device".to_string(),
            })
        });
        let error = match initialize(&factory, 0) {
            Ok(_) => panic!("initialization must fail without a device"),
            Err(error) => error,
        };
        assert_eq!(error.subject(), "camera-error");
    }
}
