//! Camera sensor fingerprinting (PRNU) for image authentication and tamper localization.
//!
//! Every camera sensor has tiny per-pixel gain differences, its Photo Response
//! Non-Uniformity. The pattern survives in the noise residual of each photo
//! the sensor takes, so a fingerprint estimated from a few dozen enrollment
//! images can be correlated against the residual of a query image.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use prnu_forensics::{Config, MemoryStore, PrnuEngine};
//!
//! let config = Config { min_enrollment_images: 20, ..Config::default() };
//! let engine = PrnuEngine::new(config, Arc::new(MemoryStore::new())).unwrap();
//!
//! let shots: Vec<_> = (0..20)
//!     .map(|i| image::open(format!("enroll/{i}.jpg")).unwrap())
//!     .collect();
//! let fingerprint = engine.enroll("camera-1", shots).wait().unwrap();
//! println!("average enrollment PCE: {:.1}", fingerprint.average_pce());
//!
//! let query = image::open("query.jpg").unwrap();
//! let verdict = engine.authenticate(query, "camera-1").wait().unwrap();
//! println!("authentic: {}, confidence {:.0}%", verdict.is_authentic, verdict.confidence);
//! ```
//!
//! # Tamper Localization
//!
//! The residual is scored tile by tile; tiles whose local PCE is a low
//! outlier (more than two standard deviations under the mean) are reported
//! as tampered regions.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use prnu_forensics::{Config, MemoryStore, PrnuEngine};
//! # let engine = PrnuEngine::new(Config::default(), Arc::new(MemoryStore::new())).unwrap();
//! let image = image::open("suspect.jpg").unwrap();
//! let scan = engine.detect_tampering(image, "camera-1").wait().unwrap();
//! for region in &scan.tampered_regions {
//!     println!("tampered: {}x{} at ({}, {})", region.width, region.height, region.x, region.y);
//! }
//! ```
//!
//! # Persistence
//!
//! [`FileStore`] keeps one AES-256-GCM sealed record per camera and refuses
//! access until unlocked with a [`StoreKey`]. [`MemoryStore`] is the
//! in-process alternative. Both implement [`FingerprintStore`].

#![deny(missing_docs)]

pub mod config;
pub mod correlation;
pub mod decision;
pub mod denoise;
mod engine;
pub mod error;
pub mod file_store;
pub mod fingerprint;
pub mod preprocess;
pub mod store;
pub mod tamper;

pub use config::{Config, DenoiserMode};
pub use decision::{AuthenticationResult, MatchQuality};
pub use engine::{Pending, PrnuEngine};
pub use error::{Error, Result};
pub use file_store::{FileStore, StoreKey};
pub use fingerprint::CameraFingerprint;
pub use preprocess::{is_supported_image, load_image, Preprocessor};
pub use store::{FingerprintStore, MemoryStore};
pub use tamper::{Region, TamperDetectionResult, TamperSeverity};
