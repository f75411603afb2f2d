//! Enrollment, authentication and tamper analysis on a bounded worker pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use image::DynamicImage;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::Config;
use crate::correlation;
use crate::decision::AuthenticationResult;
use crate::denoise::Denoiser;
use crate::error::{Error, Result};
use crate::fingerprint::{self, CameraFingerprint};
use crate::preprocess::Preprocessor;
use crate::store::FingerprintStore;
use crate::tamper::{self, TamperDetectionResult};

/// One-shot handle to the outcome of a submitted request.
///
/// Every request resolves to exactly one value. If the worker goes away
/// without answering, the handle yields [`Error::ProcessingFailure`].
#[derive(Debug)]
#[must_use = "a pending request does nothing unless its result is read"]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    fn ready(result: Result<T>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        // Capacity 1 and the receiver is alive, so this cannot fail.
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block until the request finishes.
    ///
    /// # Errors
    ///
    /// Returns the request's own error, or [`Error::ProcessingFailure`] if
    /// the worker exited without a result.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| Err(disconnected()))
    }

    /// Block for at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`Pending::wait`], plus [`Error::ProcessingFailure`] when the
    /// deadline passes first. The request keeps running; a later call may
    /// still collect it.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::ProcessingFailure(format!(
                "no result within {}ms",
                timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(disconnected()),
        }
    }

    /// The result if it is already available.
    ///
    /// The result can be taken once; calls after that report a
    /// [`Error::ProcessingFailure`].
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(disconnected())),
        }
    }
}

fn disconnected() -> Error {
    Error::ProcessingFailure("worker exited without a result".into())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State shared by every worker task.
struct Shared {
    config: Config,
    store: Arc<dyn FingerprintStore>,
    preprocessor: Preprocessor,
    denoiser: Denoiser,
}

/// PRNU enrollment and analysis engine.
///
/// All methods return immediately with a [`Pending`] handle; pixel work
/// runs on the engine's own pool of `worker_threads` threads.
///
/// ```no_run
/// use std::sync::Arc;
/// use prnu_forensics::{Config, MemoryStore, PrnuEngine};
///
/// let engine = PrnuEngine::new(Config::default(), Arc::new(MemoryStore::new())).unwrap();
/// let query = image::open("query.jpg").unwrap();
/// let verdict = engine.authenticate(query, "camera-1").wait().unwrap();
/// println!("authentic: {} (PCE {:.1})", verdict.is_authentic, verdict.pce_score);
/// ```
pub struct PrnuEngine {
    shared: Arc<Shared>,
    pool: ThreadPool,
}

impl std::fmt::Debug for PrnuEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrnuEngine")
            .field("config", &self.shared.config)
            .field("threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl PrnuEngine {
    /// Validate `config` and start the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unusable config and
    /// [`Error::ProcessingFailure`] if the pool cannot be started.
    pub fn new(config: Config, store: Arc<dyn FingerprintStore>) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("prnu-worker-{i}"))
            .build()
            .map_err(|e| Error::ProcessingFailure(format!("worker pool: {e}")))?;

        debug!(
            "engine started: {}x{}, {:?} denoiser, {} workers",
            config.width, config.height, config.denoiser, config.worker_threads
        );

        Ok(Self {
            shared: Arc::new(Shared {
                preprocessor: Preprocessor::new(&config),
                denoiser: Denoiser::new(&config),
                config,
                store,
            }),
            pool,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Backing fingerprint store.
    #[must_use]
    pub fn store(&self) -> &dyn FingerprintStore {
        self.shared.store.as_ref()
    }

    /// Estimate and persist the fingerprint of `camera_id` from `images`.
    ///
    /// Fails with [`Error::InsufficientImages`] before any processing when
    /// fewer than `min_enrollment_images` are given; nothing is stored on
    /// any failure. A successful enrollment replaces any earlier record.
    pub fn enroll(
        &self,
        camera_id: impl Into<String>,
        images: Vec<DynamicImage>,
    ) -> Pending<CameraFingerprint> {
        let camera_id = camera_id.into();
        let required = self.shared.config.min_enrollment_images;
        if images.len() < required {
            warn!(
                "enroll '{camera_id}' rejected: {} of {required} images",
                images.len()
            );
            return Pending::ready(Err(Error::InsufficientImages {
                required,
                provided: images.len(),
            }));
        }
        self.submit("enroll", move |shared| shared.enroll(&camera_id, &images))
    }

    /// Score `image` against the stored fingerprint of `camera_id`.
    ///
    /// Resolves to [`Error::FingerprintNotFound`] if the camera is not enrolled.
    pub fn authenticate(
        &self,
        image: DynamicImage,
        camera_id: impl Into<String>,
    ) -> Pending<AuthenticationResult> {
        let camera_id = camera_id.into();
        self.submit("authenticate", move |shared| {
            let fingerprint = shared.fingerprint(&camera_id)?;
            let result = shared.authenticate(&image, &fingerprint)?;
            info!(
                "authenticate '{camera_id}': pce={:.2} authentic={} ({})",
                result.pce_score, result.is_authentic, result.quality
            );
            Ok(result)
        })
    }

    /// Authenticate every image in `images` against one camera.
    ///
    /// One task per image runs on the pool. The batch succeeds only if every
    /// image does, in which case results are in submission order; otherwise
    /// it resolves to the first error reported by any image.
    pub fn authenticate_batch(
        &self,
        images: Vec<DynamicImage>,
        camera_id: impl Into<String>,
    ) -> Pending<Vec<AuthenticationResult>> {
        let camera_id = camera_id.into();
        self.submit("authenticate_batch", move |shared| {
            let fingerprint = shared.fingerprint(&camera_id)?;
            let results = shared.authenticate_all(&images, &fingerprint)?;
            let authentic = results.iter().filter(|r| r.is_authentic).count();
            info!(
                "authenticate batch '{camera_id}': {authentic}/{} authentic",
                results.len()
            );
            Ok(results)
        })
    }

    /// Localize regions of `image` whose sensor pattern does not match `camera_id`.
    pub fn detect_tampering(
        &self,
        image: DynamicImage,
        camera_id: impl Into<String>,
    ) -> Pending<TamperDetectionResult> {
        let camera_id = camera_id.into();
        self.submit("detect_tampering", move |shared| {
            let fingerprint = shared.fingerprint(&camera_id)?;
            let result = shared.detect_tampering(&image, &fingerprint)?;
            info!(
                "tamper scan '{camera_id}': {}/{} blocks flagged, severity {}",
                result.tampered_regions.len(),
                result.total_blocks,
                result.severity
            );
            Ok(result)
        })
    }

    fn submit<T, F>(&self, operation: &'static str, task: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        self.pool.spawn(move || {
            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(&shared)))
                .unwrap_or_else(|payload| {
                    Err(Error::ProcessingFailure(format!(
                        "{operation} panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });

            match &result {
                Ok(_) => debug!("{operation} finished in {:?}", started.elapsed()),
                Err(e) if e.is_defect() => error!("{operation}: internal defect: {e}"),
                Err(e) => warn!("{operation} failed: {e}"),
            }
            // The caller may have dropped its handle; nothing to deliver then.
            let _ = tx.send(result);
        });
        Pending { rx }
    }
}

impl Shared {
    fn fingerprint(&self, camera_id: &str) -> Result<CameraFingerprint> {
        self.store
            .load(camera_id)?
            .ok_or_else(|| Error::FingerprintNotFound(camera_id.to_string()))
    }

    /// Preprocessed pixels and noise residual at the given size.
    fn residual(
        &self,
        preprocessor: &Preprocessor,
        image: &DynamicImage,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let pixels = preprocessor.process(image)?;
        let residual = self.denoiser.residual(
            &pixels,
            preprocessor.width() as usize,
            preprocessor.height() as usize,
        )?;
        Ok((pixels, residual))
    }

    fn enroll(&self, camera_id: &str, images: &[DynamicImage]) -> Result<CameraFingerprint> {
        let started = Instant::now();
        let (pixels, residuals): (Vec<Vec<f32>>, Vec<Vec<f32>>) = images
            .par_iter()
            .map(|image| self.residual(&self.preprocessor, image))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        debug!(
            "enroll '{camera_id}': {} residuals in {:?}",
            residuals.len(),
            started.elapsed()
        );

        let estimate = fingerprint::aggregate(&pixels, &residuals)?;
        let quality = fingerprint::enrollment_quality(&residuals, &estimate)?;
        let record = CameraFingerprint::new(
            camera_id,
            estimate,
            self.preprocessor.width(),
            self.preprocessor.height(),
            images.len(),
            quality,
        )?;
        self.store.save(&record)?;

        info!(
            "enrolled '{camera_id}' from {} images, average PCE {quality:.2}",
            images.len()
        );
        Ok(record)
    }

    fn authenticate(
        &self,
        image: &DynamicImage,
        fingerprint: &CameraFingerprint,
    ) -> Result<AuthenticationResult> {
        let started = Instant::now();
        let preprocessor = self
            .preprocessor
            .with_dimensions(fingerprint.width(), fingerprint.height());
        let (_, residual) = self.residual(&preprocessor, image)?;
        let pce = correlation::pce(&residual, fingerprint.data())?;

        let mut result = AuthenticationResult::decide(
            fingerprint.camera_id(),
            pce,
            self.config.pce_threshold,
        );
        let metadata = &mut result.metadata;
        metadata.insert("width".into(), fingerprint.width().to_string());
        metadata.insert("height".into(), fingerprint.height().to_string());
        metadata.insert(
            "fingerprint_images".into(),
            fingerprint.number_of_images().to_string(),
        );
        metadata.insert("fingerprint_version".into(), fingerprint.version().to_string());
        metadata.insert(
            "enrolled_at".into(),
            fingerprint.enrollment_date().to_rfc3339(),
        );
        metadata.insert(
            "processing_ms".into(),
            started.elapsed().as_millis().to_string(),
        );
        Ok(result)
    }

    fn authenticate_all(
        &self,
        images: &[DynamicImage],
        fingerprint: &CameraFingerprint,
    ) -> Result<Vec<AuthenticationResult>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        rayon::scope(|s| {
            for (index, image) in images.iter().enumerate() {
                let tx = tx.clone();
                s.spawn(move |_| {
                    let _ = tx.send((index, self.authenticate(image, fingerprint)));
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<AuthenticationResult>> = vec![None; images.len()];
        for (index, outcome) in rx {
            match outcome {
                Ok(result) => slots[index] = Some(result),
                Err(e) => {
                    debug!("batch image {index} failed: {e}");
                    return Err(e);
                }
            }
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::ProcessingFailure("batch task produced no result".into()))
    }

    fn detect_tampering(
        &self,
        image: &DynamicImage,
        fingerprint: &CameraFingerprint,
    ) -> Result<TamperDetectionResult> {
        let preprocessor = self
            .preprocessor
            .with_dimensions(fingerprint.width(), fingerprint.height());
        let (_, residual) = self.residual(&preprocessor, image)?;
        let grid = correlation::local_pce_grid(
            &residual,
            fingerprint.data(),
            fingerprint.width(),
            fingerprint.height(),
            self.config.block_size,
        )?;
        debug!("local PCE grid {}x{}: {:?}", grid.cols, grid.rows, grid.scores);
        Ok(tamper::localize(&grid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use image::{Rgb, Rgb32FImage};

    fn small_config() -> Config {
        Config {
            width: 32,
            height: 32,
            block_size: 16,
            min_enrollment_images: 3,
            worker_threads: 2,
            ..Config::default()
        }
    }

    fn noisy(seed: u32) -> DynamicImage {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        DynamicImage::ImageRgb32F(Rgb32FImage::from_fn(32, 32, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            #[allow(clippy::cast_precision_loss)]
            let v = 0.3 + 0.4 * (state as f32 / u32::MAX as f32);
            Rgb([v, v, v])
        }))
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config {
            block_size: 0,
            ..small_config()
        };
        let err = PrnuEngine::new(config, Arc::new(MemoryStore::new())).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn ready_pending_resolves_immediately() {
        let pending = Pending::ready(Ok(7));
        assert_eq!(pending.try_result().unwrap().unwrap(), 7);
        assert!(matches!(
            pending.try_result(),
            Some(Err(Error::ProcessingFailure(_)))
        ));
    }

    #[test]
    fn panicking_task_resolves_to_processing_failure() {
        let engine = PrnuEngine::new(small_config(), Arc::new(MemoryStore::new())).unwrap();
        let pending: Pending<()> = engine.submit("boom", |_| panic!("kaboom"));
        let err = pending.wait().unwrap_err();
        assert!(matches!(err, Error::ProcessingFailure(ref m) if m.contains("kaboom")));
    }

    #[test]
    fn timeout_does_not_lose_the_result() {
        let engine = PrnuEngine::new(small_config(), Arc::new(MemoryStore::new())).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let pending = engine.submit("gated", move |_| {
            let _ = gate_rx.recv();
            Ok(5)
        });
        assert!(pending.wait_timeout(Duration::from_millis(20)).is_err());
        gate_tx.send(()).unwrap();
        assert_eq!(pending.wait_timeout(Duration::from_secs(10)).unwrap(), 5);
    }

    #[test]
    fn workers_are_named() {
        let engine = PrnuEngine::new(small_config(), Arc::new(MemoryStore::new())).unwrap();
        let name = engine
            .submit("name", |_| Ok(std::thread::current().name().map(str::to_string)))
            .wait()
            .unwrap();
        assert!(name.unwrap().starts_with("prnu-worker-"));
    }

    #[test]
    fn small_enrollment_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let engine = PrnuEngine::new(small_config(), store.clone()).unwrap();
        let images: Vec<DynamicImage> = (1..=3).map(noisy).collect();
        let fp = engine.enroll("cam", images).wait().unwrap();
        assert_eq!(fp.data().len(), 32 * 32);
        assert_eq!(fp.number_of_images(), 3);
        assert_eq!(store.list_ids().unwrap(), vec!["cam"]);

        let result = engine.authenticate(noisy(9), "cam").wait().unwrap();
        for key in [
            "quality",
            "threshold",
            "width",
            "height",
            "fingerprint_images",
            "fingerprint_version",
            "enrolled_at",
            "processing_ms",
        ] {
            assert!(result.metadata.contains_key(key), "missing metadata {key}");
        }
        assert_eq!(result.metadata["width"], "32");
    }

    #[test]
    fn unknown_camera_is_not_found() {
        let engine = PrnuEngine::new(small_config(), Arc::new(MemoryStore::new())).unwrap();
        let err = engine.detect_tampering(noisy(1), "ghost").wait().unwrap_err();
        assert!(matches!(err, Error::FingerprintNotFound(ref id) if id == "ghost"));
    }
}
