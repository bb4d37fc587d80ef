use crate::config::EngineConfig;
use crate::model_handle::ModelHandle;
use crossbeam_channel::{Receiver, Sender};
use facetag_core::appearance::{AppearanceEncoder, APPEARANCE_EMBEDDING_DIM};
use facetag_core::detector::DetectParams;
use facetag_core::gallery::{GalleryError, GalleryStore, GalleryUpdate};
use facetag_core::matcher::MatchParams;
use facetag_core::recognizer::IdentityEncoder;
use facetag_core::{
    BoundingBox, ConfigError, CosineMatcher, Detection, DetectionRun, EmbeddingExtractor, Face,
    FaceDetector, FaceEmbeddings, FaceState, MatchOutcome, Matcher, Photo, PhotoId,
    PipelineConfig, RecognitionContext,
};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),
    #[error("recognizer unavailable: {0}")]
    RecognizerUnavailable(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// How the detection stage of one photo ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectionStatus {
    Completed,
    /// Detector output did not match the variant; no faces were produced.
    Degraded { warning: String },
    TimedOut,
    /// Inference failed for this photo only.
    Failed { reason: String },
}

/// Everything the pipeline produced for one photo.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoAnalysis {
    pub photo: PhotoId,
    /// Faces in detection acceptance order.
    pub faces: Vec<Face>,
    pub status: DetectionStatus,
    /// High-confidence automatic matches to forward to the gallery maintainer.
    pub gallery_updates: Vec<GalleryUpdate>,
}

impl PhotoAnalysis {
    fn empty(photo: PhotoId, status: DetectionStatus) -> Self {
        Self {
            photo,
            faces: Vec::new(),
            status,
            gallery_updates: Vec::new(),
        }
    }
}

enum DetectReply {
    Run(DetectionRun),
    Failed(String),
    Expired,
}

/// Work sent to the inference pool. Jobs whose deadline has passed (or
/// whose caller has gone away) are dropped without running inference.
enum Job {
    Detect {
        image: Arc<RgbImage>,
        deadline: Instant,
        reply: oneshot::Sender<Result<DetectReply, EngineError>>,
    },
    Embed {
        image: Arc<RgbImage>,
        detection: Detection,
        person: Option<BoundingBox>,
        deadline: Instant,
        reply: oneshot::Sender<Result<Option<FaceEmbeddings>, EngineError>>,
    },
}

struct Shared {
    detector: ModelHandle<FaceDetector>,
    extractor: ModelHandle<EmbeddingExtractor>,
}

/// Face pipeline engine.
///
/// Owns a pool of inference threads fed by a job queue; async callers only
/// submit jobs and await replies. A running inference call cannot be
/// interrupted: after a timeout its worker stays busy until the runtime
/// returns, and the result is discarded.
pub struct Engine {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    pipeline: PipelineConfig,
    gallery: Arc<GalleryStore>,
    detection_timeout: Duration,
    embedding_timeout: Duration,
}

impl Engine {
    /// Build model handles from configuration and start the worker pool.
    ///
    /// Models load lazily on first use; call [`Engine::warm_up`] to fail fast.
    pub fn start(config: &EngineConfig, gallery: Arc<GalleryStore>) -> Result<Self, EngineError> {
        let pipeline = config.load_pipeline()?;
        let variant = config.load_variants()?.get(&pipeline.detector_variant)?.clone();

        let detector = {
            let path = config.detector_model_path();
            let params = DetectParams::from(&pipeline);
            let intra = config.intra_threads;
            ModelHandle::lazy("detector", move || {
                FaceDetector::load(&path, variant.clone(), params, intra)
            })
        };

        let extractor = {
            let identity_path = config.identity_model_path();
            let appearance_path = config.appearance_model_path();
            let min_crop = pipeline.min_crop_px;
            let body_crop = pipeline.body_crop;
            let intra = config.intra_threads;
            ModelHandle::lazy("recognizer", move || {
                let identity = IdentityEncoder::load(&identity_path, min_crop, intra)?;
                let appearance = match AppearanceEncoder::load(&appearance_path, body_crop, min_crop, intra) {
                    Ok(encoder) => Some(encoder),
                    Err(e) => {
                        tracing::warn!(
                            path = %appearance_path,
                            error = %e,
                            "appearance model unavailable; fusing identity only"
                        );
                        None
                    }
                };
                Ok::<_, facetag_core::RecognizerError>(EmbeddingExtractor::new(identity, appearance))
            })
        };

        Self::with_models(config, pipeline, detector, extractor, gallery)
    }

    /// Start the worker pool around caller-supplied model handles.
    pub fn with_models(
        config: &EngineConfig,
        pipeline: PipelineConfig,
        detector: ModelHandle<FaceDetector>,
        extractor: ModelHandle<EmbeddingExtractor>,
        gallery: Arc<GalleryStore>,
    ) -> Result<Self, EngineError> {
        pipeline.validate()?;
        let shared = Arc::new(Shared {
            detector,
            extractor,
        });

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(config.worker_threads.max(1));
        for id in 0..config.worker_threads.max(1) {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("facetag-worker-{id}"))
                .spawn(move || worker_loop(id, rx, shared))?;
            workers.push(handle);
        }

        tracing::info!(
            workers = workers.len(),
            variant = %pipeline.detector_variant,
            fusion = %pipeline.fusion.version(),
            "engine started"
        );

        Ok(Self {
            jobs: Some(tx),
            workers,
            shared,
            pipeline,
            gallery,
            detection_timeout: config.detection_timeout(),
            embedding_timeout: config.embedding_timeout(),
        })
    }

    /// Load every model now instead of on the first photo. Blocks the caller.
    pub fn warm_up(&self) -> Result<(), EngineError> {
        self.shared
            .detector
            .get()
            .map_err(EngineError::DetectorUnavailable)?;
        self.shared
            .extractor
            .get()
            .map_err(EngineError::RecognizerUnavailable)?;
        tracing::info!("models warmed up");
        Ok(())
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn gallery(&self) -> &Arc<GalleryStore> {
        &self.gallery
    }

    fn submit(&self, job: Job) -> Result<(), EngineError> {
        self.jobs
            .as_ref()
            .ok_or(EngineError::ChannelClosed)?
            .send(job)
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Detect, embed, fuse and match every face in a photo.
    ///
    /// Timeouts and per-photo inference failures are reported in the
    /// returned status; only resource-level problems are errors.
    pub async fn analyze(&self, photo: Photo, context: &RecognitionContext) -> Result<PhotoAnalysis, EngineError> {
        self.analyze_with_people(photo, &[], context).await
    }

    /// Like [`Engine::analyze`], with person boxes (any order, source pixel
    /// coordinates) used for appearance crops. Each face takes the unused
    /// box covering most of it; faces without one fall back to the dilated
    /// face box.
    pub async fn analyze_with_people(
        &self,
        photo: Photo,
        people: &[BoundingBox],
        context: &RecognitionContext,
    ) -> Result<PhotoAnalysis, EngineError> {
        let photo_id = photo.id;
        let image = Arc::new(photo.image);

        let run = match self.detect(&photo_id, Arc::clone(&image)).await? {
            Ok(run) => run,
            Err(status) => return Ok(PhotoAnalysis::empty(photo_id, status)),
        };

        let status = match &run.warning {
            Some(warning) => DetectionStatus::Degraded {
                warning: warning.clone(),
            },
            None => DetectionStatus::Completed,
        };

        let mut faces: Vec<Face> = run
            .detections
            .iter()
            .map(|d| Face::from_detection(photo_id.clone(), d))
            .collect();
        if faces.is_empty() {
            return Ok(PhotoAnalysis::empty(photo_id, status));
        }

        let bodies = assign_people(&faces, people);
        let embeddings = self.embed_all(&image, &faces, &bodies).await?;

        let gallery = self.gallery.snapshot(context)?;
        let params = MatchParams::from(&self.pipeline);
        let mut gallery_updates = Vec::new();

        for (face, embedded) in faces.iter_mut().zip(embeddings) {
            self.recognize(face, embedded, &gallery, context, &params);

            let confident = face.state == FaceState::Matched
                && face.fused_score.is_some_and(|s| s >= self.pipeline.auto_enroll_threshold);
            if confident {
                gallery_updates.extend(GalleryUpdate::automatic(face, context.event.clone()));
            }
        }

        tracing::debug!(
            photo = %photo_id,
            faces = faces.len(),
            matched = faces.iter().filter(|f| f.state == FaceState::Matched).count(),
            updates = gallery_updates.len(),
            "photo analyzed"
        );

        Ok(PhotoAnalysis {
            photo: photo_id,
            faces,
            status,
            gallery_updates,
        })
    }

    /// `Ok(Err(status))` when detection produced no run for this photo.
    async fn detect(
        &self,
        photo_id: &PhotoId,
        image: Arc<RgbImage>,
    ) -> Result<Result<DetectionRun, DetectionStatus>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Detect {
            image,
            deadline: Instant::now() + self.detection_timeout,
            reply,
        })?;

        match tokio::time::timeout(self.detection_timeout, rx).await {
            Err(_) => {
                tracing::warn!(
                    photo = %photo_id,
                    timeout_ms = self.detection_timeout.as_millis() as u64,
                    "detection timed out"
                );
                Ok(Err(DetectionStatus::TimedOut))
            }
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Ok(Ok(reply)) => match reply? {
                DetectReply::Run(run) => Ok(Ok(run)),
                DetectReply::Expired => Ok(Err(DetectionStatus::TimedOut)),
                DetectReply::Failed(reason) => {
                    tracing::warn!(photo = %photo_id, %reason, "detection failed");
                    Ok(Err(DetectionStatus::Failed { reason }))
                }
            },
        }
    }

    /// Run every face's embedding job on the pool under one shared deadline.
    /// Faces whose job misses it get `None`.
    async fn embed_all(
        &self,
        image: &Arc<RgbImage>,
        faces: &[Face],
        bodies: &[Option<BoundingBox>],
    ) -> Result<Vec<Option<FaceEmbeddings>>, EngineError> {
        let deadline = Instant::now() + self.embedding_timeout;

        let mut pending = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            let (reply, rx) = oneshot::channel();
            self.submit(Job::Embed {
                image: Arc::clone(image),
                detection: face.detection(),
                person: bodies.get(i).copied().flatten(),
                deadline,
                reply,
            })?;
            pending.push(rx);
        }

        let tokio_deadline = tokio::time::Instant::from_std(deadline);
        let mut results = Vec::with_capacity(pending.len());
        for (face, rx) in faces.iter().zip(pending) {
            let result = match tokio::time::timeout_at(tokio_deadline, rx).await {
                Ok(Ok(reply)) => reply?,
                Ok(Err(_)) => return Err(EngineError::ChannelClosed),
                Err(_) => None,
            };
            if result.is_none() {
                tracing::warn!(face = %face.id, "embedding missed its deadline");
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Fuse a face's embeddings and match the result against the gallery.
    fn recognize(
        &self,
        face: &mut Face,
        embedded: Option<FaceEmbeddings>,
        gallery: &[facetag_core::GalleryEntry],
        context: &RecognitionContext,
        params: &MatchParams,
    ) {
        let FaceEmbeddings {
            identity,
            appearance,
        } = embedded.unwrap_or_default();

        face.fused_embedding =
            self.pipeline
                .fusion
                .fuse(identity.as_ref(), appearance.as_ref(), APPEARANCE_EMBEDDING_DIM);
        face.identity_embedding = identity;
        face.appearance_embedding = appearance;

        let (next, outcome) = match &face.fused_embedding {
            Some(fused) => (
                FaceState::Embedded,
                CosineMatcher.compare(fused, gallery, context, params),
            ),
            None => (
                FaceState::EmbeddingFailed,
                MatchOutcome::Unmatched {
                    best_similarity: None,
                },
            ),
        };

        let applied = face.advance(next).and_then(|_| face.record_match(&outcome));
        if let Err(e) = applied {
            tracing::warn!(face = %face.id, error = %e, "face state not updated");
        }
    }

    /// Close the job queue and wait for the workers to finish queued work.
    pub fn shutdown(mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("inference worker panicked");
            }
        }
        tracing::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and drained.
        self.jobs.take();
    }
}

/// Minimum share of a face box a person box must cover to be its body.
const MIN_PERSON_COVERAGE: f32 = 0.5;

/// Pair faces (in acceptance order, so higher scores choose first) with
/// the unused person box covering the largest share of each face.
fn assign_people(faces: &[Face], people: &[BoundingBox]) -> Vec<Option<BoundingBox>> {
    let mut used = vec![false; people.len()];
    faces
        .iter()
        .map(|face| {
            let best = people
                .iter()
                .enumerate()
                .filter(|(i, _)| !used[*i])
                .map(|(i, person)| (i, coverage(&face.bbox, person)))
                .filter(|&(_, c)| c >= MIN_PERSON_COVERAGE)
                .fold(None, |best: Option<(usize, f32)>, cand| match best {
                    Some(b) if b.1 >= cand.1 => Some(b),
                    _ => Some(cand),
                });
            best.map(|(i, _)| {
                used[i] = true;
                people[i]
            })
        })
        .collect()
}

/// Fraction of `face` lying inside `person`.
fn coverage(face: &BoundingBox, person: &BoundingBox) -> f32 {
    let w = (face.right().min(person.right()) - face.left.max(person.left)).max(0.0);
    let h = (face.bottom().min(person.bottom()) - face.top.max(person.top)).max(0.0);
    let area = face.area();
    if area <= 0.0 {
        return 0.0;
    }
    w * h / area
}

fn expired(deadline: Instant, caller_gone: bool) -> bool {
    caller_gone || Instant::now() >= deadline
}

fn worker_loop(id: usize, rx: Receiver<Job>, shared: Arc<Shared>) {
    tracing::debug!(worker = id, "inference worker started");
    while let Ok(job) = rx.recv() {
        match job {
            Job::Detect {
                image,
                deadline,
                reply,
            } => {
                if expired(deadline, reply.is_closed()) {
                    tracing::debug!(worker = id, "skipping expired detection job");
                    let _ = reply.send(Ok(DetectReply::Expired));
                    continue;
                }
                let result = shared
                    .detector
                    .get()
                    .map_err(EngineError::DetectorUnavailable)
                    .map(|detector| match detector.detect(&image) {
                        Ok(run) => DetectReply::Run(run),
                        Err(e) => DetectReply::Failed(e.to_string()),
                    });
                let _ = reply.send(result);
            }
            Job::Embed {
                image,
                detection,
                person,
                deadline,
                reply,
            } => {
                if expired(deadline, reply.is_closed()) {
                    tracing::debug!(worker = id, "skipping expired embedding job");
                    let _ = reply.send(Ok(None));
                    continue;
                }
                let result = shared
                    .extractor
                    .get()
                    .map_err(EngineError::RecognizerUnavailable)
                    .map(|extractor| Some(extractor.extract(&image, &detection, person.as_ref())));
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(worker = id, "inference worker exiting");
}
