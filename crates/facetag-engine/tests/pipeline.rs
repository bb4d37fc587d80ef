//! End-to-end pipeline tests with synthetic networks.

use facetag_core::appearance::{AppearanceEncoder, APPEARANCE_EMBEDDING_DIM};
use facetag_core::detector::{DetectParams, DetectorError};
use facetag_core::gallery::{GalleryPolicy, GalleryUpdate, UpdateOrigin};
use facetag_core::network::{DetectorNetwork, EmbeddingNetwork, HeadOutputs, HeadTensor};
use facetag_core::recognizer::{IdentityEncoder, RecognizerError, IDENTITY_EMBEDDING_DIM};
use facetag_core::{
    BoundingBox, Embedding, EmbeddingExtractor, FaceDetector, FaceId, FaceState, FusionConfig, FusionPolicy,
    GalleryStore, ModelVariant, Photo, PipelineConfig, RecognitionContext, TagId, VariantRegistry,
};
use facetag_engine::{spawn_maintainer, DetectionStatus, Engine, EngineConfig, EngineError, ModelHandle};
use image::{Rgb, RgbImage};
use ndarray::ArrayView4;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const VARIANT: &str = "scrfd_named_bnkps";

fn variant() -> ModelVariant {
    VariantRegistry::builtin().get(VARIANT).unwrap().clone()
}

/// Stride-16 head tensors holding one candidate per `(corners, score)`,
/// optionally leaving one tensor out.
fn heads_with_faces(
    variant: &ModelVariant,
    faces: &[((f32, f32, f32, f32), f32)],
    missing: Option<&str>,
) -> HeadOutputs {
    let mut tensors: HashMap<String, Vec<f32>> = HashMap::new();
    for head in &variant.heads {
        let n = variant.anchor_count(head);
        tensors.insert(head.score.clone(), vec![0.0; n]);
        tensors.insert(head.bbox.clone(), vec![0.0; n * 4]);
        if let Some(k) = &head.landmarks {
            tensors.insert(k.clone(), vec![0.0; n * 10]);
        }
    }

    let head = &variant.heads[1];
    let s = head.stride as f32;
    let grid = variant.grid_size(head);
    for &((x1, y1, x2, y2), score) in faces {
        let col = (((x1 + x2) / 2.0 / s).round() as usize).min(grid - 1);
        let row = (((y1 + y2) / 2.0 / s).round() as usize).min(grid - 1);
        let idx = (row * grid + col) * variant.anchors_per_cell;
        let (ax, ay) = variant.anchor_center(head, idx);
        tensors.get_mut(&head.score).unwrap()[idx] = score;
        tensors.get_mut(&head.bbox).unwrap()[idx * 4..idx * 4 + 4]
            .copy_from_slice(&[(ax - x1) / s, (ay - y1) / s, (x2 - ax) / s, (y2 - ay) / s]);
    }

    let mut outputs = HeadOutputs::new();
    for (name, data) in tensors {
        if missing == Some(name.as_str()) {
            continue;
        }
        outputs.insert(name, HeadTensor::new(vec![data.len()], data));
    }
    outputs
}

struct FakeDetector {
    outputs: HeadOutputs,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl DetectorNetwork for FakeDetector {
    fn infer(&self, _input: ArrayView4<'_, f32>) -> Result<HeadOutputs, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(self.outputs.clone())
    }
}

struct FixedEmbedding(Vec<f32>);

impl EmbeddingNetwork for FixedEmbedding {
    fn embed(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
        Ok(self.0.clone())
    }
}

struct FailingEmbedding;

impl EmbeddingNetwork for FailingEmbedding {
    fn embed(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
        Err(RecognizerError::InferenceFailed("synthetic failure".into()))
    }
}

struct SlowEmbedding {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl EmbeddingNetwork for SlowEmbedding {
    fn embed(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(subject_identity())
    }
}

/// Records the mean of every input tensor it sees.
#[derive(Default)]
struct MeanRecorder {
    means: Mutex<Vec<f32>>,
}

impl EmbeddingNetwork for MeanRecorder {
    fn embed(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, RecognizerError> {
        self.means.lock().unwrap().push(input.mean().unwrap_or(0.0));
        Ok(at_similarity(APPEARANCE_EMBEDDING_DIM, 1.0))
    }
}

/// Unit vector of `dim` at cosine `sim` to the first basis vector.
fn at_similarity(dim: usize, sim: f32) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[0] = sim;
    v[1] = (1.0 - sim * sim).max(0.0).sqrt();
    v
}

fn subject_identity() -> Vec<f32> {
    at_similarity(IDENTITY_EMBEDDING_DIM, 1.0)
}

fn identity_only() -> PipelineConfig {
    PipelineConfig {
        detector_variant: VARIANT.into(),
        fusion: FusionConfig {
            policy: FusionPolicy::IdentityOnly,
            ..FusionConfig::default()
        },
        ..PipelineConfig::default()
    }
}

struct Fixture {
    faces: Vec<((f32, f32, f32, f32), f32)>,
    missing: Option<&'static str>,
    delay: Duration,
    identity: Arc<dyn EmbeddingNetwork>,
    appearance: Option<Arc<dyn EmbeddingNetwork>>,
    pipeline: PipelineConfig,
    config: EngineConfig,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            faces: vec![((200.0, 180.0, 300.0, 300.0), 0.9)],
            missing: None,
            delay: Duration::ZERO,
            identity: Arc::new(FixedEmbedding(subject_identity())),
            appearance: None,
            pipeline: identity_only(),
            config: EngineConfig {
                worker_threads: 2,
                detection_timeout_ms: 5_000,
                embedding_timeout_ms: 5_000,
                ..EngineConfig::default()
            },
        }
    }
}

impl Fixture {
    fn start(self, gallery: Arc<GalleryStore>) -> (Engine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let v = variant();
        let network = FakeDetector {
            outputs: heads_with_faces(&v, &self.faces, self.missing),
            delay: self.delay,
            calls: Arc::clone(&calls),
        };
        let detector = FaceDetector::new(Arc::new(network), v, DetectParams::from(&self.pipeline)).unwrap();
        let appearance = self.appearance.map(|net| {
            AppearanceEncoder::new(net, self.pipeline.body_crop, self.pipeline.min_crop_px)
        });
        let extractor = EmbeddingExtractor::new(
            IdentityEncoder::new(self.identity, self.pipeline.min_crop_px),
            appearance,
        );
        let engine = Engine::with_models(
            &self.config,
            self.pipeline,
            ModelHandle::ready("detector", detector),
            ModelHandle::ready("recognizer", extractor),
            gallery,
        )
        .unwrap();
        (engine, calls)
    }
}

fn seed(store: &GalleryStore, tag: &str, embedding: Embedding) {
    store
        .incorporate(GalleryUpdate {
            face: FaceId::new(),
            tag: tag.into(),
            event: "wedding".into(),
            embedding,
            origin: UpdateOrigin::Manual,
        })
        .unwrap();
}

fn identity_entry(sim: f32) -> Embedding {
    Embedding {
        values: at_similarity(IDENTITY_EMBEDDING_DIM, sim),
        model_version: Some(FusionConfig {
            policy: FusionPolicy::IdentityOnly,
            ..FusionConfig::default()
        }
        .version()),
    }
}

fn context() -> RecognitionContext {
    RecognitionContext::new("wedding", [TagId::from("alice"), TagId::from("bob")])
}

fn photo(id: &str) -> Photo {
    Photo::new(id, RgbImage::new(640, 640))
}

#[tokio::test]
async fn clear_face_matches_gallery_tag() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    seed(&store, "alice", identity_entry(0.92));

    let (engine, _) = Fixture::default().start(Arc::clone(&store));
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();

    assert_eq!(analysis.status, DetectionStatus::Completed);
    assert_eq!(analysis.faces.len(), 1);
    let face = &analysis.faces[0];
    assert_eq!(face.state, FaceState::Matched);
    assert_eq!(face.recognized_tag, Some(TagId::from("alice")));
    assert!((face.fused_score.unwrap() - 0.92).abs() < 1e-4);
    assert!((face.bbox.left - 200.0).abs() < 1e-3);
    assert!((face.bbox.bottom() - 300.0).abs() < 1e-3);
    assert!(face.bbox.contains_within(640, 640));
    assert_eq!(face.identity_embedding.as_ref().unwrap().dim(), IDENTITY_EMBEDDING_DIM);

    // 0.92 clears the auto-enroll threshold.
    assert_eq!(analysis.gallery_updates.len(), 1);
    assert_eq!(analysis.gallery_updates[0].tag, TagId::from("alice"));

    engine.shutdown();
}

#[tokio::test]
async fn near_tie_between_tags_stays_unmatched() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    seed(&store, "alice", identity_entry(0.81));
    seed(&store, "bob", identity_entry(0.80));

    let (engine, _) = Fixture::default().start(store);
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();

    let face = &analysis.faces[0];
    assert_eq!(face.state, FaceState::Unmatched);
    assert!(face.recognized_tag.is_none());
    assert!((face.fused_score.unwrap() - 0.81).abs() < 1e-4);
    assert!(analysis.gallery_updates.is_empty());
}

#[tokio::test]
async fn faces_outside_context_are_not_matched() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    seed(&store, "carol", identity_entry(0.95));

    let (engine, _) = Fixture::default().start(store);
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();
    assert_eq!(analysis.faces[0].state, FaceState::Unmatched);
    assert!(analysis.faces[0].fused_score.is_none());
}

#[tokio::test]
async fn slow_detection_times_out_with_empty_result() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let fixture = Fixture {
        delay: Duration::from_millis(300),
        config: EngineConfig {
            worker_threads: 1,
            detection_timeout_ms: 50,
            ..Fixture::default().config
        },
        ..Fixture::default()
    };
    let (engine, calls) = fixture.start(store);

    let ctx = context();
    let (a, b) = tokio::join!(engine.analyze(photo("a"), &ctx), engine.analyze(photo("b"), &ctx));
    for analysis in [a.unwrap(), b.unwrap()] {
        assert_eq!(analysis.status, DetectionStatus::TimedOut);
        assert!(analysis.faces.is_empty());
        assert!(analysis.gallery_updates.is_empty());
    }

    // The second job expired while the single worker was busy and was skipped.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

#[tokio::test]
async fn embedding_failure_leaves_face_unmatched() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    seed(&store, "alice", identity_entry(0.99));
    let fixture = Fixture {
        identity: Arc::new(FailingEmbedding),
        ..Fixture::default()
    };
    let (engine, _) = fixture.start(store);

    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();
    let face = &analysis.faces[0];
    assert_eq!(face.state, FaceState::Unmatched);
    assert!(face.identity_embedding.is_none());
    assert!(face.fused_embedding.is_none());
    assert!(face.recognized_tag.is_none());
}

#[tokio::test]
async fn embedding_deadline_leaves_faces_unmatched() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    seed(&store, "alice", identity_entry(0.99));
    let calls = Arc::new(AtomicUsize::new(0));
    let fixture = Fixture {
        faces: vec![
            ((40.0, 40.0, 120.0, 140.0), 0.9),
            ((300.0, 200.0, 400.0, 330.0), 0.8),
            ((500.0, 420.0, 580.0, 520.0), 0.7),
        ],
        identity: Arc::new(SlowEmbedding {
            delay: Duration::from_millis(400),
            calls: Arc::clone(&calls),
        }),
        config: EngineConfig {
            worker_threads: 1,
            embedding_timeout_ms: 100,
            ..Fixture::default().config
        },
        ..Fixture::default()
    };
    let (engine, _) = fixture.start(store);

    let started = Instant::now();
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(350), "took {elapsed:?}");
    assert_eq!(analysis.status, DetectionStatus::Completed);
    assert_eq!(analysis.faces.len(), 3);
    for face in &analysis.faces {
        assert_eq!(face.state, FaceState::Unmatched);
        assert!(face.identity_embedding.is_none());
        assert!(face.fused_embedding.is_none());
        assert!(face.recognized_tag.is_none());
    }
    assert!(analysis.gallery_updates.is_empty());

    // Only the job already running when the deadline passed reached the network.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.shutdown();
}

#[tokio::test]
async fn person_box_drives_appearance_crop() {
    // White person region on black; the face sits inside it.
    let mut image = RgbImage::new(640, 640);
    for y in 150..640 {
        for x in 150..350 {
            image.put_pixel(x, y, Rgb([255, 255, 255]));
        }
    }
    let person = BoundingBox::from_corners(150.0, 150.0, 350.0, 640.0);
    let elsewhere = BoundingBox::from_corners(450.0, 0.0, 640.0, 300.0);

    let recorder = Arc::new(MeanRecorder::default());
    let fixture = Fixture {
        appearance: Some(Arc::clone(&recorder) as Arc<dyn EmbeddingNetwork>),
        pipeline: PipelineConfig {
            detector_variant: VARIANT.into(),
            ..PipelineConfig::default()
        },
        ..Fixture::default()
    };
    let (engine, _) = fixture.start(Arc::new(GalleryStore::new(GalleryPolicy::default())));

    let with_person = engine
        .analyze_with_people(Photo::new("p1", image.clone()), &[elsewhere, person], &context())
        .await
        .unwrap();
    let dilated = engine.analyze(Photo::new("p2", image), &context()).await.unwrap();
    assert!(with_person.faces[0].appearance_embedding.is_some());
    assert!(dilated.faces[0].appearance_embedding.is_some());

    let means = recorder.means.lock().unwrap().clone();
    assert_eq!(means.len(), 2);
    // All-white crop normalizes to about 2.4; the dilated face box takes in black.
    assert!(means[0] > 2.3, "person crop mean {}", means[0]);
    assert!(means[1] < 1.5, "dilated crop mean {}", means[1]);
}

#[tokio::test]
async fn weighted_fusion_combines_identity_and_appearance() {
    let pipeline = PipelineConfig {
        detector_variant: VARIANT.into(),
        ..PipelineConfig::default()
    };
    let fusion = pipeline.fusion;
    let appearance = at_similarity(APPEARANCE_EMBEDDING_DIM, 1.0);

    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let entry_id = Embedding::normalized(at_similarity(IDENTITY_EMBEDDING_DIM, 0.92), "w600k_r50").unwrap();
    let entry_app = Embedding::normalized(appearance.clone(), "osnet_x1_0").unwrap();
    seed(
        &store,
        "alice",
        fusion.fuse(Some(&entry_id), Some(&entry_app), APPEARANCE_EMBEDDING_DIM).unwrap(),
    );

    let fixture = Fixture {
        appearance: Some(Arc::new(FixedEmbedding(appearance))),
        pipeline,
        ..Fixture::default()
    };
    let (engine, _) = fixture.start(store);
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();

    let face = &analysis.faces[0];
    assert_eq!(face.state, FaceState::Matched);
    assert!(face.appearance_embedding.is_some());
    assert_eq!(face.fused_embedding.as_ref().unwrap().model_version.as_deref(), Some(fusion.version().as_str()));
    // 0.8 * 0.92 + 0.2 * 1.0
    assert!((face.fused_score.unwrap() - 0.936).abs() < 1e-4);
}

#[tokio::test]
async fn multiple_faces_in_score_order() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let fixture = Fixture {
        faces: vec![
            ((40.0, 40.0, 120.0, 140.0), 0.55),
            ((300.0, 200.0, 400.0, 330.0), 0.95),
            ((500.0, 420.0, 580.0, 520.0), 0.75),
        ],
        ..Fixture::default()
    };
    let (engine, _) = fixture.start(store);
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();

    let scores: Vec<f32> = analysis.faces.iter().map(|f| f.score).collect();
    assert_eq!(scores, [0.95, 0.75, 0.55]);
    assert!(analysis.faces.iter().all(|f| f.photo.0 == "p1"));
    // Empty gallery: nothing matched, nothing scored.
    assert!(analysis.faces.iter().all(|f| f.state == FaceState::Unmatched && f.fused_score.is_none()));
}

#[tokio::test]
async fn empty_image_reports_failure() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let (engine, _) = Fixture::default().start(store);
    let analysis = engine
        .analyze(Photo::new("empty", RgbImage::new(0, 0)), &context())
        .await
        .unwrap();
    assert!(matches!(analysis.status, DetectionStatus::Failed { .. }));
    assert!(analysis.faces.is_empty());
}

#[tokio::test]
async fn unavailable_detector_is_fatal() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let pipeline = identity_only();
    let extractor = EmbeddingExtractor::new(
        IdentityEncoder::new(Arc::new(FixedEmbedding(subject_identity())), 8),
        None,
    );
    let engine = Engine::with_models(
        &EngineConfig::default(),
        pipeline,
        ModelHandle::lazy("detector", || {
            Err::<FaceDetector, _>(DetectorError::ModelNotFound("det_10g.onnx".into()))
        }),
        ModelHandle::ready("recognizer", extractor),
        store,
    )
    .unwrap();

    assert!(matches!(engine.warm_up(), Err(EngineError::DetectorUnavailable(_))));
    let result = engine.analyze(photo("p1"), &context()).await;
    assert!(matches!(result, Err(EngineError::DetectorUnavailable(_))));
}

#[tokio::test]
async fn automatic_matches_feed_the_gallery() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    seed(&store, "alice", identity_entry(0.92));
    let (maintainer, task) = spawn_maintainer(Arc::clone(&store), 16);

    let (engine, _) = Fixture::default().start(Arc::clone(&store));
    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();
    maintainer.submit_all(analysis.gallery_updates).await.unwrap();
    drop(maintainer);

    let stats = task.await.unwrap();
    assert_eq!(stats.added, 1);
    assert_eq!(store.entries_for(&TagId::from("alice")).unwrap().len(), 2);
}

#[tokio::test]
async fn candidate_flood_is_capped_before_suppression() {
    // 200 well separated candidates with distinct scores.
    let faces: Vec<_> = (0..200)
        .map(|i| {
            let cx = ((2 * (i % 20) + 1) * 16) as f32;
            let cy = ((2 * (i / 20) + 1) * 16) as f32;
            ((cx - 6.0, cy - 6.0, cx + 6.0, cy + 6.0), 0.31 + i as f32 * 0.003)
        })
        .collect();
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let (engine, _) = Fixture {
        faces,
        ..Fixture::default()
    }
    .start(store);

    let analysis = engine.analyze(photo("crowd"), &context()).await.unwrap();
    assert_eq!(analysis.status, DetectionStatus::Completed);
    assert_eq!(analysis.faces.len(), 150);
    let floor = 0.31 + 50.0 * 0.003 - 1e-5;
    assert!(analysis.faces.iter().all(|f| f.score >= floor));
    assert!(analysis.faces.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn head_mismatch_degrades_to_empty_result() {
    let store = Arc::new(GalleryStore::new(GalleryPolicy::default()));
    let (engine, _) = Fixture {
        missing: Some("kps_8"),
        ..Fixture::default()
    }
    .start(store);

    let analysis = engine.analyze(photo("p1"), &context()).await.unwrap();
    match &analysis.status {
        DetectionStatus::Degraded { warning } => assert!(warning.contains("kps_8"), "{warning}"),
        other => panic!("expected degraded status, got {other:?}"),
    }
    assert!(analysis.faces.is_empty());
}

#[test]
fn status_serializes_with_tag() {
    let status = DetectionStatus::Degraded {
        warning: "tensor kps_8 missing".into(),
    };
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["warning"], "tensor kps_8 missing");
}
