use emolens_core::{EmotionClassifier, EmotionScores, FaceExtractor, OrientationCode, OrientationPolicy};
use emolens_hw::{CameraError, Frame, FrameSource};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const UPDATE_QUEUE: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture source failed to start: {0}")]
    CaptureStart(#[from] CameraError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// One completed inference, delivered to the UI loop.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreUpdate {
    /// Position of the source frame in this run, starting at 1.
    pub frame_index: u64,
    #[serde(skip)]
    pub captured_at: Instant,
    pub orientation: OrientationCode,
    pub faces_in_frame: usize,
    /// Which face of the frame (0 = most confident).
    pub face: usize,
    pub scores: EmotionScores,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub max_faces: usize,
    pub frame_queue: usize,
    pub skip_dark_frames: bool,
    /// Capture gives up after this many failed reads in a row.
    pub max_consecutive_errors: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_faces: 1,
            frame_queue: 2,
            skip_dark_frames: true,
            max_consecutive_errors: 30,
        }
    }
}

/// Counters reported by the work thread when it exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub skipped: u64,
    pub inferences: u64,
}

/// A running capture → work pipeline and the receiving end of its updates.
pub struct Pipeline {
    stop: Arc<AtomicBool>,
    capture: JoinHandle<()>,
    worker: JoinHandle<WorkerStats>,
    updates: mpsc::Receiver<ScoreUpdate>,
}

impl Pipeline {
    /// Next completed inference, `None` once the pipeline has drained.
    pub async fn next_update(&mut self) -> Option<ScoreUpdate> {
        self.updates.recv().await
    }

    /// Blocking variant of [`next_update`](Self::next_update) for non-async callers.
    pub fn blocking_next_update(&mut self) -> Option<ScoreUpdate> {
        self.updates.blocking_recv()
    }

    /// Stop capture, let the worker drain and join both threads. Blocks.
    pub fn shutdown(self) -> WorkerStats {
        let Pipeline { stop, capture, worker, updates } = self;
        stop.store(true, Ordering::Relaxed);
        // Unblocks a worker waiting for room in the update queue.
        drop(updates);

        if capture.join().is_err() {
            tracing::error!("capture thread panicked");
        }
        match worker.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("work thread panicked");
                WorkerStats::default()
            }
        }
    }
}

/// Start the pipeline.
///
/// The source is started on the calling thread so that a capture failure is
/// reported before anything else runs. Frames then flow:
/// capture thread → bounded queue (overflow dropped) → work thread → UI loop.
pub fn spawn_pipeline(
    mut source: Box<dyn FrameSource>,
    orientation: OrientationPolicy,
    mut extractor: Box<dyn FaceExtractor>,
    mut classifier: Box<dyn EmotionClassifier>,
    settings: PipelineSettings,
) -> Result<Pipeline, EngineError> {
    source.start()?;

    let stop = Arc::new(AtomicBool::new(false));
    let (frame_tx, mut frame_rx) = mpsc::channel::<(u64, Frame)>(settings.frame_queue.max(1));
    let (update_tx, updates) = mpsc::channel::<ScoreUpdate>(UPDATE_QUEUE);

    let capture_stop = stop.clone();
    let capture = std::thread::Builder::new()
        .name("emolens-capture".into())
        .spawn(move || run_capture(source, frame_tx, capture_stop, settings.max_consecutive_errors))
        .map_err(|source| EngineError::Spawn { name: "capture", source })?;

    let worker = std::thread::Builder::new()
        .name("emolens-worker".into())
        .spawn(move || {
            tracing::info!("work thread started");
            let mut stats = WorkerStats::default();
            while let Some((index, frame)) = frame_rx.blocking_recv() {
                let updates = process_frame(
                    index,
                    &frame,
                    &orientation,
                    extractor.as_mut(),
                    classifier.as_mut(),
                    &settings,
                );
                stats.frames += 1;
                if updates.is_empty() {
                    stats.skipped += 1;
                }
                for update in updates {
                    stats.inferences += 1;
                    if update_tx.blocking_send(update).is_err() {
                        tracing::info!("update receiver closed, work thread exiting");
                        return stats;
                    }
                }
            }
            tracing::info!(?stats, "work thread exiting");
            stats
        });

    let worker = match worker {
        Ok(handle) => handle,
        Err(source) => {
            // frame_rx went down with the closure, so capture exits on its next send.
            stop.store(true, Ordering::Relaxed);
            let _ = capture.join();
            return Err(EngineError::Spawn { name: "worker", source });
        }
    };

    Ok(Pipeline { stop, capture, worker, updates })
}

fn run_capture(
    mut source: Box<dyn FrameSource>,
    frame_tx: mpsc::Sender<(u64, Frame)>,
    stop: Arc<AtomicBool>,
    max_consecutive_errors: usize,
) {
    tracing::info!("capture thread started");
    let mut index = 0u64;
    let mut failures = 0usize;

    while !stop.load(Ordering::Relaxed) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                failures = 0;
                index += 1;
                match frame_tx.try_send((index, frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::trace!(index, "work queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => {
                tracing::info!(frames = index, "capture source ended");
                break;
            }
            Err(e) => {
                failures += 1;
                tracing::debug!(error = %e, failures, "skipping frame");
                if failures >= max_consecutive_errors {
                    tracing::error!(error = %e, failures, "capture keeps failing, stopping");
                    break;
                }
            }
        }
    }

    source.stop();
    tracing::info!("capture thread exiting");
}

/// Orientation → extraction → classification for one frame.
///
/// Every failure is a silent skip of the affected frame or face: it is logged
/// at debug/trace level and produces no update.
pub fn process_frame(
    index: u64,
    frame: &Frame,
    orientation: &OrientationPolicy,
    extractor: &mut dyn FaceExtractor,
    classifier: &mut dyn EmotionClassifier,
    settings: &PipelineSettings,
) -> Vec<ScoreUpdate> {
    if settings.skip_dark_frames && frame.is_dark() {
        tracing::trace!(index, "dark frame, skipping");
        return Vec::new();
    }

    let code = orientation.current();

    let faces = match extractor.extract(&frame.data, frame.width, frame.height) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::debug!(index, error = %e, "face extraction failed, skipping frame");
            return Vec::new();
        }
    };
    if faces.is_empty() {
        tracing::trace!(index, "no faces");
        return Vec::new();
    }

    let faces_in_frame = faces.len();
    faces
        .iter()
        .take(settings.max_faces)
        .enumerate()
        .filter_map(|(face_idx, face)| match classifier.classify(face, code) {
            Ok(Some(scores)) => Some(ScoreUpdate {
                frame_index: index,
                captured_at: frame.timestamp,
                orientation: code,
                faces_in_frame,
                face: face_idx,
                scores,
            }),
            Ok(None) => {
                tracing::trace!(index, face = face_idx, "classifier returned no result");
                None
            }
            Err(e) => {
                tracing::debug!(index, face = face_idx, error = %e, "classification failed");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use emolens_core::{
        BoundingBox, CameraFacing, ClassifierError, DetectorError, DeviceOrientation, FaceImage,
        FixedDeviceOrientation,
    };
    use image::GrayImage;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn frame(brightness: u8) -> Frame {
        Frame::new(vec![brightness; 16 * 16], 16, 16, 0)
    }

    fn face(confidence: f32) -> FaceImage {
        FaceImage {
            pixels: GrayImage::new(8, 8),
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 8.0, height: 8.0, confidence },
        }
    }

    /// Returns `faces_per_frame[i]` faces for the i-th call, repeating the last entry.
    struct ScriptedExtractor {
        faces_per_frame: Vec<usize>,
        calls: usize,
    }

    impl ScriptedExtractor {
        fn always(n: usize) -> Self {
            Self { faces_per_frame: vec![n], calls: 0 }
        }
    }

    impl FaceExtractor for ScriptedExtractor {
        fn extract(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<FaceImage>, DetectorError> {
            let n = self.faces_per_frame[self.calls.min(self.faces_per_frame.len() - 1)];
            self.calls += 1;
            Ok((0..n).map(|i| face(0.9 - i as f32 * 0.1)).collect())
        }
    }

    struct FailingExtractor;

    impl FaceExtractor for FailingExtractor {
        fn extract(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<FaceImage>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    /// Counts calls and records the orientation of each.
    #[derive(Clone, Default)]
    struct RecordingClassifier {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<OrientationCode>>>,
        answer_none: bool,
    }

    impl EmotionClassifier for RecordingClassifier {
        fn classify(
            &mut self,
            _: &FaceImage,
            orientation: OrientationCode,
        ) -> Result<Option<EmotionScores>, ClassifierError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(orientation);
            if self.answer_none {
                return Ok(None);
            }
            Ok(Some(
                [("happiness".to_string(), n as f32 / 100.0)].into_iter().collect(),
            ))
        }
    }

    struct ScriptedSource {
        frames: VecDeque<Result<Frame, CameraError>>,
        fail_start: bool,
        stopped: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Result<Frame, CameraError>>) -> Self {
            Self {
                frames: frames.into(),
                fail_start: false,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn start(&mut self) -> Result<(), CameraError> {
            if self.fail_start {
                Err(CameraError::DeviceBusy)
            } else {
                Ok(())
            }
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            self.frames.pop_front().transpose()
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings { frame_queue: 16, ..PipelineSettings::default() }
    }

    fn fixed_up() -> OrientationPolicy {
        OrientationPolicy::Fixed(OrientationCode::Up)
    }

    #[test]
    fn test_no_faces_means_no_inference() {
        let classifier = RecordingClassifier::default();
        let updates = process_frame(
            1,
            &frame(128),
            &fixed_up(),
            &mut ScriptedExtractor::always(0),
            &mut classifier.clone(),
            &settings(),
        );
        assert!(updates.is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_extractor_failure_skips_frame() {
        let classifier = RecordingClassifier::default();
        let updates = process_frame(
            1,
            &frame(128),
            &fixed_up(),
            &mut FailingExtractor,
            &mut classifier.clone(),
            &settings(),
        );
        assert!(updates.is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dark_frame_is_skipped_before_extraction() {
        let mut extractor = ScriptedExtractor::always(1);
        let updates = process_frame(
            1,
            &frame(0),
            &fixed_up(),
            &mut extractor,
            &mut RecordingClassifier::default(),
            &settings(),
        );
        assert!(updates.is_empty());
        assert_eq!(extractor.calls, 0);

        let no_skip = PipelineSettings { skip_dark_frames: false, ..settings() };
        let updates = process_frame(
            1,
            &frame(0),
            &fixed_up(),
            &mut extractor,
            &mut RecordingClassifier::default(),
            &no_skip,
        );
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_max_faces_limits_inference() {
        let classifier = RecordingClassifier::default();
        let two = PipelineSettings { max_faces: 2, ..settings() };
        let updates = process_frame(
            7,
            &frame(128),
            &fixed_up(),
            &mut ScriptedExtractor::always(3),
            &mut classifier.clone(),
            &two,
        );
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.frame_index == 7 && u.faces_in_frame == 3));
        assert_eq!(updates[0].face, 0);
        assert_eq!(updates[1].face, 1);
    }

    #[test]
    fn test_classifier_without_result_gives_no_update() {
        let classifier = RecordingClassifier { answer_none: true, ..Default::default() };
        let updates = process_frame(
            1,
            &frame(128),
            &fixed_up(),
            &mut ScriptedExtractor::always(1),
            &mut classifier.clone(),
            &settings(),
        );
        assert!(updates.is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_orientation_is_resolved_per_frame() {
        let classifier = RecordingClassifier::default();
        let front = OrientationPolicy::Resolve {
            source: Box::new(FixedDeviceOrientation(DeviceOrientation::RotatedLeft)),
            facing: CameraFacing::Front,
        };
        let back = OrientationPolicy::Resolve {
            source: Box::new(FixedDeviceOrientation(DeviceOrientation::RotatedLeft)),
            facing: CameraFacing::Back,
        };
        let mut extractor = ScriptedExtractor::always(1);
        let mut c = classifier.clone();
        let a = process_frame(1, &frame(128), &front, &mut extractor, &mut c, &settings());
        let b = process_frame(2, &frame(128), &back, &mut extractor, &mut c, &settings());

        assert_eq!(a[0].orientation, OrientationCode::Down);
        assert_eq!(b[0].orientation, OrientationCode::Up);
        assert_eq!(
            *classifier.seen.lock().unwrap(),
            vec![OrientationCode::Down, OrientationCode::Up]
        );
    }

    #[test]
    fn test_start_failure_is_reported_and_nothing_runs() {
        let classifier = RecordingClassifier::default();
        let mut source = ScriptedSource::new(vec![Ok(frame(128))]);
        source.fail_start = true;

        let result = spawn_pipeline(
            Box::new(source),
            fixed_up(),
            Box::new(ScriptedExtractor::always(1)),
            Box::new(classifier.clone()),
            settings(),
        );
        assert!(matches!(result, Err(EngineError::CaptureStart(CameraError::DeviceBusy))));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pipeline_delivers_updates_in_frame_order() {
        let source = ScriptedSource::new(vec![
            Ok(frame(128)),
            Err(CameraError::CaptureFailed("short read".into())),
            Ok(frame(128)),
            Ok(frame(128)),
            Ok(frame(128)),
        ]);
        let stopped = source.stopped.clone();
        // second frame has no face
        let extractor = ScriptedExtractor { faces_per_frame: vec![1, 0, 1], calls: 0 };
        let classifier = RecordingClassifier::default();

        let mut pipeline = spawn_pipeline(
            Box::new(source),
            fixed_up(),
            Box::new(extractor),
            Box::new(classifier.clone()),
            settings(),
        )
        .unwrap();

        let mut indices = Vec::new();
        while let Some(update) = pipeline.blocking_next_update() {
            indices.push(update.frame_index);
        }

        // Frames are numbered as captured; the failed read is not a frame.
        assert_eq!(indices, vec![1, 3, 4]);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);

        let stats = pipeline.shutdown();
        assert_eq!(stats, WorkerStats { frames: 4, skipped: 1, inferences: 3 });
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_capture_gives_up_after_repeated_failures() {
        let failures = (0..5)
            .map(|_| Err(CameraError::CaptureFailed("gone".into())))
            .chain(std::iter::once(Ok(frame(128))))
            .collect();
        let source = ScriptedSource::new(failures);
        let stopped = source.stopped.clone();
        let classifier = RecordingClassifier::default();

        let mut pipeline = spawn_pipeline(
            Box::new(source),
            fixed_up(),
            Box::new(ScriptedExtractor::always(1)),
            Box::new(classifier.clone()),
            PipelineSettings { max_consecutive_errors: 3, ..settings() },
        )
        .unwrap();

        assert!(pipeline.blocking_next_update().is_none());
        pipeline.shutdown();
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
        assert!(stopped.load(Ordering::SeqCst));
    }
}
