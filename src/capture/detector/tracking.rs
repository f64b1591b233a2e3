//! 多目标跟踪检测器
//!
//! Runs an [`InferenceModel`] on the upright, downscaled frame, maps the
//! model's category indices through the label map in `model_dir/labels.txt`
//! and keeps tracking ids stable across frames by IoU matching.
//!
//! Boxes come back in rotation-corrected frame space, except at 180° where
//! they are flipped back into sensor orientation (the frame dims are the
//! same either way).

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use log::{debug, info, warn};

use super::{DetectedObject, DetectionLabel, DetectorError, ObjectDetector};
use crate::capture::frame::{downscale_to_fit, CameraFrame};
use crate::capture::geometry::{RectF, Rotation};

const LABEL_MAP_FILE: &str = "labels.txt";
const MODEL_INPUT_SIZE: u32 = 320;
const TRACK_IOU_THRESHOLD: f32 = 0.3;
const MAX_LABELS_PER_OBJECT: usize = 3;

/// Raw model output in model-input pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bounding_box: RectF,
    /// (category index, confidence) pairs in any order.
    pub scores: Vec<(u32, f32)>,
}

impl RawDetection {
    fn best_score(&self) -> f32 {
        self.scores.iter().map(|&(_, s)| s).fold(0.0, f32::max)
    }
}

pub trait InferenceModel: Send {
    fn load(&mut self, model_dir: &Path) -> Result<(), String>;

    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<RawDetection>, String>;

    fn release(&mut self) {}
}

#[derive(Debug, Clone)]
struct Track {
    id: u32,
    bounding_box: RectF,
}

pub struct TrackingDetector {
    model_dir: PathBuf,
    model: Box<dyn InferenceModel>,
    labels: Vec<String>,
    tracks: Vec<Track>,
    next_track_id: u32,
    max_objects: usize,
    min_confidence: f32,
    ready: bool,
}

impl TrackingDetector {
    pub fn new(model_dir: PathBuf) -> Self {
        Self::with_model(model_dir, Box::new(ContrastBlobModel::new()))
    }

    pub fn with_model(model_dir: PathBuf, model: Box<dyn InferenceModel>) -> Self {
        Self {
            model_dir,
            model,
            labels: Vec::new(),
            tracks: Vec::new(),
            next_track_id: 1,
            max_objects: 5,
            min_confidence: 0.3,
            ready: false,
        }
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects.max(1);
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    fn load_labels(&self) -> Result<Vec<String>, DetectorError> {
        let path = self.model_dir.join(LABEL_MAP_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            DetectorError::Initialization(format!("label map not found at {:?}: {}", path, e))
        })?;

        let labels: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if labels.is_empty() {
            return Err(DetectorError::Initialization(format!(
                "label map {:?} is empty",
                path
            )));
        }
        Ok(labels)
    }

    fn label_text(&self, category_index: u32) -> String {
        self.labels
            .get(category_index as usize)
            .cloned()
            .unwrap_or_else(|| format!("category_{}", category_index))
    }

    fn to_labels(&self, scores: &[(u32, f32)]) -> Vec<DetectionLabel> {
        let mut sorted = scores.to_vec();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted
            .into_iter()
            .take(MAX_LABELS_PER_OBJECT)
            .map(|(category_index, confidence)| DetectionLabel {
                text: self.label_text(category_index),
                confidence: confidence.clamp(0.0, 1.0),
                category_index,
            })
            .collect()
    }

    /// Greedy IoU matching against the previous frame's tracks.
    fn assign_track_ids(&mut self, boxes: &[RectF]) -> Vec<u32> {
        let mut claimed = vec![false; self.tracks.len()];
        let mut ids = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, _)| !claimed[*i])
                .map(|(i, t)| (i, t.bounding_box.intersection_over_union(bbox)))
                .filter(|&(_, iou)| iou >= TRACK_IOU_THRESHOLD)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let id = match best {
                Some((i, _)) => {
                    claimed[i] = true;
                    self.tracks[i].id
                }
                None => {
                    let id = self.next_track_id;
                    self.next_track_id = self.next_track_id.wrapping_add(1).max(1);
                    id
                }
            };
            ids.push(id);
        }

        self.tracks = boxes
            .iter()
            .zip(&ids)
            .map(|(bbox, &id)| Track {
                id,
                bounding_box: *bbox,
            })
            .collect();
        ids
    }
}

impl ObjectDetector for TrackingDetector {
    fn name(&self) -> &'static str {
        "tracking"
    }

    fn initialize(&mut self) -> Result<(), DetectorError> {
        if self.ready {
            return Ok(());
        }
        info!("🔧 TrackingDetector: loading from {:?}", self.model_dir);

        let labels = self.load_labels()?;
        self.model
            .load(&self.model_dir)
            .map_err(DetectorError::Initialization)?;

        info!("✅ TrackingDetector ready ({} categories)", labels.len());
        self.labels = labels;
        self.ready = true;
        Ok(())
    }

    fn detect_objects(
        &mut self,
        frame: &CameraFrame,
        rotation: Rotation,
    ) -> Result<Vec<DetectedObject>, DetectorError> {
        if !self.ready {
            return Err(DetectorError::NotInitialized);
        }

        let (frame_width, frame_height) = rotation.corrected_dims(frame.width, frame.height);
        let upright = match frame.to_upright_image(rotation) {
            Some(image) => image,
            None => {
                warn!("⚠️ TrackingDetector: frame {} has no pixels", frame.frame_number);
                return Ok(Vec::new());
            }
        };
        let input = downscale_to_fit(upright, MODEL_INPUT_SIZE);
        let (input_width, input_height) = input.dimensions();
        if input_width == 0 || input_height == 0 {
            return Ok(Vec::new());
        }

        let mut raw = match self.model.infer(&input) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("⚠️ TrackingDetector: inference failed: {}", e);
                return Ok(Vec::new());
            }
        };

        raw.retain(|d| d.best_score() >= self.min_confidence);
        raw.sort_by(|a, b| b.best_score().total_cmp(&a.best_score()));
        raw.truncate(self.max_objects);

        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let scale_x = fw / input_width as f32;
        let scale_y = fh / input_height as f32;
        let boxes: Vec<RectF> = raw
            .iter()
            .map(|d| {
                let upright = RectF::new(
                    d.bounding_box.left * scale_x,
                    d.bounding_box.top * scale_y,
                    d.bounding_box.right * scale_x,
                    d.bounding_box.bottom * scale_y,
                );
                // 180°: report in sensor orientation, the bitmap transform only scales
                let bbox = match rotation {
                    Rotation::Deg180 => RectF::new(
                        fw - upright.right,
                        fh - upright.bottom,
                        fw - upright.left,
                        fh - upright.top,
                    ),
                    _ => upright,
                };
                bbox.clamp_to(fw, fh)
            })
            .collect();

        let ids = self.assign_track_ids(&boxes);
        let objects: Vec<DetectedObject> = raw
            .iter()
            .zip(boxes)
            .zip(ids)
            .map(|((d, bbox), id)| DetectedObject::new(bbox, Some(id), self.to_labels(&d.scores)))
            .collect();

        debug!(
            "TrackingDetector: frame {} -> {} objects",
            frame.frame_number,
            objects.len()
        );
        Ok(objects)
    }

    fn stop(&mut self) {
        if !self.ready {
            return;
        }
        self.model.release();
        self.labels.clear();
        self.tracks.clear();
        self.ready = false;
        info!("🛑 TrackingDetector stopped");
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

impl Drop for TrackingDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 基于亮度对比的显著区域模型（无需模型文件）
///
/// Splits the image into a `grid x grid` lattice of cells, marks cells whose
/// mean luma deviates from the scene mean by more than `deviation_factor`
/// standard deviations and reports each 4-connected group of same-sign cells
/// as one detection. Category 0 = brighter than the scene, 1 = darker.
pub struct ContrastBlobModel {
    grid: u32,
    deviation_factor: f32,
    min_cells: usize,
    min_scene_std: f32,
}

impl ContrastBlobModel {
    pub fn new() -> Self {
        Self {
            grid: 24,
            deviation_factor: 1.0,
            min_cells: 2,
            min_scene_std: 4.0,
        }
    }

    fn cell_means(&self, image: &RgbaImage) -> (Vec<f32>, u32, u32) {
        let (width, height) = image.dimensions();
        let cell_w = (width / self.grid).max(1);
        let cell_h = (height / self.grid).max(1);
        let grid = self.grid as usize;

        let mut sums = vec![0f32; grid * grid];
        let mut counts = vec![0u32; grid * grid];
        for (x, y, pixel) in image.enumerate_pixels() {
            let cx = ((x / cell_w) as usize).min(grid - 1);
            let cy = ((y / cell_h) as usize).min(grid - 1);
            let [r, g, b, _] = pixel.0;
            let luma = r as f32 * 0.299 + g as f32 * 0.587 + b as f32 * 0.114;
            sums[cy * grid + cx] += luma;
            counts[cy * grid + cx] += 1;
        }

        let means = sums
            .iter()
            .zip(&counts)
            .map(|(&s, &c)| if c == 0 { 0.0 } else { s / c as f32 })
            .collect();
        (means, cell_w, cell_h)
    }
}

impl Default for ContrastBlobModel {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceModel for ContrastBlobModel {
    fn load(&mut self, _model_dir: &Path) -> Result<(), String> {
        Ok(())
    }

    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<RawDetection>, String> {
        let (width, height) = image.dimensions();
        if width < self.grid || height < self.grid {
            return Ok(Vec::new());
        }

        let grid = self.grid as usize;
        let (means, cell_w, cell_h) = self.cell_means(image);
        let scene_mean = means.iter().sum::<f32>() / means.len() as f32;
        let scene_std = (means.iter().map(|m| (m - scene_mean).powi(2)).sum::<f32>()
            / means.len() as f32)
            .sqrt();
        if scene_std < self.min_scene_std {
            return Ok(Vec::new());
        }

        let threshold = self.deviation_factor * scene_std;
        // +1 brighter, -1 darker, 0 background
        let signs: Vec<i8> = means
            .iter()
            .map(|m| {
                let d = m - scene_mean;
                if d > threshold {
                    1
                } else if d < -threshold {
                    -1
                } else {
                    0
                }
            })
            .collect();

        let mut visited = vec![false; grid * grid];
        let mut detections = Vec::new();
        for start in 0..grid * grid {
            if visited[start] || signs[start] == 0 {
                continue;
            }
            let sign = signs[start];
            let mut stack = vec![start];
            visited[start] = true;
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (grid, grid, 0usize, 0usize);
            let mut cells = 0usize;
            let mut deviation = 0f32;

            while let Some(idx) = stack.pop() {
                let (cx, cy) = (idx % grid, idx / grid);
                min_x = min_x.min(cx);
                min_y = min_y.min(cy);
                max_x = max_x.max(cx);
                max_y = max_y.max(cy);
                cells += 1;
                deviation += (means[idx] - scene_mean).abs();

                let mut neighbours = Vec::with_capacity(4);
                if cx > 0 {
                    neighbours.push(idx - 1);
                }
                if cx + 1 < grid {
                    neighbours.push(idx + 1);
                }
                if cy > 0 {
                    neighbours.push(idx - grid);
                }
                if cy + 1 < grid {
                    neighbours.push(idx + grid);
                }
                for n in neighbours {
                    if !visited[n] && signs[n] == sign {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }

            if cells < self.min_cells {
                continue;
            }

            let confidence = (deviation / cells as f32 / (3.0 * scene_std)).min(1.0);
            let category = if sign > 0 { 0 } else { 1 };
            // the last row/column of cells absorbs the remainder up to the edge
            let right = if max_x + 1 == grid {
                width
            } else {
                ((max_x as u32 + 1) * cell_w).min(width)
            };
            let bottom = if max_y + 1 == grid {
                height
            } else {
                ((max_y as u32 + 1) * cell_h).min(height)
            };
            detections.push(RawDetection {
                bounding_box: RectF::new(
                    (min_x as u32 * cell_w) as f32,
                    (min_y as u32 * cell_h) as f32,
                    right as f32,
                    bottom as f32,
                ),
                scores: vec![(category, confidence)],
            });
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::crop::CropExtractor;
    use std::sync::{Arc, Mutex};

    struct ScriptedModel {
        outputs: Arc<Mutex<Vec<Result<Vec<RawDetection>, String>>>>,
    }

    impl InferenceModel for ScriptedModel {
        fn load(&mut self, _model_dir: &Path) -> Result<(), String> {
            Ok(())
        }

        fn infer(&mut self, _image: &RgbaImage) -> Result<Vec<RawDetection>, String> {
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                Ok(Vec::new())
            } else {
                outputs.remove(0)
            }
        }
    }

    fn model_dir_with_labels(labels: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LABEL_MAP_FILE), labels).unwrap();
        dir
    }

    fn scripted(dir: &Path, outputs: Vec<Result<Vec<RawDetection>, String>>) -> TrackingDetector {
        TrackingDetector::with_model(
            dir.to_path_buf(),
            Box::new(ScriptedModel {
                outputs: Arc::new(Mutex::new(outputs)),
            }),
        )
    }

    fn create_test_frame(width: u32, height: u32, frame_number: u64) -> CameraFrame {
        CameraFrame::new(
            width,
            height,
            Rotation::Deg0,
            vec![0u8; (width * height * 4) as usize],
            0,
            frame_number,
        )
        .unwrap()
    }

    fn raw(left: f32, top: f32, right: f32, bottom: f32, scores: Vec<(u32, f32)>) -> RawDetection {
        RawDetection {
            bounding_box: RectF::new(left, top, right, bottom),
            scores,
        }
    }

    #[test]
    fn test_initialize_requires_label_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = scripted(dir.path(), vec![]);
        assert!(matches!(
            detector.initialize(),
            Err(DetectorError::Initialization(_))
        ));
        assert!(!detector.is_ready());

        let empty = model_dir_with_labels("\n  \n");
        let mut detector = scripted(empty.path(), vec![]);
        assert!(detector.initialize().is_err());
    }

    #[test]
    fn test_detect_before_initialize_is_error() {
        let dir = model_dir_with_labels("plastic\n");
        let mut detector = scripted(dir.path(), vec![]);
        let frame = create_test_frame(32, 32, 1);
        assert_eq!(
            detector.detect_objects(&frame, Rotation::Deg0),
            Err(DetectorError::NotInitialized)
        );
    }

    #[test]
    fn test_labels_mapped_and_ordered() {
        let dir = model_dir_with_labels("plastic\npaper\nglass\nmetal\n");
        let mut detector = scripted(
            dir.path(),
            vec![Ok(vec![raw(
                0.0,
                0.0,
                16.0,
                16.0,
                vec![(1, 0.2), (0, 0.7), (2, 0.5), (3, 0.1)],
            )])],
        );
        detector.initialize().unwrap();

        let objects = detector
            .detect_objects(&create_test_frame(32, 32, 1), Rotation::Deg0)
            .unwrap();
        assert_eq!(objects.len(), 1);
        let texts: Vec<&str> = objects[0].labels.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["plastic", "glass", "paper"]);
        assert_eq!(objects[0].bounding_box, RectF::new(0.0, 0.0, 16.0, 16.0));
    }

    #[test]
    fn test_boxes_scaled_to_corrected_frame() {
        let dir = model_dir_with_labels("plastic\n");
        // 640x480 sensor at 90 degrees -> upright 480x640 -> model input 240x320
        let mut detector = scripted(
            dir.path(),
            vec![Ok(vec![raw(24.0, 32.0, 120.0, 160.0, vec![(0, 0.9)])])],
        );
        detector.initialize().unwrap();

        let objects = detector
            .detect_objects(&create_test_frame(640, 480, 1), Rotation::Deg90)
            .unwrap();
        assert_eq!(objects[0].bounding_box, RectF::new(48.0, 64.0, 240.0, 320.0));
    }

    #[test]
    fn test_upside_down_boxes_in_sensor_orientation() {
        let dir = model_dir_with_labels("plastic\n");
        let mut detector = scripted(
            dir.path(),
            vec![Ok(vec![raw(10.0, 20.0, 50.0, 60.0, vec![(0, 0.9)])])],
        );
        detector.initialize().unwrap();

        let objects = detector
            .detect_objects(&create_test_frame(200, 100, 1), Rotation::Deg180)
            .unwrap();
        assert_eq!(objects[0].bounding_box, RectF::new(150.0, 40.0, 190.0, 80.0));
    }

    #[test]
    fn test_crop_lands_on_detected_object_for_every_rotation() {
        let dir = model_dir_with_labels("bright\ndark\n");
        let bright_pixels = |image: &RgbaImage| image.pixels().filter(|p| p.0[0] > 200).count();

        // bright 60x30 patch at the sensor's top-left corner
        let mut sensor = RgbaImage::from_pixel(160, 120, image::Rgba([0, 0, 0, 255]));
        for y in 0..30 {
            for x in 0..60 {
                sensor.put_pixel(x, y, image::Rgba([255, 255, 255, 255]));
            }
        }
        let total = bright_pixels(&sensor);

        for rotation in [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270] {
            let mut detector = TrackingDetector::new(dir.path().to_path_buf());
            detector.initialize().unwrap();
            let frame = CameraFrame::new(160, 120, rotation, sensor.as_raw().clone(), 0, 1).unwrap();

            let objects = detector.detect_objects(&frame, rotation).unwrap();
            assert_eq!(objects.len(), 1, "rotation {:?}", rotation);

            let (frame_width, frame_height) = frame.corrected_dims();
            let crop = CropExtractor::default()
                .extract(&sensor, &objects[0].bounding_box, frame_width, frame_height, rotation)
                .unwrap();
            let inside = bright_pixels(&crop.image);
            assert!(
                inside * 10 >= total * 9,
                "rotation {:?}: {} of {} bright pixels in {:?}",
                rotation,
                inside,
                total,
                crop.source_rect
            );
            assert!(crop.source_rect.x < 40 && crop.source_rect.y < 30);
        }
    }

    #[test]
    fn test_tracking_ids_persist() {
        let dir = model_dir_with_labels("plastic\n");
        let mut detector = scripted(
            dir.path(),
            vec![
                Ok(vec![raw(0.0, 0.0, 10.0, 10.0, vec![(0, 0.9)])]),
                Ok(vec![
                    raw(20.0, 20.0, 30.0, 30.0, vec![(0, 0.8)]),
                    raw(1.0, 1.0, 11.0, 11.0, vec![(0, 0.9)]),
                ]),
            ],
        );
        detector.initialize().unwrap();

        let first = detector
            .detect_objects(&create_test_frame(32, 32, 1), Rotation::Deg0)
            .unwrap();
        let second = detector
            .detect_objects(&create_test_frame(32, 32, 2), Rotation::Deg0)
            .unwrap();

        let first_id = first[0].tracking_id;
        let moved = second
            .iter()
            .find(|o| o.bounding_box.left == 1.0)
            .unwrap();
        let fresh = second
            .iter()
            .find(|o| o.bounding_box.left == 20.0)
            .unwrap();
        assert_eq!(moved.tracking_id, first_id);
        assert_ne!(fresh.tracking_id, first_id);
    }

    #[test]
    fn test_inference_failure_yields_empty() {
        let dir = model_dir_with_labels("plastic\n");
        let mut detector = scripted(dir.path(), vec![Err("delegate crashed".to_string())]);
        detector.initialize().unwrap();

        let objects = detector
            .detect_objects(&create_test_frame(32, 32, 1), Rotation::Deg0)
            .unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn test_low_confidence_filtered_and_capped() {
        let dir = model_dir_with_labels("plastic\n");
        let mut detector = scripted(
            dir.path(),
            vec![Ok(vec![
                raw(0.0, 0.0, 4.0, 4.0, vec![(0, 0.1)]),
                raw(4.0, 4.0, 8.0, 8.0, vec![(0, 0.6)]),
                raw(8.0, 8.0, 12.0, 12.0, vec![(0, 0.9)]),
            ])],
        )
        .with_max_objects(1);
        detector.initialize().unwrap();

        let objects = detector
            .detect_objects(&create_test_frame(32, 32, 1), Rotation::Deg0)
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].labels[0].confidence, 0.9);
    }

    #[test]
    fn test_stop_idempotent_and_restartable() {
        let dir = model_dir_with_labels("plastic\n");
        let mut detector = scripted(dir.path(), vec![]);
        detector.stop();
        detector.initialize().unwrap();
        detector.stop();
        detector.stop();
        assert!(!detector.is_ready());
        detector.initialize().unwrap();
        assert!(detector.is_ready());
    }

    #[test]
    fn test_contrast_blob_model_finds_square() {
        let mut image = RgbaImage::from_pixel(96, 96, image::Rgba([0, 0, 0, 255]));
        for y in 24..48 {
            for x in 24..48 {
                image.put_pixel(x, y, image::Rgba([255, 255, 255, 255]));
            }
        }

        let detections = ContrastBlobModel::new().infer(&image).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bounding_box, RectF::new(24.0, 24.0, 48.0, 48.0));
        assert_eq!(detections[0].scores[0].0, 0);
    }

    #[test]
    fn test_contrast_blob_model_flat_scene() {
        let image = RgbaImage::from_pixel(96, 96, image::Rgba([90, 90, 90, 255]));
        assert!(ContrastBlobModel::new().infer(&image).unwrap().is_empty());
    }
}
