// 摄像头设备抽象
//
// A device is deployed with a validated model and then yields frames until the
// process is killed. `SyntheticCamera` stands in for real camera hardware: it
// renders a moving test pattern and produces detections shaped like the
// output of the model's post-processor.

use super::errors::{CaptureError, CaptureResult};
use common::model::{ColorFormat, ModelConfig, PostProcessor};
use serde_json::{json, Value};
use std::fs;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;

/// One captured frame with its inference results.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed 8-bit pixels, three channels in `color_format` order.
    pub image: Vec<u8>,
    pub color_format: ColorFormat,
    pub fps: f64,
    pub dps: f64,
    pub detections: Value,
    pub width: u32,
    pub height: u32,
}

pub trait CameraDevice {
    fn deploy(&mut self, model: &ModelConfig) -> CaptureResult<()>;

    /// Frames of the deployed model. The iterator does not end on its own.
    fn frames(&mut self) -> CaptureResult<Box<dyn Iterator<Item = CaptureResult<Frame>> + '_>>;
}

/// Smoothed events-per-second.
#[derive(Debug, Default)]
struct RateMeter {
    last: Option<Instant>,
    rate: f64,
}

impl RateMeter {
    fn tick(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.rate = if self.rate == 0.0 {
                    instant
                } else {
                    0.9 * self.rate + 0.1 * instant
                };
            }
        }
        self.last = Some(now);
        self.rate
    }
}

struct Deployment {
    post_processor: PostProcessor,
    color_format: ColorFormat,
    labels: Vec<String>,
}

/// 模拟摄像头
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    target_fps: u32,
    deployment: Option<Deployment>,
}

impl SyntheticCamera {
    /// `target_fps == 0` disables pacing.
    pub fn new(target_fps: u32) -> Self {
        Self::with_resolution(DEFAULT_WIDTH, DEFAULT_HEIGHT, target_fps)
    }

    pub fn with_resolution(width: u32, height: u32, target_fps: u32) -> Self {
        Self {
            width,
            height,
            target_fps,
            deployment: None,
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn deploy(&mut self, model: &ModelConfig) -> CaptureResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::DeployFailed {
                reason: format!("invalid resolution {}x{}", self.width, self.height),
            });
        }

        let labels = match &model.labels_file {
            Some(path) => fs::read_to_string(path)
                .map(|content| {
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|e| {
                    debug!("Labels file {:?} not readable: {}", path, e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        info!(
            "✓ Deployed model '{}' ({}, {}, {} labels)",
            model.name,
            model.post_processor,
            model.color_format,
            labels.len()
        );

        self.deployment = Some(Deployment {
            post_processor: model.post_processor,
            color_format: model.color_format,
            labels,
        });
        Ok(())
    }

    fn frames(&mut self) -> CaptureResult<Box<dyn Iterator<Item = CaptureResult<Frame>> + '_>> {
        let deployment = self.deployment.as_ref().ok_or(CaptureError::NotDeployed)?;
        let interval = if self.target_fps == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(1.0 / self.target_fps as f64))
        };

        Ok(Box::new(SyntheticFrames {
            width: self.width,
            height: self.height,
            interval,
            deployment,
            index: 0,
            next_deadline: None,
            capture_rate: RateMeter::default(),
            detect_rate: RateMeter::default(),
        }))
    }
}

struct SyntheticFrames<'a> {
    width: u32,
    height: u32,
    interval: Option<Duration>,
    deployment: &'a Deployment,
    index: u64,
    next_deadline: Option<Instant>,
    capture_rate: RateMeter,
    detect_rate: RateMeter,
}

impl SyntheticFrames<'_> {
    fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + interval);
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = (self.index * 4) as usize;
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let r = ((x + shift) * 255 / w.max(1)) as u8;
                let g = (y * 255 / h.max(1)) as u8;
                let b = if ((x + shift) / 32 + y / 32) % 2 == 0 { 200 } else { 60 };
                match self.deployment.color_format {
                    ColorFormat::Rgb => pixels.extend_from_slice(&[r, g, b]),
                    ColorFormat::Bgr => pixels.extend_from_slice(&[b, g, r]),
                }
            }
        }
        pixels
    }

    fn label(&self, i: usize) -> String {
        let labels = &self.deployment.labels;
        if labels.is_empty() {
            format!("class_{}", i)
        } else {
            labels[i % labels.len()].clone()
        }
    }

    fn detect(&self) -> Value {
        let (w, h) = (self.width as f64, self.height as f64);
        let phase = (self.index % 100) as f64 / 100.0;
        let pp = self.deployment.post_processor;

        if pp.is_object_detection() {
            let bw = w / 4.0;
            let bh = h / 3.0;
            let x = phase * (w - bw);
            let y = (h - bh) / 2.0;
            json!({
                "bboxes": [[x, y, x + bw, y + bh]],
                "class_ids": [0],
                "labels": [self.label(0)],
                "confidences": [0.9],
            })
        } else if pp.is_classification() {
            let top = (self.index / 30) as usize % 3;
            json!({
                "class_ids": [top],
                "labels": [self.label(top)],
                "confidences": [0.8],
            })
        } else if pp == PostProcessor::Posenet {
            let cx = phase * w;
            let keypoints: Vec<[f64; 3]> = (0..17)
                .map(|k| [cx, h * (k as f64 + 1.0) / 18.0, 0.7])
                .collect();
            json!({
                "poses": [{ "keypoints": keypoints, "score": 0.7 }],
            })
        } else {
            json!({
                "mask_width": self.width / 8,
                "mask_height": self.height / 8,
                "classes": [0, 1],
                "labels": [self.label(0), self.label(1)],
            })
        }
    }
}

impl Iterator for SyntheticFrames<'_> {
    type Item = CaptureResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pace();
        let image = self.render();
        let fps = self.capture_rate.tick(Instant::now());
        let detections = self.detect();
        let dps = self.detect_rate.tick(Instant::now());
        self.index += 1;

        Some(Ok(Frame {
            image,
            color_format: self.deployment.color_format,
            fps,
            dps,
            detections,
            width: self.width,
            height: self.height,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn model(post_processor: PostProcessor, color_format: ColorFormat) -> ModelConfig {
        ModelConfig {
            name: "mobilenet".to_string(),
            model_file: PathBuf::from("/models/mobilenet/network.rpk"),
            model_type: "rpk".to_string(),
            post_processor,
            color_format,
            preserve_aspect_ratio: true,
            labels_file: None,
        }
    }

    #[test]
    fn test_frames_require_deploy() {
        let mut camera = SyntheticCamera::new(0);
        assert!(matches!(camera.frames().err(), Some(CaptureError::NotDeployed)));
    }

    #[test]
    fn test_frames_match_resolution_and_format() {
        let mut camera = SyntheticCamera::with_resolution(16, 8, 0);
        camera.deploy(&model(PostProcessor::Cls, ColorFormat::Bgr)).unwrap();

        let frames: Vec<Frame> = camera
            .frames()
            .unwrap()
            .take(3)
            .collect::<CaptureResult<_>>()
            .unwrap();

        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame.image.len(), 16 * 8 * 3);
            assert_eq!(frame.color_format, ColorFormat::Bgr);
            assert_eq!((frame.width, frame.height), (16, 8));
            assert!(frame.detections.get("class_ids").is_some());
        }
        assert!(frames[2].fps >= 0.0);
    }

    #[test]
    fn test_detections_follow_post_processor_family() {
        let mut camera = SyntheticCamera::with_resolution(16, 8, 0);
        camera
            .deploy(&model(PostProcessor::OdEfficientdetLite0, ColorFormat::Rgb))
            .unwrap();
        let frame = camera.frames().unwrap().next().unwrap().unwrap();
        assert_eq!(frame.detections["bboxes"].as_array().unwrap().len(), 1);

        camera.deploy(&model(PostProcessor::Posenet, ColorFormat::Rgb)).unwrap();
        let frame = camera.frames().unwrap().next().unwrap().unwrap();
        assert_eq!(
            frame.detections["poses"][0]["keypoints"].as_array().unwrap().len(),
            17
        );

        camera.deploy(&model(PostProcessor::Segment, ColorFormat::Rgb)).unwrap();
        let frame = camera.frames().unwrap().next().unwrap().unwrap();
        assert_eq!(frame.detections["mask_width"], 2);
    }

    #[test]
    fn test_labels_file_names_detections() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.txt");
        fs::write(&labels, "person\nbicycle\n").unwrap();

        let mut config = model(PostProcessor::OdBcsn, ColorFormat::Rgb);
        config.labels_file = Some(labels);

        let mut camera = SyntheticCamera::with_resolution(16, 8, 0);
        camera.deploy(&config).unwrap();
        let frame = camera.frames().unwrap().next().unwrap().unwrap();
        assert_eq!(frame.detections["labels"][0], "person");
    }
}
