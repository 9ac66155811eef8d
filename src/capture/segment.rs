//! 录像分段 (Motion-JPEG)
//!
//! 每个分段是一串首尾相接的JPEG帧, 可以直接用 `ffplay -f mjpeg` 播放.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::debug;

use super::{SegmentFactory, SegmentSink};

pub const SEGMENT_EXT: &str = "mjpeg";

/// `<output_dir>/<camera>/<YYYY>/<MM>/<DD>/<camera>_output_<HHMMSS>.mjpeg`
pub fn segment_path(output_dir: &Path, camera_id: &str, started: DateTime<Local>) -> PathBuf {
    output_dir
        .join(camera_id)
        .join(started.format("%Y").to_string())
        .join(started.format("%m").to_string())
        .join(started.format("%d").to_string())
        .join(format!(
            "{}_output_{}.{}",
            camera_id,
            started.format("%H%M%S"),
            SEGMENT_EXT
        ))
}

pub struct MjpegSegmentFactory {
    output_dir: PathBuf,
    quality: u8,
}

impl MjpegSegmentFactory {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            quality: 85,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }
}

impl SegmentFactory for MjpegSegmentFactory {
    fn create(&mut self, camera_id: &str, started: DateTime<Local>) -> Result<Box<dyn SegmentSink>> {
        let base = segment_path(&self.output_dir, camera_id, started);
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建录像目录失败: {}", parent.display()))?;
        }

        // 同一秒内滚动两次时加序号
        let mut path = base.clone();
        let mut n = 1;
        while path.exists() {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            path = base.with_file_name(format!("{}-{}.{}", stem, n, SEGMENT_EXT));
            n += 1;
        }

        let file = File::create(&path)
            .with_context(|| format!("创建录像文件失败: {}", path.display()))?;
        debug!("🎞️ 新录像分段: {}", path.display());
        Ok(Box::new(MjpegSegment {
            path,
            writer: BufWriter::new(file),
            quality: self.quality,
            frames: 0,
        }))
    }
}

pub struct MjpegSegment {
    path: PathBuf,
    writer: BufWriter<File>,
    quality: u8,
    frames: u64,
}

impl MjpegSegment {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl SegmentSink for MjpegSegment {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        let encoder = JpegEncoder::new_with_quality(&mut self.writer, self.quality);
        frame
            .write_with_encoder(encoder)
            .with_context(|| format!("写入录像帧失败: {}", self.path.display()))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        self.writer
            .flush()
            .with_context(|| format!("录像落盘失败: {}", self.path.display()))?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::Rgb;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 7, h, m, s).unwrap()
    }

    #[test]
    fn test_segment_path_layout() {
        let p = segment_path(Path::new("rec"), "lobby", at(9, 5, 2));
        assert_eq!(p, PathBuf::from("rec/lobby/2024/03/07/lobby_output_090502.mjpeg"));
    }

    #[test]
    fn test_segment_writes_concatenated_jpegs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut factory = MjpegSegmentFactory::new(tmp.path());
        let mut sink = factory.create("lobby", at(10, 0, 0)).unwrap();

        sink.write(&RgbImage::from_pixel(16, 8, Rgb([200, 10, 10]))).unwrap();
        sink.write(&RgbImage::from_pixel(16, 8, Rgb([10, 200, 10]))).unwrap();
        let path = sink.finish().unwrap();

        assert!(path.starts_with(tmp.path().join("lobby/2024/03/07")));
        let bytes = fs::read(&path).unwrap();
        let soi = bytes.windows(3).filter(|w| w == &[0xFF, 0xD8, 0xFF]).count();
        assert_eq!(soi, 2);

        let first = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(first.dimensions(), (16, 8));
        assert!(first.get_pixel(8, 4).0[0] > 150);
    }

    #[test]
    fn test_same_second_rollover_gets_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut factory = MjpegSegmentFactory::new(tmp.path());
        let a = factory.create("hall", at(11, 0, 0)).unwrap().finish().unwrap();
        let b = factory.create("hall", at(11, 0, 0)).unwrap().finish().unwrap();
        assert_ne!(a, b);
        assert!(b
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_output_110000-1.mjpeg"));
    }
}
