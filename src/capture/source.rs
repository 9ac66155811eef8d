//! 视频源
//!
//! - [`ImageDirSource`]: 图片目录回放 (无本地依赖, 用于联调和测试)
//! - `FfmpegSource`: RTSP / 文件 / 摄像头实时解码 (需要 `ffmpeg` 特性)

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use tracing::info;

use super::VideoSource;
use crate::config::CameraFeed;

const IMAGE_EXTS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 按文件名顺序回放一个目录下的图片, 播完返回 `None`
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    pacing: Option<Duration>,
    last_read: Option<Instant>,
}

impl ImageDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            next: 0,
            pacing: None,
            last_read: None,
        }
    }

    /// 按固定间隔出帧, 模拟实时视频流
    pub fn with_pacing(mut self, interval: Duration) -> Self {
        self.pacing = Some(interval);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

impl VideoSource for ImageDirSource {
    fn open(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("打开图片目录失败: {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("目录中没有图片: {}", self.dir.display());
        }
        files.sort();

        info!("📂 图片回放: {} ({} 帧)", self.dir.display(), files.len());
        self.files = files;
        self.next = 0;
        self.last_read = None;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        if let (Some(interval), Some(last)) = (self.pacing, self.last_read) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }

        let image = image::open(path)
            .with_context(|| format!("读取图片失败: {}", path.display()))?
            .to_rgb8();
        self.next += 1;
        self.last_read = Some(Instant::now());
        Ok(Some(image))
    }

    fn close(&mut self) {
        self.files.clear();
        self.next = 0;
    }
}

/// 按摄像头配置打开视频源: 本地目录走图片回放, 其余交给FFmpeg
pub fn open_source(feed: &CameraFeed) -> Result<Box<dyn VideoSource>> {
    if Path::new(&feed.url).is_dir() {
        let interval = Duration::from_secs_f64(1.0 / feed.output_fps);
        return Ok(Box::new(ImageDirSource::new(&feed.url).with_pacing(interval)));
    }

    #[cfg(feature = "ffmpeg")]
    {
        Ok(Box::new(FfmpegSource::new(&feed.url)))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        bail!(
            "摄像头 {}: 视频源 {} 需要 ffmpeg 特性 (cargo build --features ffmpeg)",
            feed.id,
            feed.url
        )
    }
}

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;

#[cfg(feature = "ffmpeg")]
mod ffmpeg {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::{bail, Result};
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
    use ez_ffmpeg::core::context::null_output::create_null_output;
    use ez_ffmpeg::filter::frame_filter::FrameFilter;
    use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
    use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
    use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
    use image::RgbImage;
    use tracing::{info, warn};

    use super::VideoSource;
    use crate::transport::push_latest;

    /// 解码线程 → 读取端的队列深度 (只保留最新的几帧)
    const FRAME_QUEUE: usize = 2;

    /// FFmpeg 拉流解码, 解码在后台线程, `read` 取最新帧
    pub struct FfmpegSource {
        url: String,
        read_timeout: Duration,
        rx: Option<Receiver<RgbImage>>,
        stop: Arc<AtomicBool>,
    }

    impl FfmpegSource {
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                read_timeout: Duration::from_secs(10),
                rx: None,
                stop: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
            self.read_timeout = timeout;
            self
        }
    }

    impl VideoSource for FfmpegSource {
        fn open(&mut self) -> Result<()> {
            self.close();
            let (tx, rx) = bounded(FRAME_QUEUE);
            let stop = Arc::new(AtomicBool::new(false));
            let filter = RgbFrameFilter {
                tx,
                drain: rx.clone(),
                stop: stop.clone(),
            };

            let url = self.url.clone();
            thread::Builder::new()
                .name("ffmpeg-decode".into())
                .spawn(move || {
                    if let Err(e) = decode(&url, filter) {
                        warn!("⚠️ 解码结束: {}", e);
                    }
                })?;

            info!("📹 拉流: {}", self.url);
            self.rx = Some(rx);
            self.stop = stop;
            Ok(())
        }

        fn read(&mut self) -> Result<Option<RgbImage>> {
            let Some(rx) = &self.rx else {
                bail!("视频源未打开");
            };
            match rx.recv_timeout(self.read_timeout) {
                Ok(frame) => Ok(Some(frame)),
                Err(RecvTimeoutError::Timeout) => {
                    bail!("{:?} 内没有收到新帧: {}", self.read_timeout, self.url)
                }
                Err(RecvTimeoutError::Disconnected) => Ok(None),
            }
        }

        fn close(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            self.rx = None;
        }
    }

    impl Drop for FfmpegSource {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn decode(url: &str, filter: RgbFrameFilter) -> Result<()> {
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("rgb", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let mut input = Input::new(url);
        if url.starts_with("rtsp://") {
            input = input.set_input_opts(
                [
                    ("rtsp_transport", "tcp"),
                    ("buffer_size", "67108864"),
                    ("rtsp_flags", "prefer_tcp"),
                ]
                .into(),
            );
        }

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_descs(["format=yuv420p"].into())
            .output(out)
            .build()
            .map_err(|e| anyhow::anyhow!("构建解码器失败: {}", e))?;
        let sch = ctx
            .start()
            .map_err(|e| anyhow::anyhow!("启动解码器失败: {}", e))?;
        sch.wait().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(())
    }

    /// 解码帧 (YUV420P) → RGB8, 推入有界队列 (满时丢最旧的)
    struct RgbFrameFilter {
        tx: Sender<RgbImage>,
        drain: Receiver<RgbImage>,
        stop: Arc<AtomicBool>,
    }

    impl FrameFilter for RgbFrameFilter {
        fn media_type(&self) -> AVMediaType {
            AVMediaType::AVMEDIA_TYPE_VIDEO
        }

        fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
            info!("✅ 解码线程启动");
            Ok(())
        }

        fn filter_frame(
            &mut self,
            frame: Frame,
            _ctx: &FrameFilterContext,
        ) -> Result<Option<Frame>, String> {
            if self.stop.load(Ordering::Relaxed) {
                return Err("视频源已关闭".to_string());
            }
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return Ok(None);
            }

            let Some(rgb) = (unsafe { yuv420p_to_rgb(&frame) }) else {
                return Ok(None);
            };
            if !push_latest(&self.tx, &self.drain, rgb) {
                return Err("读取端已断开".to_string());
            }
            Ok(Some(frame))
        }
    }

    /// 读取YUV420P三个平面并转换为RGB, 步长或指针异常时返回 `None`
    unsafe fn yuv420p_to_rgb(frame: &Frame) -> Option<RgbImage> {
        let raw = &*frame.as_ptr();
        let (w, h) = (raw.width as usize, raw.height as usize);
        if w == 0 || h == 0 {
            return None;
        }

        let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
        let y_stride = raw.linesize[0] as usize;
        let uv_stride = raw.linesize[1] as usize;
        if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
            return None;
        }
        if y_stride < w || uv_stride < w.div_ceil(2) {
            return None;
        }

        let mut buffer = vec![0u8; w * h * 3];
        for (y, row) in buffer.chunks_exact_mut(w * 3).enumerate() {
            let y_row = y * y_stride;
            let uv_row = (y >> 1) * uv_stride;
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let luma = *y_plane.add(y_row + x) as i32;
                let u = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
                let v = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

                px[0] = (luma + ((v * 179) >> 7)).clamp(0, 255) as u8;
                px[1] = (luma - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
                px[2] = (luma + ((u * 227) >> 7)).clamp(0, 255) as u8;
            }
        }
        RgbImage::from_raw(w as u32, h as u32, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_frames(dir: &Path, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            RgbImage::from_pixel(8, 6, Rgb([i as u8 * 50, 0, 0]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    #[test]
    fn test_image_dir_replays_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_frames(tmp.path(), &["b.png", "a.png", "c.png"]);
        std::fs::write(tmp.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageDirSource::new(tmp.path());
        source.open().unwrap();
        assert_eq!(source.len(), 3);

        // a.png 是第二个写入的 (红色 50)
        let first = source.read().unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0).0[0], 50);
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());

        // 重新打开从头开始
        source.open().unwrap();
        assert!(source.read().unwrap().is_some());
    }

    #[test]
    fn test_empty_dir_fails_to_open() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ImageDirSource::new(tmp.path()).open().is_err());
        assert!(ImageDirSource::new(tmp.path().join("missing")).open().is_err());
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_stream_url_needs_ffmpeg() {
        let feed = CameraFeed {
            id: "lobby".into(),
            url: "rtsp://10.0.0.21/stream1".into(),
            output_fps: 15.0,
            segment_seconds: 60.0,
            output_resolution: (1280, 720),
            recording_enabled: true,
            output_dir: PathBuf::from("recordings"),
            publish_hz: 1.0,
            publish_addr: "127.0.0.1:0".into(),
        };
        assert!(open_source(&feed).is_err());
    }
}
