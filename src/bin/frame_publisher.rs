/// 采集发布 (Frame Publisher)
///
/// 每路摄像头一个进程:
/// 1. 拉流解码 (断线按退避重连)
/// 2. 按 output_fps 录像分段落盘
/// 3. 按 publish_hz 发布原始分辨率快照
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sentinel_reid::capture::{open_source, FramePublisher, MjpegSegmentFactory, SystemClock};
use sentinel_reid::transport::PubEndpoint;
use sentinel_reid::{logging, PipelineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "采集发布 - 单路摄像头录像与快照发布", long_about = None)]
struct Args {
    /// 流水线配置文件
    #[arg(short, long, default_value = "conf/pipeline.yaml")]
    config: String,

    /// 摄像头ID (对应配置中的 cameras[].id)
    #[arg(long)]
    camera: String,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = PipelineConfig::load(&args.config)?;
    let feed = config.camera(&args.camera)?.clone();

    info!("🚀 采集发布启动: 摄像头 {}", feed.id);
    info!("📹 视频源: {}", feed.url);
    if feed.recording_enabled {
        info!(
            "💾 录像: {} ({}x{} @ {}fps, 每段 {} 帧)",
            feed.output_dir.display(),
            feed.output_resolution.0,
            feed.output_resolution.1,
            feed.output_fps,
            feed.frames_per_segment()
        );
    }

    let endpoint = PubEndpoint::bind(
        format!("frames:{}", feed.id),
        feed.publish_addr.as_str(),
        config.transport.queue_depth,
    )
    .with_context(|| format!("绑定发布地址失败: {}", feed.publish_addr))?;

    let source = open_source(&feed)?;
    let segments = MjpegSegmentFactory::new(&feed.output_dir);
    let mut publisher = FramePublisher::new(
        feed,
        source,
        Box::new(segments),
        Box::new(endpoint),
        Box::new(SystemClock::new()),
        config.retry.clone(),
    );
    publisher.run()
}
