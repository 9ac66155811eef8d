/// 多路检测 (Detection Stage)
///
/// 订阅所有摄像头的快照通道, 在多路输入上非阻塞地等待,
/// 每个周期对有新帧的摄像头做检测, 发布标注帧与人员裁剪图.
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sentinel_reid::detection::{load_detector, CameraInput, DetectionStage, InferenceParams};
use sentinel_reid::messages::FrameMessage;
use sentinel_reid::transport::{subscribe, PubEndpoint};
use sentinel_reid::{logging, PipelineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "多路检测 - 多摄像头目标检测与裁剪", long_about = None)]
struct Args {
    /// 流水线配置文件
    #[arg(short, long, default_value = "conf/pipeline.yaml")]
    config: String,

    /// 只订阅这些摄像头 (默认全部)
    #[arg(long)]
    camera: Vec<String>,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = PipelineConfig::load(&args.config)?;
    let det = &config.detection;

    let feeds = if args.camera.is_empty() {
        config.cameras.clone()
    } else {
        args.camera
            .iter()
            .map(|id| config.camera(id).cloned())
            .collect::<Result<Vec<_>, _>>()?
    };

    info!("🚀 检测阶段启动: {} 路摄像头", feeds.len());
    info!("📦 检测模型: {}", det.model_path.display());
    info!("📐 推理缩放: 1/{}", det.scale_factor);

    // ========== 输入: 每路摄像头一个订阅 ==========
    let mut subscriptions = Vec::with_capacity(feeds.len());
    let mut inputs = Vec::with_capacity(feeds.len());
    for feed in &feeds {
        let sub = subscribe::<FrameMessage>(
            feed.publish_addr.as_str(),
            config.transport.queue_depth,
            &config.retry,
        )
        .with_context(|| format!("订阅摄像头 {} 失败", feed.id))?;
        inputs.push(CameraInput::new(feed.id.as_str(), sub.receiver().clone()));
        subscriptions.push(sub);
    }

    // ========== 输出: 标注帧 + 裁剪图 ==========
    let annotated = PubEndpoint::bind("annotated", det.annotated_addr.as_str(), config.transport.queue_depth)
        .with_context(|| format!("绑定标注帧地址失败: {}", det.annotated_addr))?;
    let crops = PubEndpoint::bind("crops", det.crops_addr.as_str(), config.transport.queue_depth)
        .with_context(|| format!("绑定裁剪图地址失败: {}", det.crops_addr))?;

    let detector = load_detector(det)?;
    let mut stage = DetectionStage::new(detector, InferenceParams::from(det), det.scale_factor, inputs)
        .with_retry(&config.retry);
    stage.run(&annotated, &crops, &config.retry)?;

    drop(subscriptions);
    Ok(())
}
