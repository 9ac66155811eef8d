/// 身份解析 (Identity Resolver)
///
/// 1. 启动时加载图库 (known / unknown)
/// 2. 订阅裁剪图, 逐张提取特征并匹配/新建/更新身份
/// 3. 发布每路摄像头本周期出现的身份, 以及跨摄像头关联
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sentinel_reid::messages::CropBatch;
use sentinel_reid::reid::{load_extractor, Gallery, IdentityResolver, ResolverStage, Thresholds};
use sentinel_reid::transport::{subscribe, PubEndpoint};
use sentinel_reid::{logging, PipelineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "身份解析 - 人员重识别与跨摄像头关联", long_about = None)]
struct Args {
    /// 流水线配置文件
    #[arg(short, long, default_value = "conf/pipeline.yaml")]
    config: String,

    /// 日志详细程度 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = PipelineConfig::load(&args.config)?;
    let rc = &config.resolver;

    info!("🚀 身份解析启动");
    info!("📦 特征模型: {}", rc.model_path.display());
    info!(
        "🎚️ 阈值: known > {} | unknown >= {} | no_update {}",
        rc.known_threshold, rc.unknown_threshold, rc.no_update_threshold
    );

    let gallery = Gallery::load(&rc.dataset_dir, rc.image_ext.as_str())
        .with_context(|| format!("加载图库失败: {}", rc.dataset_dir.display()))?;
    let resolver = IdentityResolver::new(gallery, Thresholds::from(rc), rc.stream_threshold)
        .with_retry(&config.retry);
    let extractor = load_extractor(rc)?;

    let crops = subscribe::<CropBatch>(rc.crops_addr.as_str(), config.transport.queue_depth, &config.retry)
        .with_context(|| format!("订阅裁剪图失败: {}", rc.crops_addr))?;
    let tracks = PubEndpoint::bind("tracks", rc.tracks_addr.as_str(), config.transport.queue_depth)
        .with_context(|| format!("绑定轨迹地址失败: {}", rc.tracks_addr))?;

    let mut stage = ResolverStage::new(resolver, extractor, crops.receiver().clone());
    stage.run(&tracks, &config.retry)
}
