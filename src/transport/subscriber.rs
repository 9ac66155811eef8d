//! 订阅端: 后台读线程 + 自动重连

use std::io::{self, ErrorKind, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::messages::WireMessage;
use crate::retry::{RetryConfig, RetryPolicy};

use super::codec::read_message;
use super::{push_latest, TransportError};

// 读超时只用于检查停止标志, 不代表连接异常
const STOP_POLL: Duration = Duration::from_millis(200);

/// 一个通道的订阅; 丢弃时停止后台读线程
pub struct Subscription<M> {
    addr: String,
    rx: Receiver<M>,
    stop: Arc<AtomicBool>,
}

impl<M> Subscription<M> {
    pub fn receiver(&self) -> &Receiver<M> {
        &self.rx
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// 连接发布端并持续接收 `M` 类型的消息
///
/// 本地队列最多保留 `queue_depth` 条, 满时丢最旧的. 连接失败或断开后按
/// `retry` 退避重连, 永不放弃.
pub fn subscribe<M: WireMessage>(
    addr: impl Into<String>,
    queue_depth: usize,
    retry: &RetryConfig,
) -> Result<Subscription<M>, TransportError> {
    let addr = addr.into();
    let (tx, rx) = bounded::<M>(queue_depth.max(1));
    let stop = Arc::new(AtomicBool::new(false));

    {
        let addr = addr.clone();
        let rx = rx.clone();
        let stop = stop.clone();
        let policy = RetryPolicy::new(format!("sub {}", addr), retry);
        thread::Builder::new()
            .name(format!("sub-{}-{}", M::KIND, addr))
            .spawn(move || read_loop(&addr, tx, rx, stop, policy))?;
    }

    Ok(Subscription {
        addr,
        rx,
        stop,
    })
}

fn read_loop<M: WireMessage>(
    addr: &str,
    tx: Sender<M>,
    rx: Receiver<M>,
    stop: Arc<AtomicBool>,
    mut policy: RetryPolicy,
) {
    while !stop.load(Ordering::Relaxed) {
        let stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                let delay = policy.record_failure();
                debug!("[{}] 连接 {} 失败: {}, {:?} 后重试", M::KIND, addr, e, delay);
                sleep_unless_stopped(&stop, delay);
                continue;
            }
        };
        if let Err(e) = stream.set_read_timeout(Some(STOP_POLL)) {
            warn!("⚠️ [{}] 设置读超时失败: {}", addr, e);
        }
        policy.record_success();
        info!("🔗 已订阅 {} ({})", addr, M::KIND);

        let mut reader = StopAwareReader {
            stream,
            stop: &stop,
        };
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match read_message(&mut reader) {
                Ok(Some(envelope)) => {
                    let kind = envelope.payload.kind();
                    match M::from_payload(envelope.payload) {
                        Some(message) => {
                            push_latest(&tx, &rx, message);
                        }
                        None => warn!("⚠️ [{}] 忽略错误类型的消息: {}", addr, kind),
                    }
                }
                Ok(None) => {
                    info!("🔌 发布端 {} 已关闭连接", addr);
                    break;
                }
                // 帧边界完好, 只丢这一条
                Err(TransportError::Message(e)) => warn!("⚠️ [{}] 丢弃无法解析的消息: {}", addr, e),
                Err(_) if stop.load(Ordering::Relaxed) => {
                    debug!("[{}] 订阅已取消", addr);
                    return;
                }
                Err(e) => {
                    warn!("⚠️ [{}] 读取失败: {}", addr, e);
                    break;
                }
            }
        }

        let delay = policy.record_failure();
        info!("🔄 {:?} 后重连 {}", delay, addr);
        sleep_unless_stopped(&stop, delay);
    }
}

/// 读超时后继续等待, 直到有数据或停止标志被置位
///
/// 超时发生在一条消息中间时不会丢掉已读的字节, 帧边界保持完好.
struct StopAwareReader<'a> {
    stream: TcpStream,
    stop: &'a AtomicBool,
}

impl Read for StopAwareReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return Err(io::Error::other("订阅已停止"));
                    }
                }
                other => return other,
            }
        }
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, delay: Duration) {
    let step = Duration::from_millis(50);
    let mut left = delay;
    while !left.is_zero() && !stop.load(Ordering::Relaxed) {
        let nap = left.min(step);
        thread::sleep(nap);
        left -= nap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{FrameMessage, Image, TrackMessage};
    use crate::transport::PubEndpoint;
    use std::time::Instant;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_ms: 20,
            max_ms: 100,
            multiplier: 2.0,
            failing_after: 100,
        }
    }

    fn wait_for_subscriber(endpoint: &PubEndpoint) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while endpoint.subscriber_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(endpoint.subscriber_count(), 1);
    }

    #[test]
    fn test_loopback_delivers_messages() {
        let endpoint = PubEndpoint::bind("frames", "127.0.0.1:0", 4).unwrap();
        let sub: Subscription<FrameMessage> =
            subscribe(endpoint.local_addr().to_string(), 4, &fast_retry()).unwrap();
        wait_for_subscriber(&endpoint);

        let frame = FrameMessage {
            camera_id: "lobby".into(),
            image: Image {
                width: 1,
                height: 1,
                channels: 3,
                data: vec![1, 2, 3],
            },
            timestamp: 3.5,
        };
        endpoint.publish(frame.clone()).unwrap();

        let got = sub.receiver().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, frame);
    }

    #[test]
    fn test_subscriber_connects_after_publisher_starts_late() {
        // 先占一个空闲端口再释放, 订阅端会一直重试直到发布端出现
        let addr = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };
        let sub: Subscription<TrackMessage> = subscribe(addr.to_string(), 2, &fast_retry()).unwrap();
        thread::sleep(Duration::from_millis(60));

        let endpoint = PubEndpoint::bind("tracks", addr, 2).unwrap();
        wait_for_subscriber(&endpoint);

        let msg = TrackMessage {
            timestamp: 9.0,
            ..Default::default()
        };
        endpoint.publish(msg.clone()).unwrap();
        assert_eq!(
            sub.receiver().recv_timeout(Duration::from_secs(5)).unwrap(),
            msg
        );
    }

    #[test]
    fn test_drop_closes_idle_connection() {
        let endpoint = PubEndpoint::bind("frames", "127.0.0.1:0", 2).unwrap();
        let sub: Subscription<TrackMessage> =
            subscribe(endpoint.local_addr().to_string(), 2, &fast_retry()).unwrap();
        wait_for_subscriber(&endpoint);

        // 连接上没有任何数据时丢弃订阅, 读线程也要退出并关闭连接
        drop(sub);
        let deadline = Instant::now() + Duration::from_secs(5);
        while endpoint.subscriber_count() > 0 && Instant::now() < deadline {
            let _ = endpoint.publish(TrackMessage::default());
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(endpoint.subscriber_count(), 0);
    }

    #[test]
    fn test_slow_sender_does_not_split_messages() {
        use crate::messages::Envelope;
        use crate::transport::codec::write_message;
        use std::io::Write;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sub: Subscription<TrackMessage> = subscribe(addr.to_string(), 2, &fast_retry()).unwrap();
        let (mut conn, _) = listener.accept().unwrap();

        let msg = TrackMessage {
            timestamp: 4.0,
            ..Default::default()
        };
        let mut bytes = Vec::new();
        write_message(&mut bytes, &Envelope::new(msg.clone().into_payload())).unwrap();

        // 两半之间的停顿超过读超时
        let (head, tail) = bytes.split_at(3);
        conn.write_all(head).unwrap();
        thread::sleep(STOP_POLL * 2);
        conn.write_all(tail).unwrap();

        assert_eq!(
            sub.receiver().recv_timeout(Duration::from_secs(5)).unwrap(),
            msg
        );
    }
}
