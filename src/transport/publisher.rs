//! 发布端: 一个TCP监听口, 每个订阅者一个写线程

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::messages::{Envelope, WireMessage};

use super::codec::write_frame;
use super::{push_latest, TransportError};

type Body = Arc<Vec<u8>>;

struct Peer {
    addr: SocketAddr,
    tx: Sender<Body>,
    rx: Receiver<Body>,
    alive: Arc<AtomicBool>,
}

/// 单通道发布端点
pub struct PubEndpoint {
    name: String,
    local_addr: SocketAddr,
    peers: Arc<Mutex<Vec<Peer>>>,
    shutdown: Arc<AtomicBool>,
}

impl PubEndpoint {
    /// 绑定地址并开始接受订阅者; `queue_depth` 为每个订阅者的待发队列长度
    pub fn bind(
        name: impl Into<String>,
        addr: impl ToSocketAddrs,
        queue_depth: usize,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let peers: Arc<Mutex<Vec<Peer>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let name = name.clone();
            let peers = peers.clone();
            let shutdown = shutdown.clone();
            let depth = queue_depth.max(1);
            thread::Builder::new()
                .name(format!("pub-{}", name))
                .spawn(move || accept_loop(&name, listener, peers, shutdown, depth))?;
        }

        info!("📡 [{}] 发布端点已监听 {}", name, local_addr);
        Ok(Self {
            name,
            local_addr,
            peers,
            shutdown,
        })
    }

    /// 编码一次并分发给所有订阅者, 返回投递到的订阅者数量
    ///
    /// 没有订阅者时消息直接丢弃
    pub fn publish<M: WireMessage>(&self, message: M) -> Result<usize, TransportError> {
        let body: Body = Arc::new(Envelope::new(message.into_payload()).encode()?);
        if body.len() > super::MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge {
                size: body.len(),
                max: super::MAX_MESSAGE_SIZE,
            });
        }

        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|peer| {
            let keep = peer.alive.load(Ordering::Relaxed);
            if !keep {
                debug!("[{}] 移除已断开的订阅者 {}", self.name, peer.addr);
            }
            keep
        });

        let mut delivered = 0;
        for peer in peers.iter() {
            if push_latest(&peer.tx, &peer.rx, body.clone()) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.alive.load(Ordering::Relaxed))
            .count()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for PubEndpoint {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        // 唤醒阻塞在 accept 上的线程
        let _ = TcpStream::connect(self.local_addr);
    }
}

fn accept_loop(
    name: &str,
    listener: TcpListener,
    peers: Arc<Mutex<Vec<Peer>>>,
    shutdown: Arc<AtomicBool>,
    depth: usize,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("⚠️ [{}] 接受连接失败: {}", name, e);
                continue;
            }
        };
        let addr = match stream.peer_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!("⚠️ [{}] 读取对端地址失败: {}", name, e);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let (tx, rx) = bounded::<Body>(depth);
        let alive = Arc::new(AtomicBool::new(true));
        let spawned = {
            let rx = rx.clone();
            let alive = alive.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("pub-{}-{}", name, addr))
                .spawn(move || write_loop(&name, stream, rx, alive))
        };
        if let Err(e) = spawned {
            warn!("⚠️ [{}] 无法为订阅者 {} 创建写线程: {}", name, addr, e);
            continue;
        }

        info!("🔗 [{}] 订阅者已连接: {}", name, addr);
        peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Peer {
                addr,
                tx,
                rx,
                alive,
            });
    }
    debug!("[{}] 接受线程退出", name);
}

fn write_loop(name: &str, mut stream: TcpStream, rx: Receiver<Body>, alive: Arc<AtomicBool>) {
    for body in rx.iter() {
        if let Err(e) = write_frame(&mut stream, &body) {
            info!("🔌 [{}] 订阅者断开: {}", name, e);
            break;
        }
    }
    alive.store(false, Ordering::Relaxed);
}
