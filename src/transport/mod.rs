//! 发布/订阅传输 (TCP + 长度前缀CBOR)
//!
//! - 每个输出通道一个 [`PubEndpoint`], 所有订阅者收到全部消息, 无主题过滤
//! - 尽力而为: 订阅者连接之前发布的消息直接丢弃, 慢订阅者丢最旧的消息
//! - 订阅端 [`subscribe`] 断线后自动重连, 消息经有界 crossbeam 通道交给阶段主循环

pub mod codec;
pub mod publisher;
pub mod subscriber;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::messages::{MessageError, WireMessage};

pub use codec::{read_message, write_message, MAX_MESSAGE_SIZE};
pub use publisher::PubEndpoint;
pub use subscriber::{subscribe, Subscription};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("网络IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("消息过大: {size} > {max}")]
    TooLarge { size: usize, max: usize },
    #[error("通道已关闭")]
    Closed,
}

/// 阶段输出口: 生产环境是 [`PubEndpoint`], 测试里是 crossbeam 通道
pub trait Outbox<M: WireMessage> {
    fn send(&self, message: M) -> Result<(), TransportError>;
}

impl<M: WireMessage> Outbox<M> for PubEndpoint {
    fn send(&self, message: M) -> Result<(), TransportError> {
        self.publish(message).map(|_| ())
    }
}

impl<M: WireMessage> Outbox<M> for Sender<M> {
    fn send(&self, message: M) -> Result<(), TransportError> {
        Sender::send(self, message).map_err(|_| TransportError::Closed)
    }
}

/// 有界队列写入, 满时丢弃最旧的一条 (最新优先)
///
/// 返回 `false` 表示通道已断开
pub(crate) fn push_latest<T>(tx: &Sender<T>, rx: &Receiver<T>, mut item: T) -> bool {
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                let _ = rx.try_recv();
                item = back;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}
