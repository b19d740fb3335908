//! 노드: 전송 계층 + 송신자 + 리스너 묶음

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::ack::PendingAcks;
use crate::discovery::PeerDirectory;
use crate::event::EventReceiver;
use crate::mac::MacAddr;
use crate::receiver::{Dispatcher, Listener};
use crate::sender::Sender;
use crate::stats::ReceiveStats;
use crate::transport::{Inbound, Transport};
use crate::{Config, Result};

/// 실행 중인 Link-Chat 노드
pub struct Node {
    local: MacAddr,
    sender: Arc<Sender>,
    listener: Listener,
    peers: PeerDirectory,
}

impl Node {
    /// 리스너를 띄우고 이벤트 수신기를 돌려준다 (tokio 런타임 안에서 호출)
    pub fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        let local = transport.local_addr();
        let acks = Arc::new(PendingAcks::new());
        let peers = PeerDirectory::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            &config,
            transport.clone(),
            acks.clone(),
            peers.clone(),
            event_tx,
        );
        let listener = Listener::spawn(dispatcher, inbound);
        let sender = Arc::new(Sender::new(config, transport, acks));

        info!("Link-Chat node started: {}", local);

        let node = Self {
            local,
            sender,
            listener,
            peers,
        };
        Ok((node, event_rx))
    }

    pub fn local_addr(&self) -> MacAddr {
        self.local
    }

    /// 송신자 (백그라운드 전송을 위해 Arc로 공유)
    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    /// 발견된 피어 목록
    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// 수신 통계 스냅샷
    pub fn receive_stats(&self) -> ReceiveStats {
        self.listener.stats()
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    /// 리스너 정지. 최종 수신 통계를 돌려준다.
    pub async fn shutdown(self) -> Result<ReceiveStats> {
        self.listener.stop();
        let dispatcher = self.listener.join().await?;

        let stats = dispatcher.stats().clone();
        info!("Link-Chat node stopped: {}", self.local);
        info!("{}", stats.summary());
        Ok(stats)
    }
}
