//! 피어 탐색
//!
//! DISCOVERY_REQUEST(브로드캐스트)에 DISCOVERY_RESPONSE(유니캐스트)로 답한다.
//! 요청자와 응답자 모두 사용자 이름과 함께 피어 목록에 기록된다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::mac::MacAddr;
use crate::packet::Packet;

/// 발견된 피어
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub mac: MacAddr,
    pub username: String,
    pub last_seen: Instant,
}

/// 발견된 피어 목록 (리스너와 애플리케이션이 공유)
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<MacAddr, DiscoveredPeer>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 피어 기록. 처음 보거나 이름이 바뀌었으면 true.
    pub fn record(&self, mac: MacAddr, username: &str) -> bool {
        let mut peers = self.peers.write();
        let now = Instant::now();

        match peers.get_mut(&mac) {
            Some(peer) => {
                peer.last_seen = now;
                if peer.username != username {
                    peer.username = username.to_string();
                    true
                } else {
                    false
                }
            }
            None => {
                peers.insert(
                    mac,
                    DiscoveredPeer {
                        mac,
                        username: username.to_string(),
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, mac: &MacAddr) -> Option<DiscoveredPeer> {
        self.peers.read().get(mac).cloned()
    }

    /// MAC 순으로 정렬된 목록
    pub fn list(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.mac);
        peers
    }

    /// `max_age`보다 오래 안 보인 피어 제거. 제거한 수 반환.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, p| p.last_seen.elapsed() <= max_age);
        before - peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

/// 탐색 요청 패킷
pub fn request(username: &str) -> Packet {
    Packet::DiscoveryRequest {
        username: username.to_string(),
    }
}

/// 탐색 응답 패킷
pub fn response(username: &str) -> Packet {
    Packet::DiscoveryResponse {
        username: username.to_string(),
    }
}
