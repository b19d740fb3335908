//! ACK 대기 테이블
//!
//! 송신 태스크가 조각을 보내기 직전에 `(피어, seq)`를 등록하고,
//! 리스너가 FILE_ACK / FILE_NACK를 받으면 결과를 채운다.

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::chunk::SeqNum;
use crate::mac::MacAddr;

/// 조각 하나에 대한 상대방의 판정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack,
}

/// 대기 항목 키
pub type AckKey = (MacAddr, SeqNum);

/// 대기 중인 ACK 테이블
#[derive(Debug, Default)]
pub struct PendingAcks {
    entries: DashMap<AckKey, oneshot::Sender<AckOutcome>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 전송 시도 직전에 등록. 같은 키의 이전 대기자는 대체된다.
    pub fn register(&self, peer: MacAddr, seq: SeqNum) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert((peer, seq), tx);
        rx
    }

    /// 수신한 ACK/NACK 반영
    ///
    /// 브로드캐스트로 보낸 조각은 어느 피어의 응답으로도 해소된다.
    /// 대기 항목이 없으면(오래됐거나 다른 전송의 응답) 아무것도 하지 않고 false.
    pub fn resolve(&self, from: MacAddr, seq: SeqNum, outcome: AckOutcome) -> bool {
        let entry = self
            .entries
            .remove(&(from, seq))
            .or_else(|| self.entries.remove(&(MacAddr::BROADCAST, seq)));

        match entry {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// 포기한 조각 정리
    pub fn forget(&self, peer: MacAddr, seq: SeqNum) {
        self.entries.remove(&(peer, seq));
    }

    pub fn is_pending(&self, peer: MacAddr, seq: SeqNum) -> bool {
        self.entries.contains_key(&(peer, seq))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
