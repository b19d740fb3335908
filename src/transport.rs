//! 프레임 전송 계층 경계
//!
//! 코어는 `Transport` 트레이트로 프레임을 보내고, 수신 프레임은
//! `Inbound` 채널로 도착 순서대로 받는다. 실제 raw 소켓(AF_PACKET)은 범위 밖이며
//! 여기에는 테스트용 메모리 허브와 UDP로 에뮬레이션한 세그먼트만 있다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::mac::MacAddr;
use crate::packet::{HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::{Error, Result, ETHER_TYPE};

/// 이더넷 헤더 크기 (dst 6 + src 6 + ethertype 2)
pub const ETH_HEADER_LEN: usize = 14;

/// 이더넷 최소 프레임 크기 (FCS 제외)
pub const ETH_MIN_FRAME_LEN: usize = 60;

/// IPv4 UDP 데이터그램 최대 페이로드
pub const UDP_MAX_DATAGRAM: usize = 65507;

/// 수신 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 보낸 피어
    pub src: MacAddr,

    /// 프로토콜 페이로드 (패딩이 붙어 있을 수 있음)
    pub payload: Bytes,
}

/// 수신 프레임 채널 (도착 순서 유지, 중복 제거 없음)
pub type Inbound = mpsc::Receiver<Frame>;

/// 코어가 의존하는 프레임 송신 인터페이스
pub trait Transport: Send + Sync {
    /// 이 노드의 주소
    fn local_addr(&self) -> MacAddr;

    /// `dest`로 페이로드 전송 (`MacAddr::BROADCAST` 지원). 블로킹하지 않는다.
    fn send_frame(&self, dest: MacAddr, payload: &[u8]) -> Result<()>;

    /// 프레임 하나에 실을 수 있는 최대 패킷 크기 (패킷 헤더 포함)
    fn max_payload(&self) -> usize {
        HEADER_SIZE + MAX_PAYLOAD_LEN
    }
}

/// 이더넷 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
    pub payload: Bytes,
}

impl EthernetFrame {
    pub fn new(dst: MacAddr, src: MacAddr, payload: Bytes) -> Self {
        Self {
            dst,
            src,
            ether_type: ETHER_TYPE,
            payload,
        }
    }

    /// 바이트로 직렬화 (최소 60바이트까지 0으로 패딩)
    pub fn to_bytes(&self) -> Bytes {
        let len = (ETH_HEADER_LEN + self.payload.len()).max(ETH_MIN_FRAME_LEN);
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(&self.dst.octets());
        buf.put_slice(&self.src.octets());
        buf.put_u16(self.ether_type);
        buf.put_slice(&self.payload);
        buf.resize(len, 0);
        buf.freeze()
    }

    /// 바이트에서 역직렬화. 패딩은 페이로드에 그대로 남는다.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ETH_HEADER_LEN {
            return None;
        }

        Some(Self {
            dst: MacAddr::from_slice(&bytes[0..6])?,
            src: MacAddr::from_slice(&bytes[6..12])?,
            ether_type: u16::from_be_bytes([bytes[12], bytes[13]]),
            payload: Bytes::copy_from_slice(&bytes[ETH_HEADER_LEN..]),
        })
    }

    /// 이 노드가 받아야 하는 프레임인지
    fn is_for(&self, local: MacAddr) -> bool {
        self.ether_type == ETHER_TYPE
            && self.src != local
            && (self.dst == local || self.dst.is_broadcast())
    }
}

/// 이더넷 최소 길이에 맞춘 페이로드 (실제 선로처럼 뒤에 0 패딩)
fn pad_payload(payload: &[u8]) -> Bytes {
    let min = ETH_MIN_FRAME_LEN - ETH_HEADER_LEN;
    let mut buf = BytesMut::from(payload);
    if buf.len() < min {
        buf.resize(min, 0);
    }
    buf.freeze()
}

fn push_inbound(tx: &mpsc::Sender<Frame>, frame: Frame) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            warn!("수신 큐 가득 참, 프레임 버림: src={}", frame.src);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("수신 측이 닫힘, 프레임 버림");
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// 메모리 허브 (테스트, 단일 프로세스 데모)
// ═══════════════════════════════════════════════════════════════

/// 허브 필터 판정
#[derive(Debug, Clone)]
pub enum FilterAction {
    Deliver,
    Drop,
    /// 페이로드를 바꿔서 전달 (손상 시뮬레이션)
    Replace(Bytes),
}

/// `(src, dst, payload)`를 보고 전달 여부를 정하는 훅
pub type FrameFilter = Arc<dyn Fn(MacAddr, MacAddr, &[u8]) -> FilterAction + Send + Sync>;

#[derive(Default)]
struct HubInner {
    ports: RwLock<HashMap<MacAddr, mpsc::Sender<Frame>>>,
    filter: RwLock<Option<FrameFilter>>,
}

/// 메모리상의 브로드캐스트 도메인
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 새 포트 연결
    pub fn attach(&self, mac: MacAddr, queue: usize) -> (MemoryPort, Inbound) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        self.inner.ports.write().insert(mac, tx);
        (
            MemoryPort {
                mac,
                hub: self.clone(),
            },
            rx,
        )
    }

    pub fn detach(&self, mac: MacAddr) {
        self.inner.ports.write().remove(&mac);
    }

    pub fn set_filter(&self, filter: FrameFilter) {
        *self.inner.filter.write() = Some(filter);
    }

    pub fn clear_filter(&self) {
        *self.inner.filter.write() = None;
    }

    fn deliver(&self, src: MacAddr, dst: MacAddr, payload: &[u8]) {
        let payload = match self.inner.filter.read().as_ref() {
            Some(filter) => match filter(src, dst, payload) {
                FilterAction::Deliver => pad_payload(payload),
                FilterAction::Drop => return,
                FilterAction::Replace(bytes) => pad_payload(&bytes),
            },
            None => pad_payload(payload),
        };

        let ports = self.inner.ports.read();
        let targets = ports
            .iter()
            .filter(|(mac, _)| **mac != src && (dst.is_broadcast() || **mac == dst));

        for (_, tx) in targets {
            push_inbound(
                tx,
                Frame {
                    src,
                    payload: payload.clone(),
                },
            );
        }
    }
}

/// 메모리 허브에 연결된 포트
#[derive(Clone)]
pub struct MemoryPort {
    mac: MacAddr,
    hub: MemoryHub,
}

impl Transport for MemoryPort {
    fn local_addr(&self) -> MacAddr {
        self.mac
    }

    fn send_frame(&self, dest: MacAddr, payload: &[u8]) -> Result<()> {
        self.hub.deliver(self.mac, dest, payload);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
// UDP 에뮬레이션 세그먼트
// ═══════════════════════════════════════════════════════════════

/// 이더넷 프레임을 통째로 UDP 데이터그램에 실어 구성원 모두에게 보내는 허브
pub struct UdpSegment {
    mac: MacAddr,
    socket: Arc<UdpSocket>,
    members: RwLock<Vec<SocketAddr>>,
}

impl UdpSegment {
    /// 소켓 바인딩 후 수신 태스크 시작 (tokio 런타임 안에서 호출)
    pub async fn bind(
        mac: MacAddr,
        bind_addr: SocketAddr,
        members: Vec<SocketAddr>,
        queue: usize,
    ) -> Result<(Arc<Self>, Inbound)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.set_broadcast(true)?;

        let recv_socket = Arc::clone(&socket);

        let (tx, rx) = mpsc::channel(queue.max(1));

        info!("UDP segment bound on {} as {}", socket.local_addr()?, mac);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            loop {
                tokio::select! {
                    result = recv_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, _addr)) => {
                                let Some(frame) = EthernetFrame::from_bytes(&buf[..len]) else {
                                    continue;
                                };
                                if frame.is_for(mac) {
                                    push_inbound(&tx, Frame { src: frame.src, payload: frame.payload });
                                }
                            }
                            Err(e) => {
                                warn!("수신 에러: {}", e);
                            }
                        }
                    }
                    _ = tx.closed() => break,
                }
            }

            debug!("UDP segment receive loop stopped");
        });

        let segment = Arc::new(Self {
            mac,
            socket,
            members: RwLock::new(members),
        });

        Ok((segment, rx))
    }

    pub fn local_socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_member(&self, addr: SocketAddr) {
        let mut members = self.members.write();
        if !members.contains(&addr) {
            members.push(addr);
        }
    }
}

impl Transport for UdpSegment {
    fn local_addr(&self) -> MacAddr {
        self.mac
    }

    fn send_frame(&self, dest: MacAddr, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(Error::Transport(format!(
                "프레임이 너무 큼: {} > {}",
                payload.len(),
                self.max_payload()
            )));
        }

        let frame = EthernetFrame::new(dest, self.mac, Bytes::copy_from_slice(payload)).to_bytes();
        let members = self.members.read();

        if members.is_empty() {
            return Err(Error::Transport("세그먼트 구성원 없음".into()));
        }

        let mut failures = 0;
        for addr in members.iter() {
            if let Err(e) = self.socket.try_send_to(&frame, *addr) {
                warn!("프레임 전송 실패 ({}): {}", addr, e);
                failures += 1;
            }
        }

        if failures == members.len() {
            return Err(Error::Transport(format!("모든 구성원 전송 실패 ({})", failures)));
        }
        Ok(())
    }

    fn max_payload(&self) -> usize {
        (UDP_MAX_DATAGRAM - ETH_HEADER_LEN).min(HEADER_SIZE + MAX_PAYLOAD_LEN)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chunk::Chunk;
    use crate::packet::{Packet, FILE_DATA_OVERHEAD};

    const A: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 0xa]);
    const B: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 0xb]);
    const C: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 0xc]);

    #[test]
    fn test_ethernet_frame_padding() {
        let frame = EthernetFrame::new(B, A, Bytes::from_static(b"\x07\x00\x02\x00\x01"));
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), ETH_MIN_FRAME_LEN);
        assert_eq!(&bytes[12..14], &[0x12, 0x34]);

        let decoded = EthernetFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.dst, B);
        assert_eq!(decoded.src, A);
        assert_eq!(decoded.ether_type, ETHER_TYPE);
        assert_eq!(&decoded.payload[..5], b"\x07\x00\x02\x00\x01");
        assert_eq!(decoded.payload.len(), ETH_MIN_FRAME_LEN - ETH_HEADER_LEN);

        assert!(decoded.is_for(B));
        assert!(!decoded.is_for(C));
        assert!(!decoded.is_for(A));
        assert!(EthernetFrame::from_bytes(&bytes[..10]).is_none());
    }

    #[test]
    fn test_foreign_ether_type_ignored() {
        let mut frame = EthernetFrame::new(MacAddr::BROADCAST, A, Bytes::new());
        frame.ether_type = 0x0800;
        assert!(!frame.is_for(B));
    }

    #[test]
    fn test_memory_hub_unicast_and_broadcast() {
        let hub = MemoryHub::new();
        let (port_a, _rx_a) = hub.attach(A, 8);
        let (_port_b, mut rx_b) = hub.attach(B, 8);
        let (_port_c, mut rx_c) = hub.attach(C, 8);

        port_a.send_frame(B, b"hi").unwrap();
        let frame = rx_b.try_recv().unwrap();
        assert_eq!(frame.src, A);
        assert_eq!(&frame.payload[..2], b"hi");
        assert!(rx_c.try_recv().is_err());

        port_a.send_frame(MacAddr::BROADCAST, b"all").unwrap();
        assert_eq!(&rx_b.try_recv().unwrap().payload[..3], b"all");
        assert_eq!(&rx_c.try_recv().unwrap().payload[..3], b"all");
    }

    #[test]
    fn test_memory_hub_filter() {
        let hub = MemoryHub::new();
        let (port_a, _rx_a) = hub.attach(A, 8);
        let (_port_b, mut rx_b) = hub.attach(B, 8);

        hub.set_filter(Arc::new(|_src: MacAddr, _dst: MacAddr, payload: &[u8]| {
            if payload.starts_with(b"drop") {
                FilterAction::Drop
            } else {
                FilterAction::Replace(Bytes::from_static(b"changed"))
            }
        }));

        port_a.send_frame(B, b"drop me").unwrap();
        assert!(rx_b.try_recv().is_err());

        port_a.send_frame(B, b"keep").unwrap();
        assert_eq!(&rx_b.try_recv().unwrap().payload[..7], b"changed");

        hub.clear_filter();
        port_a.send_frame(B, b"drop me").unwrap();
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_memory_hub_full_queue_drops() {
        let hub = MemoryHub::new();
        let (port_a, _rx_a) = hub.attach(A, 8);
        let (_port_b, mut rx_b) = hub.attach(B, 1);

        port_a.send_frame(B, b"one").unwrap();
        port_a.send_frame(B, b"two").unwrap();
        assert_eq!(&rx_b.try_recv().unwrap().payload[..3], b"one");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_udp_segment_loopback() {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        let (seg_a, _rx_a) = UdpSegment::bind(A, any, vec![], 8).await.unwrap();
        let (seg_b, mut rx_b) = UdpSegment::bind(B, any, vec![], 8).await.unwrap();

        assert!(matches!(seg_a.send_frame(B, b"x"), Err(Error::Transport(_))));

        seg_a.add_member(seg_b.local_socket_addr().unwrap());
        seg_b.add_member(seg_a.local_socket_addr().unwrap());

        // 다른 MAC 앞으로 간 프레임은 걸러짐
        seg_a.send_frame(C, b"not for b").unwrap();
        seg_a.send_frame(B, b"\x01\x00\x02ok").unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.src, A);
        assert_eq!(&frame.payload[..5], b"\x01\x00\x02ok");
    }

    #[tokio::test]
    async fn test_udp_segment_largest_fragment() {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        let (seg_a, _rx_a) = UdpSegment::bind(A, any, vec![], 8).await.unwrap();
        let (seg_b, mut rx_b) = UdpSegment::bind(B, any, vec![], 8).await.unwrap();
        seg_a.add_member(seg_b.local_socket_addr().unwrap());

        let limit = seg_a.max_payload();
        assert_eq!(ETH_HEADER_LEN + limit, UDP_MAX_DATAGRAM);

        let largest = limit - HEADER_SIZE - FILE_DATA_OVERHEAD;
        let chunk = Chunk::new(1, Bytes::from(vec![0x5a; largest]));
        let encoded = Packet::FileData(chunk.clone()).encode().unwrap();
        assert_eq!(encoded.len(), limit);
        seg_a.send_frame(B, &encoded).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Packet::decode(&frame.payload).unwrap(), Packet::FileData(chunk));

        let too_big = Packet::FileData(Chunk::new(2, Bytes::from(vec![0; largest + 1])))
            .encode()
            .unwrap();
        assert!(matches!(seg_a.send_frame(B, &too_big), Err(Error::Transport(_))));
    }
}
