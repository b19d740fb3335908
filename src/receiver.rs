//! 수신 측 디스패처와 리스너
//!
//! - 패킷 타입별 분기 (텍스트, 파일, 폴더, ACK/NACK, 탐색)
//! - 조각 CRC 검증 후 ACK/NACK 응답
//! - 패킷 하나의 에러는 그 패킷 안에서 끝난다. 리스너는 멈추지 않는다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ack::{AckOutcome, PendingAcks};
use crate::chunk::{Chunk, SeqNum};
use crate::discovery::{self, PeerDirectory};
use crate::event::{Event, EventSender};
use crate::mac::MacAddr;
use crate::packet::{Packet, PacketType};
use crate::session::{FragmentOutcome, SessionRegistry};
use crate::stats::ReceiveStats;
use crate::transport::{Inbound, Transport};
use crate::{Config, Error, Result};

/// 수신 패킷 디스패처 (리스너 태스크가 단독 소유)
pub struct Dispatcher {
    username: Option<String>,
    transport: Arc<dyn Transport>,
    acks: Arc<PendingAcks>,
    registry: SessionRegistry,
    peers: PeerDirectory,
    events: EventSender,
    stats: ReceiveStats,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        acks: Arc<PendingAcks>,
        peers: PeerDirectory,
        events: EventSender,
    ) -> Self {
        Self {
            username: config.username.clone(),
            registry: SessionRegistry::new(config.download_dir.clone()),
            transport,
            acks,
            peers,
            events,
            stats: ReceiveStats::default(),
        }
    }

    /// 수신 프레임 하나 처리. 에러를 밖으로 내보내지 않는다.
    pub fn handle_frame(&mut self, src: MacAddr, payload: &[u8]) {
        match Packet::decode(payload) {
            Ok(packet) => self.dispatch(src, packet),
            Err(Error::InvalidUtf8 {
                packet: PacketType::Text,
            }) => {
                warn!("텍스트 UTF-8 디코딩 실패, 버림: from {}", src);
                self.stats.malformed_packets += 1;
                self.emit(Event::TextCorrupted { from: src });
            }
            Err(e) if e.is_malformed_input() => {
                warn!("손상된 패킷 버림 (from {}): {}", src, e);
                self.stats.malformed_packets += 1;
            }
            Err(e) => error!("패킷 처리 실패 (from {}): {}", src, e),
        }
    }

    fn dispatch(&mut self, src: MacAddr, packet: Packet) {
        match packet {
            Packet::Text(text) => {
                info!("[{}] {}", src, text);
                self.stats.messages += 1;
                self.emit(Event::TextReceived { from: src, text });
            }
            Packet::FileStart { name, size } => self.on_file_start(src, name, size),
            Packet::FileData(chunk) => self.on_file_data(src, chunk),
            Packet::FileEnd => self.on_file_end(src),
            Packet::FolderStart { path } => self.on_folder_start(src, path),
            Packet::FolderEnd => self.on_folder_end(src),
            Packet::FileAck { seq } => self.on_ack(src, seq, AckOutcome::Ack),
            Packet::FileNack { seq } => self.on_ack(src, seq, AckOutcome::Nack),
            Packet::DiscoveryRequest { username } => {
                self.record_peer(src, username);
                self.answer_discovery(src);
            }
            Packet::DiscoveryResponse { username } => self.record_peer(src, username),
        }
    }

    fn on_file_start(&mut self, src: MacAddr, name: String, size: u64) {
        let opened = match self.registry.start_file(src, &name, size) {
            Ok(opened) => opened,
            Err(Error::UnsafePath(path)) => {
                warn!("안전하지 않은 파일 이름 거부 (from {}): {:?}", src, path);
                self.stats.protocol_violations += 1;
                return;
            }
            Err(e) => {
                error!("파일 생성 실패 {:?} (from {}): {}", name, src, e);
                return;
            }
        };

        if let Some(stale) = opened.abandoned {
            warn!(
                "FILE_END 없이 새 FILE_START: {:?} 버림 ({}/{} bytes)",
                stale.name, stale.bytes_received, stale.declared_size
            );
            self.stats.protocol_violations += 1;
            self.emit(Event::FileAbandoned {
                from: src,
                name: stale.name,
                path: stale.path,
                bytes_received: stale.bytes_received,
            });
        }

        info!("파일 수신 시작: {} ({} bytes) from {} -> {:?}", name, size, src, opened.path);
        self.emit(Event::FileStarted {
            from: src,
            name,
            size,
            path: opened.path,
        });
    }

    fn on_file_data(&mut self, src: MacAddr, chunk: Chunk) {
        let Some(session) = self.registry.file_mut(&src) else {
            warn!("FILE_START 없이 FILE_DATA 도착 (from {}, seq {}), 버림", src, chunk.seq);
            self.stats.protocol_violations += 1;
            return;
        };

        if let Err(e) = chunk.check() {
            warn!("{} (from {}), NACK", e, src);
            self.stats.checksum_failures += 1;
            self.reply(src, Packet::FileNack { seq: chunk.seq });
            return;
        }

        let reply = match session.write_fragment(&chunk) {
            Ok(FragmentOutcome::Written) => {
                debug!("조각 기록: seq={} ({} bytes)", chunk.seq, chunk.len());
                self.stats.fragments_accepted += 1;
                self.stats.bytes_written += chunk.len() as u64;
                Packet::FileAck { seq: chunk.seq }
            }
            Ok(FragmentOutcome::Duplicate) => {
                debug!("중복 조각 재확인: seq={}", chunk.seq);
                self.stats.duplicate_fragments += 1;
                Packet::FileAck { seq: chunk.seq }
            }
            Err(e) => {
                error!("조각 기록 실패 seq={} ({:?}): {}", chunk.seq, session.path(), e);
                Packet::FileNack { seq: chunk.seq }
            }
        };
        self.reply(src, reply);
    }

    fn on_file_end(&mut self, src: MacAddr) {
        let Some(session) = self.registry.take_file(&src) else {
            warn!("진행 중인 파일 없이 FILE_END (from {}), 무시", src);
            self.stats.protocol_violations += 1;
            return;
        };

        let closed = match session.finish() {
            Ok(closed) => closed,
            Err(e) => {
                error!("파일 닫기 실패 (from {}): {}", src, e);
                return;
            }
        };

        if closed.is_complete() {
            info!("파일 수신 완료: {:?} ({} bytes)", closed.path, closed.bytes_received);
        } else {
            warn!(
                "파일 크기 불일치: {:?} 선언 {} bytes, 수신 {} bytes",
                closed.path, closed.declared_size, closed.bytes_received
            );
        }

        self.stats.files_completed += 1;
        self.emit(Event::FileReceived {
            from: src,
            name: closed.name,
            path: closed.path,
            bytes_received: closed.bytes_received,
            declared_size: closed.declared_size,
        });
    }

    fn on_folder_start(&mut self, src: MacAddr, path: String) {
        match self.registry.push_folder(src, &path) {
            Ok(dir) => {
                info!("폴더 생성: {:?} (from {})", dir, src);
                self.emit(Event::FolderStarted { from: src, path: dir });
            }
            Err(Error::UnsafePath(path)) => {
                warn!("안전하지 않은 폴더 경로 거부 (from {}): {:?}", src, path);
                self.stats.protocol_violations += 1;
            }
            Err(e) => error!("폴더 생성 실패 {:?} (from {}): {}", path, src, e),
        }
    }

    fn on_folder_end(&mut self, src: MacAddr) {
        let Some(popped) = self.registry.pop_folder(&src) else {
            warn!("열린 폴더 없이 FOLDER_END (from {}), 무시", src);
            self.stats.protocol_violations += 1;
            return;
        };

        debug!("폴더 완료: {:?}", popped.dir);
        self.emit(Event::FolderCompleted {
            from: src,
            path: popped.dir,
        });

        if let Some(root) = popped.finished_root {
            info!("폴더 전송 완료: {:?} (from {})", root, src);
            self.emit(Event::FolderTransferCompleted { from: src, root });
        }
    }

    fn on_ack(&mut self, src: MacAddr, seq: SeqNum, outcome: AckOutcome) {
        if !self.acks.resolve(src, seq, outcome) {
            debug!("대기 항목 없는 {:?} 무시: seq={} from {}", outcome, seq, src);
        }
    }

    fn record_peer(&mut self, peer: MacAddr, username: String) {
        if self.peers.record(peer, &username) {
            info!("피어 발견: {} ({})", username, peer);
        }
        self.emit(Event::PeerDiscovered { peer, username });
    }

    fn answer_discovery(&self, src: MacAddr) {
        match &self.username {
            Some(username) => self.reply(src, discovery::response(username)),
            None => debug!("사용자 이름이 없어 탐색 요청에 응답하지 않음 (from {})", src),
        }
    }

    fn reply(&self, dest: MacAddr, packet: Packet) {
        let result = packet
            .encode()
            .and_then(|bytes| self.transport.send_frame(dest, &bytes));
        if let Err(e) = result {
            warn!("{:?} 응답 실패 (to {}): {}", packet.packet_type(), dest, e);
        }
    }

    fn emit(&self, event: Event) {
        // 이벤트 수신 측이 없어도 프로토콜 처리는 계속
        let _ = self.events.send(event);
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }
}

/// 백그라운드 리스너 핸들
pub struct Listener {
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ReceiveStats>>,
    handle: JoinHandle<Dispatcher>,
}

impl Listener {
    /// 수신 태스크 시작 (tokio 런타임 안에서 호출)
    pub fn spawn(mut dispatcher: Dispatcher, mut inbound: Inbound) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(RwLock::new(ReceiveStats::default()));

        let running_main = running.clone();
        let stats_main = stats.clone();

        let handle = tokio::spawn(async move {
            debug!("리스너 시작");

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    frame = inbound.recv() => {
                        let Some(frame) = frame else {
                            debug!("수신 채널 닫힘");
                            break;
                        };
                        dispatcher.handle_frame(frame.src, &frame.payload);
                        *stats_main.write() = dispatcher.stats().clone();
                    }
                }
            }

            running_main.store(false, Ordering::SeqCst);
            debug!("리스너 종료");
            dispatcher
        });

        Self {
            stop_tx,
            running,
            stats,
            handle,
        }
    }

    /// 정지 요청
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// 종료를 기다리고 디스패처를 돌려받는다
    pub async fn join(self) -> Result<Dispatcher> {
        self.handle.await.map_err(|e| {
            error!("리스너 태스크 실패: {}", e);
            Error::ChannelError
        })
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> ReceiveStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::event::EventReceiver;
    use crate::transport::{MemoryHub, ETH_MIN_FRAME_LEN};

    const LOCAL: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x01]);
    const PEER: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    struct Fixture {
        dir: TempDir,
        dispatcher: Dispatcher,
        events: EventReceiver,
        probe: Inbound,
        acks: Arc<PendingAcks>,
        _hub: MemoryHub,
    }

    fn fixture(username: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let hub = MemoryHub::new();
        let (port, _local_rx) = hub.attach(LOCAL, 64);
        let (_peer_port, probe) = hub.attach(PEER, 64);

        let mut config = Config::default().with_download_dir(dir.path());
        config.username = username.map(str::to_string);

        let acks = Arc::new(PendingAcks::new());
        let (tx, events) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            &config,
            Arc::new(port),
            acks.clone(),
            PeerDirectory::new(),
            tx,
        );

        Fixture {
            dir,
            dispatcher,
            events,
            probe,
            acks,
            _hub: hub,
        }
    }

    impl Fixture {
        fn feed(&mut self, packet: Packet) {
            let bytes = packet.encode().unwrap();
            self.dispatcher.handle_frame(PEER, &bytes);
        }

        fn next_reply(&mut self) -> Option<Packet> {
            let frame = self.probe.try_recv().ok()?;
            Some(Packet::decode(&frame.payload).unwrap())
        }

        fn peer_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("aa-bb-cc-dd-ee-ff")
        }
    }

    #[test]
    fn test_text_hola() {
        let mut fx = fixture(None);
        fx.dispatcher.handle_frame(PEER, b"\x01\x00\x05Hola!");

        assert_eq!(
            fx.events.try_recv().unwrap(),
            Event::TextReceived {
                from: PEER,
                text: "Hola!".into()
            }
        );
        assert_eq!(fx.dispatcher.stats().messages, 1);
    }

    #[test]
    fn test_padded_frame_decodes_the_same() {
        let mut fx = fixture(None);
        let mut padded = b"\x01\x00\x05Hola!".to_vec();
        padded.resize(ETH_MIN_FRAME_LEN, 0);
        fx.dispatcher.handle_frame(PEER, &padded);

        assert_eq!(
            fx.events.try_recv().unwrap(),
            Event::TextReceived {
                from: PEER,
                text: "Hola!".into()
            }
        );
    }

    #[test]
    fn test_corrupted_text_and_garbage() {
        let mut fx = fixture(None);
        fx.dispatcher.handle_frame(PEER, b"\x01\x00\x02\xff\xfe");
        assert_eq!(fx.events.try_recv().unwrap(), Event::TextCorrupted { from: PEER });

        fx.dispatcher.handle_frame(PEER, b"\x01\x00");
        fx.dispatcher.handle_frame(PEER, b"\x7f\x00\x00");
        fx.dispatcher.handle_frame(PEER, b"\x01\x00\x09short");

        assert_eq!(fx.dispatcher.stats().malformed_packets, 4);
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn test_zero_byte_file() {
        let mut fx = fixture(None);
        fx.feed(Packet::FileStart {
            name: "doc.txt".into(),
            size: 0,
        });
        fx.feed(Packet::FileEnd);

        let path = fx.peer_dir().join("received_doc.txt");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        assert!(matches!(fx.events.try_recv().unwrap(), Event::FileStarted { .. }));
        let done = fx.events.try_recv().unwrap();
        assert_eq!(done.is_complete(), Some(true));
        assert!(matches!(done, Event::FileReceived { path: p, .. } if p == path));
        assert!(fx.next_reply().is_none());
    }

    #[test]
    fn test_fragments_ack_nack_and_duplicates() {
        let mut fx = fixture(None);
        fx.feed(Packet::FileStart {
            name: "data.bin".into(),
            size: 6,
        });

        let good = Chunk::new(1, Bytes::from_static(b"abc"));
        let mut bad = Chunk::new(2, Bytes::from_static(b"def"));
        bad.checksum ^= 1;

        fx.feed(Packet::FileData(good.clone()));
        assert_eq!(fx.next_reply(), Some(Packet::FileAck { seq: 1 }));

        // ACK 유실로 재전송된 조각
        fx.feed(Packet::FileData(good));
        assert_eq!(fx.next_reply(), Some(Packet::FileAck { seq: 1 }));

        fx.feed(Packet::FileData(bad));
        assert_eq!(fx.next_reply(), Some(Packet::FileNack { seq: 2 }));

        fx.feed(Packet::FileData(Chunk::new(2, Bytes::from_static(b"def"))));
        assert_eq!(fx.next_reply(), Some(Packet::FileAck { seq: 2 }));

        fx.feed(Packet::FileEnd);

        let written = std::fs::read(fx.peer_dir().join("received_data.bin")).unwrap();
        assert_eq!(written, b"abcdef");

        let stats = fx.dispatcher.stats();
        assert_eq!(stats.fragments_accepted, 2);
        assert_eq!(stats.duplicate_fragments, 1);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.files_completed, 1);
    }

    #[test]
    fn test_size_mismatch_reported() {
        let mut fx = fixture(None);
        fx.feed(Packet::FileStart {
            name: "short.bin".into(),
            size: 10,
        });
        fx.feed(Packet::FileData(Chunk::new(1, Bytes::from_static(b"abc"))));
        fx.feed(Packet::FileEnd);

        let _started = fx.events.try_recv().unwrap();
        assert_eq!(fx.events.try_recv().unwrap().is_complete(), Some(false));
    }

    #[test]
    fn test_data_and_end_without_session() {
        let mut fx = fixture(None);
        fx.feed(Packet::FileData(Chunk::new(1, Bytes::from_static(b"x"))));
        fx.feed(Packet::FileEnd);
        fx.feed(Packet::FolderEnd);

        assert!(fx.next_reply().is_none());
        assert!(fx.events.try_recv().is_err());
        assert_eq!(fx.dispatcher.stats().protocol_violations, 3);
    }

    #[test]
    fn test_escape_name_rejected() {
        let mut fx = fixture(None);
        fx.feed(Packet::FileStart {
            name: "../escape.txt".into(),
            size: 1,
        });

        assert!(fx.events.try_recv().is_err());
        assert!(!fx.dir.path().join("escape.txt").exists());
        assert!(!fx.dir.path().join("received_escape.txt").exists());
        assert_eq!(fx.dispatcher.stats().protocol_violations, 1);
    }

    #[test]
    fn test_duplicate_file_start_abandons() {
        let mut fx = fixture(None);
        fx.feed(Packet::FileStart {
            name: "a.txt".into(),
            size: 4,
        });
        fx.feed(Packet::FileStart {
            name: "b.txt".into(),
            size: 0,
        });

        let _ = fx.events.try_recv().unwrap();
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            Event::FileAbandoned { name, bytes_received: 0, .. } if name == "a.txt"
        ));
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            Event::FileStarted { name, .. } if name == "b.txt"
        ));
    }

    #[test]
    fn test_folder_events() {
        let mut fx = fixture(None);
        fx.feed(Packet::FolderStart { path: String::new() });
        fx.feed(Packet::FileStart {
            name: "a.txt".into(),
            size: 0,
        });
        fx.feed(Packet::FileEnd);
        fx.feed(Packet::FolderStart { path: "sub".into() });
        fx.feed(Packet::FileStart {
            name: "sub/b.txt".into(),
            size: 0,
        });
        fx.feed(Packet::FileEnd);
        fx.feed(Packet::FolderEnd);
        fx.feed(Packet::FolderEnd);

        let root = fx.peer_dir().join("received_folder");
        assert!(root.join("a.txt").is_file());
        assert!(root.join("sub").join("b.txt").is_file());
        assert_eq!(fx.dispatcher.registry().folder_depth(&PEER), 0);

        let last = std::iter::from_fn(|| fx.events.try_recv().ok()).last();
        assert_eq!(
            last,
            Some(Event::FolderTransferCompleted { from: PEER, root })
        );
    }

    #[tokio::test]
    async fn test_ack_resolves_pending() {
        let mut fx = fixture(None);
        let rx = fx.acks.register(PEER, 5);
        fx.feed(Packet::FileAck { seq: 5 });
        assert_eq!(rx.await.unwrap(), AckOutcome::Ack);

        // 대기 항목이 없는 ACK는 조용히 무시
        fx.feed(Packet::FileNack { seq: 6 });
        assert!(fx.acks.is_empty());
    }

    #[test]
    fn test_discovery_without_username() {
        let mut fx = fixture(None);
        fx.feed(discovery::request("bob"));

        assert!(fx.next_reply().is_none());
        assert_eq!(fx.dispatcher.peers().get(&PEER).unwrap().username, "bob");
        assert_eq!(
            fx.events.try_recv().unwrap(),
            Event::PeerDiscovered {
                peer: PEER,
                username: "bob".into()
            }
        );
    }

    #[test]
    fn test_discovery_reply() {
        let mut fx = fixture(Some("ana"));
        fx.feed(discovery::request("bob"));
        assert_eq!(fx.next_reply(), Some(discovery::response("ana")));

        fx.feed(discovery::response("bob2"));
        assert!(fx.next_reply().is_none());
        assert_eq!(fx.dispatcher.peers().get(&PEER).unwrap().username, "bob2");
    }

    #[tokio::test]
    async fn test_listener_dispatches_and_stops() {
        let dir = TempDir::new().unwrap();
        let hub = MemoryHub::new();
        let (port, inbound) = hub.attach(LOCAL, 64);
        let (peer_port, _probe) = hub.attach(PEER, 64);

        let config = Config::default().with_download_dir(dir.path());
        let (tx, mut events) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            &config,
            Arc::new(port),
            Arc::new(PendingAcks::new()),
            PeerDirectory::new(),
            tx,
        );
        let listener = Listener::spawn(dispatcher, inbound);

        // 손상된 프레임 뒤에도 계속 동작
        peer_port.send_frame(LOCAL, b"\x03\x00\x01").unwrap();
        peer_port.send_frame(LOCAL, b"\x01\x00\x05Hola!").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::TextReceived {
                from: PEER,
                text: "Hola!".into()
            }
        );
        assert!(listener.is_running());

        listener.stop();
        let dispatcher = listener.join().await.unwrap();
        assert_eq!(dispatcher.stats().malformed_packets, 1);
        assert_eq!(dispatcher.stats().messages, 1);
    }
}
