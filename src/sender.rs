//! 송신자
//!
//! - 텍스트/탐색 패킷 전송
//! - stop-and-wait 조각 전송 (ACK/NACK + 제한된 재시도)
//! - 파일/폴더 전송, 취소 가능한 백그라운드 태스크

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ack::{AckOutcome, PendingAcks};
use crate::chunk::{Chunk, ChunkReader, SeqNum};
use crate::discovery;
use crate::mac::MacAddr;
use crate::packet::{Packet, FILE_DATA_OVERHEAD, HEADER_SIZE};
use crate::stats::TransferStats;
use crate::transport::Transport;
use crate::walker::{self, FolderEvent};
use crate::{Config, Error, Result};

/// 조각 하나의 전송 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// ACK 받음
    Confirmed,
    /// 재시도를 모두 소진 (전송은 계속 진행)
    Unconfirmed,
}

/// 파일 하나의 전송 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    /// 와이어에 실린 이름 (폴더 모드에서는 상대 경로)
    pub name: String,
    pub size: u64,
    pub fragments: u64,
    /// 확인받지 못한 조각의 seq
    pub unconfirmed: Vec<SeqNum>,
}

impl FileReport {
    pub fn is_confirmed(&self) -> bool {
        self.unconfirmed.is_empty()
    }
}

/// 폴더 전송 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderReport {
    /// 보낸 FOLDER_START 수 (루트 포함)
    pub folders: u64,
    pub files: Vec<FileReport>,
    /// 읽지 못해 건너뛴 파일 (상대 경로)
    pub failed: Vec<String>,
}

impl FolderReport {
    pub fn unconfirmed_fragments(&self) -> usize {
        self.files.iter().map(|f| f.unconfirmed.len()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// 취소 신호 (조각 사이, 폴더 이벤트 사이에서 확인)
type CancelRx = watch::Receiver<bool>;

fn is_cancelled(cancel: &CancelRx) -> bool {
    *cancel.borrow()
}

/// 전송 계층이 한 프레임에 실을 수 있는 최대 청크 크기
fn fragment_limit(transport: &dyn Transport) -> usize {
    transport
        .max_payload()
        .saturating_sub(HEADER_SIZE + FILE_DATA_OVERHEAD)
        .max(1)
}

/// 송신자
pub struct Sender {
    /// 설정
    config: Config,

    /// 프레임 송신 경계
    transport: Arc<dyn Transport>,

    /// 리스너와 공유하는 ACK 대기 테이블
    acks: Arc<PendingAcks>,

    /// 누적 통계
    stats: RwLock<TransferStats>,
}

impl Sender {
    /// 새 송신자 생성
    pub fn new(config: Config, transport: Arc<dyn Transport>, acks: Arc<PendingAcks>) -> Self {
        let limit = fragment_limit(transport.as_ref());
        if config.chunk_size > limit {
            warn!(
                "chunk_size {}가 전송 계층 한도를 넘음, {}로 줄임",
                config.chunk_size, limit
            );
        }

        Self {
            config,
            transport,
            acks,
            stats: RwLock::new(TransferStats::new()),
        }
    }

    pub fn local_addr(&self) -> MacAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 실제 조각 크기 (설정값과 전송 계층 한도 중 작은 값)
    pub fn chunk_size(&self) -> usize {
        self.config
            .chunk_size
            .min(fragment_limit(self.transport.as_ref()))
    }

    fn send_packet(&self, dest: MacAddr, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        self.transport.send_frame(dest, &bytes)
    }

    /// 텍스트 메시지 전송 (확인 없음)
    pub fn send_text(&self, dest: MacAddr, text: &str) -> Result<()> {
        self.send_packet(dest, &Packet::Text(text.to_string()))?;
        debug!("텍스트 전송: {} bytes -> {}", text.len(), dest);
        Ok(())
    }

    /// 탐색 요청 브로드캐스트
    pub fn discover(&self) -> Result<()> {
        let username = self
            .config
            .username
            .as_deref()
            .ok_or(Error::NotConfigured("username"))?;
        self.send_packet(MacAddr::BROADCAST, &discovery::request(username))?;
        info!("탐색 요청 브로드캐스트: {}", username);
        Ok(())
    }

    /// 조각 하나를 확인받을 때까지 전송 (최대 `max_retries`회)
    ///
    /// 재시도를 모두 소진해도 에러가 아니다. 인코딩 실패만 에러.
    pub async fn send_reliable(&self, dest: MacAddr, chunk: &Chunk) -> Result<Delivery> {
        let payload = Packet::FileData(chunk.clone()).encode()?;
        let ack_timeout = self.config.ack_timeout();

        for attempt in 1..=self.config.max_retries {
            let rx = self.acks.register(dest, chunk.seq);

            {
                let mut stats = self.stats.write();
                stats.fragments_sent += 1;
                if attempt > 1 {
                    stats.retransmitted_fragments += 1;
                }
            }

            if let Err(e) = self.transport.send_frame(dest, &payload) {
                warn!("조각 전송 실패 seq={} (attempt {}): {}", chunk.seq, attempt, e);
                self.acks.forget(dest, chunk.seq);
                continue;
            }

            match tokio::time::timeout(ack_timeout, rx).await {
                Ok(Ok(AckOutcome::Ack)) => {
                    self.stats.write().confirmed_fragments += 1;
                    debug!("ACK seq={} (attempt {})", chunk.seq, attempt);
                    return Ok(Delivery::Confirmed);
                }
                Ok(Ok(AckOutcome::Nack)) => {
                    let mut stats = self.stats.write();
                    stats.total_nacks += 1;
                    stats.last_nack_time = Some(Instant::now());
                    debug!("NACK seq={} (attempt {})", chunk.seq, attempt);
                }
                Ok(Err(_)) => {
                    debug!("대기 항목이 대체됨 seq={}", chunk.seq);
                }
                Err(_) => {
                    self.stats.write().total_timeouts += 1;
                    self.acks.forget(dest, chunk.seq);
                    debug!("ACK 타임아웃 seq={} (attempt {})", chunk.seq, attempt);
                }
            }
        }

        self.acks.forget(dest, chunk.seq);
        self.stats.write().unconfirmed_fragments += 1;
        warn!(
            "조각 확인 실패 seq={} ({}회 시도), 다음 조각으로 진행",
            chunk.seq, self.config.max_retries
        );
        Ok(Delivery::Unconfirmed)
    }

    /// 파일 전송 (와이어 이름은 파일 이름)
    pub async fn send_file(&self, dest: MacAddr, path: impl AsRef<Path>) -> Result<FileReport> {
        let (_keep, cancel) = watch::channel(false);
        self.file_task(dest, path.as_ref(), None, &cancel).await
    }

    /// 와이어 이름을 지정해서 파일 전송
    pub async fn send_file_as(
        &self,
        dest: MacAddr,
        path: impl AsRef<Path>,
        wire_name: &str,
    ) -> Result<FileReport> {
        let (_keep, cancel) = watch::channel(false);
        self.file_task(dest, path.as_ref(), Some(wire_name), &cancel)
            .await
    }

    /// 폴더 트리 전송
    pub async fn send_folder(&self, dest: MacAddr, root: impl AsRef<Path>) -> Result<FolderReport> {
        let (_keep, cancel) = watch::channel(false);
        self.folder_task(dest, root.as_ref(), &cancel).await
    }

    /// 백그라운드 파일 전송
    pub fn spawn_file(
        self: &Arc<Self>,
        dest: MacAddr,
        path: impl Into<PathBuf>,
    ) -> TransferHandle<FileReport> {
        let path = path.into();
        self.spawn_transfer(move |sender, cancel| async move {
            sender.file_task(dest, &path, None, &cancel).await
        })
    }

    /// 백그라운드 폴더 전송
    pub fn spawn_folder(
        self: &Arc<Self>,
        dest: MacAddr,
        root: impl Into<PathBuf>,
    ) -> TransferHandle<FolderReport> {
        let root = root.into();
        self.spawn_transfer(move |sender, cancel| async move {
            sender.folder_task(dest, &root, &cancel).await
        })
    }

    fn spawn_transfer<T, F, Fut>(self: &Arc<Self>, task: F) -> TransferHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Sender>, CancelRx) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(task(self.clone(), cancel_rx));

        TransferHandle {
            cancel_tx: Arc::new(cancel_tx),
            handle,
            sender: self.clone(),
        }
    }

    async fn file_task(
        &self,
        dest: MacAddr,
        path: &Path,
        wire_name: Option<&str>,
        cancel: &CancelRx,
    ) -> Result<FileReport> {
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let name = match wire_name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::FileNotFound(path.to_path_buf()))?,
        };
        let size = metadata.len();

        self.send_packet(
            dest,
            &Packet::FileStart {
                name: name.clone(),
                size,
            },
        )?;
        info!("파일 전송 시작: {} ({} bytes) -> {}", name, size, dest);

        let mut report = FileReport {
            name,
            size,
            fragments: 0,
            unconfirmed: Vec::new(),
        };

        let mut reader = ChunkReader::new(file, self.chunk_size());
        let outcome = loop {
            if is_cancelled(cancel) {
                break Err(Error::Cancelled);
            }

            let chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match self.send_reliable(dest, &chunk).await {
                Ok(Delivery::Confirmed) => {}
                Ok(Delivery::Unconfirmed) => report.unconfirmed.push(chunk.seq),
                Err(e) => break Err(e),
            }

            report.fragments += 1;
            self.stats.write().total_bytes += chunk.len() as u64;
        };

        // 확인 여부와 관계없이 항상 FILE_END
        let end = self.send_packet(dest, &Packet::FileEnd);
        outcome?;
        end?;

        self.stats.write().files_sent += 1;
        if report.is_confirmed() {
            info!("파일 전송 완료: {} ({} fragments)", report.name, report.fragments);
        } else {
            warn!(
                "파일 전송 완료, 미확인 조각 {}개: {}",
                report.unconfirmed.len(),
                report.name
            );
        }
        Ok(report)
    }

    async fn folder_task(
        &self,
        dest: MacAddr,
        root: &Path,
        cancel: &CancelRx,
    ) -> Result<FolderReport> {
        let events = walker::walk(root)?;
        let mut report = FolderReport::default();
        let mut open = 0usize;

        info!("폴더 전송 시작: {:?} -> {}", root, dest);

        for event in events {
            if is_cancelled(cancel) {
                self.close_folders(dest, open);
                return Err(Error::Cancelled);
            }

            let sent = match event {
                FolderEvent::FolderStart(path) => {
                    let sent = self.send_packet(dest, &Packet::FolderStart { path });
                    if sent.is_ok() {
                        open += 1;
                        report.folders += 1;
                    }
                    sent
                }
                FolderEvent::File(relative) => {
                    let absolute = walker::resolve(root, &relative);
                    match self.file_task(dest, &absolute, Some(&relative), cancel).await {
                        Ok(file) => report.files.push(file),
                        Err(Error::Cancelled) => {
                            self.close_folders(dest, open);
                            return Err(Error::Cancelled);
                        }
                        Err(e @ Error::Transport(_)) => {
                            self.close_folders(dest, open);
                            return Err(e);
                        }
                        Err(e) => {
                            error!("파일 건너뜀 {:?}: {}", absolute, e);
                            report.failed.push(relative);
                        }
                    }
                    Ok(())
                }
                FolderEvent::FolderEnd(_) => {
                    let sent = self.send_packet(dest, &Packet::FolderEnd);
                    if sent.is_ok() {
                        open = open.saturating_sub(1);
                    }
                    sent
                }
            };

            if let Err(e) = sent {
                self.close_folders(dest, open);
                return Err(e);
            }
        }

        self.stats.write().folders_sent += 1;
        info!(
            "폴더 전송 완료: {} folders, {} files ({} unconfirmed fragments)",
            report.folders,
            report.files.len(),
            report.unconfirmed_fragments()
        );
        Ok(report)
    }

    /// 중단 시 열린 폴더마다 FOLDER_END (수신 측 스택 균형)
    fn close_folders(&self, dest: MacAddr, open: usize) {
        for _ in 0..open {
            if let Err(e) = self.send_packet(dest, &Packet::FolderEnd) {
                warn!("FOLDER_END 전송 실패: {}", e);
                break;
            }
        }
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }
}

/// 다른 태스크에서 전송을 취소하는 핸들
#[derive(Clone)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// 백그라운드 전송 핸들
pub struct TransferHandle<T> {
    cancel_tx: Arc<watch::Sender<bool>>,
    handle: JoinHandle<Result<T>>,
    sender: Arc<Sender>,
}

impl<T> TransferHandle<T> {
    /// 취소 요청. 현재 조각이 끝난 뒤 멈춘다.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel_tx.clone())
    }

    /// 송신자의 누적 통계
    pub fn stats(&self) -> TransferStats {
        self.sender.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 전송 결과 대기
    pub async fn join(self) -> Result<T> {
        self.handle.await.map_err(|e| {
            error!("전송 태스크 실패: {}", e);
            Error::ChannelError
        })?
    }
}
