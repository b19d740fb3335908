//! 피어별 수신 세션 상태
//!
//! - `FileTransferSession`: FILE_START ~ FILE_END 사이의 파일 하나
//! - `FolderContext`: 열려 있는 폴더 스택
//! - `SessionRegistry`: MAC 주소별 상태 (디스패처가 단독 소유)
//!
//! 모든 수신 파일은 `download_dir/<peer>/` 아래에 저장된다.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::chunk::{Chunk, SeqNum};
use crate::mac::MacAddr;
use crate::{Error, Result};

/// 수신 파일/폴더 이름 접두사
pub const RECEIVED_PREFIX: &str = "received_";

/// 루트 경로가 비어 있을 때 쓰는 폴더 이름
const DEFAULT_FOLDER_NAME: &str = "folder";

/// 와이어에서 받은 `/` 구분 상대 경로를 로컬 경로로 변환
///
/// `..`, 절대 경로, 결과가 빈 경로는 거부한다. `.`과 빈 요소는 건너뛴다.
pub fn sanitize_relative(raw: &str) -> Result<PathBuf> {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(Error::UnsafePath(raw.to_string()));
    }

    let mut path = PathBuf::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(Error::UnsafePath(raw.to_string())),
            _ => {}
        }

        // 윈도우 구분자나 드라이브 접두사 같은 것이 섞여 있으면 거부
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) => path.push(c),
            _ => return Err(Error::UnsafePath(raw.to_string())),
        }
    }

    if path.as_os_str().is_empty() {
        return Err(Error::UnsafePath(raw.to_string()));
    }
    Ok(path)
}

/// 피어 전용 저장 디렉터리
pub fn peer_dir(download_dir: &Path, peer: MacAddr) -> PathBuf {
    download_dir.join(peer.to_dir_name())
}

/// 플랫 모드 저장 경로: 파일 이름에 `received_` 접두사
fn flat_destination(base: &Path, name: &str) -> Result<PathBuf> {
    let relative = sanitize_relative(name)?;
    let file_name = relative
        .file_name()
        .ok_or_else(|| Error::UnsafePath(name.to_string()))?
        .to_string_lossy()
        .into_owned();

    let parent = relative.parent().unwrap_or_else(|| Path::new(""));
    Ok(base
        .join(parent)
        .join(format!("{}{}", RECEIVED_PREFIX, file_name)))
}

/// 이미 있으면 `_2`, `_3` ... 을 붙여 겹치지 않는 폴더 루트 선택
fn unique_root(base: &Path, relative: &str) -> PathBuf {
    let name = relative
        .rsplit('/')
        .find(|part| !part.is_empty() && *part != "." && *part != "..")
        .unwrap_or(DEFAULT_FOLDER_NAME);
    let stem = format!("{}{}", RECEIVED_PREFIX, name);

    let mut candidate = base.join(&stem);
    let mut n = 2u32;
    while candidate.exists() {
        candidate = base.join(format!("{}_{}", stem, n));
        n += 1;
    }
    candidate
}

// ═══════════════════════════════════════════════════════════════
// 파일 세션
// ═══════════════════════════════════════════════════════════════

/// 조각 기록 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// 새 조각, 파일에 기록됨
    Written,
    /// 직전에 받은 조각의 재전송 (ACK 유실). 기록하지 않음
    Duplicate,
}

/// 닫힌 파일 세션 요약
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub name: String,
    pub path: PathBuf,
    pub declared_size: u64,
    pub bytes_received: u64,
}

impl ClosedFile {
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.declared_size
    }
}

/// 수신 중인 파일 하나
pub struct FileTransferSession {
    name: String,
    path: PathBuf,
    declared_size: u64,
    bytes_received: u64,
    last_seq: Option<SeqNum>,
    sink: BufWriter<File>,
}

impl FileTransferSession {
    /// 저장 파일 생성 (상위 디렉터리 포함)
    pub fn create(name: &str, declared_size: u64, path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;

        debug!("파일 세션 생성: {} -> {:?}", name, path);

        Ok(Self {
            name: name.to_string(),
            path,
            declared_size,
            bytes_received: 0,
            last_seq: None,
            sink: BufWriter::new(file),
        })
    }

    /// 검증된 조각 기록
    pub fn write_fragment(&mut self, chunk: &Chunk) -> Result<FragmentOutcome> {
        if self.last_seq == Some(chunk.seq) {
            return Ok(FragmentOutcome::Duplicate);
        }

        self.sink.write_all(&chunk.data)?;
        self.bytes_received += chunk.data.len() as u64;
        self.last_seq = Some(chunk.seq);
        Ok(FragmentOutcome::Written)
    }

    /// FILE_END: 버퍼를 비우고 닫는다
    pub fn finish(mut self) -> Result<ClosedFile> {
        self.sink.flush()?;
        Ok(self.summary())
    }

    /// 버퍼를 비운다 (세션은 유지)
    fn flush(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!("파일 flush 실패 {:?}: {}", self.path, e);
        }
    }

    /// 완료되지 않은 채 닫기 (새 FILE_START 등)
    pub fn abandon(mut self) -> ClosedFile {
        self.flush();
        self.summary()
    }

    fn summary(&self) -> ClosedFile {
        ClosedFile {
            name: self.name.clone(),
            path: self.path.clone(),
            declared_size: self.declared_size,
            bytes_received: self.bytes_received,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

impl std::fmt::Debug for FileTransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferSession")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("declared_size", &self.declared_size)
            .field("bytes_received", &self.bytes_received)
            .field("last_seq", &self.last_seq)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════
// 폴더 스택
// ═══════════════════════════════════════════════════════════════

/// FOLDER_END 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPop {
    /// 닫힌 폴더
    pub dir: PathBuf,
    /// 스택이 비었으면 전송 전체의 루트
    pub finished_root: Option<PathBuf>,
}

/// 열려 있는 폴더 스택
#[derive(Debug, Default)]
pub struct FolderContext {
    root: Option<PathBuf>,
    stack: Vec<PathBuf>,
}

impl FolderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// FOLDER_START: 디렉터리를 만들고 스택에 넣는다
    ///
    /// 첫 번째 항목은 `base` 아래에 새 루트를 정하고, 이후 항목은 루트 기준 상대 경로.
    pub fn push(&mut self, base: &Path, relative: &str) -> Result<PathBuf> {
        let dir = match &self.root {
            None => unique_root(base, relative),
            Some(root) => root.join(sanitize_relative(relative)?),
        };

        std::fs::create_dir_all(&dir)?;

        if self.root.is_none() {
            self.root = Some(dir.clone());
        }
        self.stack.push(dir.clone());
        Ok(dir)
    }

    /// FOLDER_END: 빈 스택이면 None (상태 변경 없음)
    pub fn pop(&mut self) -> Option<FolderPop> {
        let dir = self.stack.pop()?;
        let finished_root = if self.stack.is_empty() {
            self.root.take()
        } else {
            None
        };
        Some(FolderPop { dir, finished_root })
    }

    /// 폴더 모드에서의 파일 저장 경로 (루트 기준)
    pub fn file_destination(&self, name: &str) -> Option<Result<PathBuf>> {
        let root = self.root.as_ref()?;
        Some(sanitize_relative(name).map(|rel| root.join(rel)))
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════
// 레지스트리
// ═══════════════════════════════════════════════════════════════

/// 피어 하나의 수신 상태
#[derive(Debug, Default)]
pub struct PeerSession {
    pub file: Option<FileTransferSession>,
    pub folders: FolderContext,
}

impl PeerSession {
    /// 아무것도 진행 중이 아님
    pub fn is_idle(&self) -> bool {
        self.file.is_none() && self.folders.is_empty()
    }
}

/// 새 파일 세션 시작 결과
#[derive(Debug)]
pub struct FileOpened {
    pub path: PathBuf,
    /// 같은 피어의 이전 미완료 세션
    pub abandoned: Option<ClosedFile>,
}

/// 피어별 수신 상태 테이블
#[derive(Debug)]
pub struct SessionRegistry {
    download_dir: PathBuf,
    peers: HashMap<MacAddr, PeerSession>,
}

impl SessionRegistry {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            peers: HashMap::new(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// 피어 저장 디렉터리
    pub fn peer_dir(&self, peer: MacAddr) -> PathBuf {
        peer_dir(&self.download_dir, peer)
    }

    pub fn get(&self, peer: &MacAddr) -> Option<&PeerSession> {
        self.peers.get(peer)
    }

    fn entry(&mut self, peer: MacAddr) -> &mut PeerSession {
        self.peers.entry(peer).or_default()
    }

    /// FILE_START
    ///
    /// 경로가 안전하지 않거나 파일을 만들 수 없으면 기존 상태를 건드리지 않고 에러.
    pub fn start_file(&mut self, peer: MacAddr, name: &str, size: u64) -> Result<FileOpened> {
        let base = self.peer_dir(peer);
        let result = Self::open_file(self.entry(peer), &base, name, size);
        if result.is_err() {
            self.cleanup(&peer);
        }
        result
    }

    fn open_file(
        session: &mut PeerSession,
        base: &Path,
        name: &str,
        size: u64,
    ) -> Result<FileOpened> {
        let path = match session.folders.file_destination(name) {
            Some(dest) => dest?,
            None => flat_destination(base, name)?,
        };

        // 같은 경로를 다시 열 수 있으니 이전 버퍼부터 비운다
        if let Some(stale) = session.file.as_mut() {
            stale.flush();
        }
        let file = FileTransferSession::create(name, size, path.clone())?;
        let abandoned = session.file.replace(file).map(FileTransferSession::abandon);

        Ok(FileOpened { path, abandoned })
    }

    /// 진행 중인 파일 세션
    pub fn file_mut(&mut self, peer: &MacAddr) -> Option<&mut FileTransferSession> {
        self.peers.get_mut(peer)?.file.as_mut()
    }

    /// FILE_END: 세션을 꺼낸다 (없으면 None)
    pub fn take_file(&mut self, peer: &MacAddr) -> Option<FileTransferSession> {
        let session = self.peers.get_mut(peer)?;
        let file = session.file.take();
        self.cleanup(peer);
        file
    }

    /// FOLDER_START
    pub fn push_folder(&mut self, peer: MacAddr, relative: &str) -> Result<PathBuf> {
        let base = self.peer_dir(peer);
        let result = self.entry(peer).folders.push(&base, relative);
        if result.is_err() {
            self.cleanup(&peer);
        }
        result
    }

    /// FOLDER_END (빈 스택이면 None)
    pub fn pop_folder(&mut self, peer: &MacAddr) -> Option<FolderPop> {
        let popped = self.peers.get_mut(peer)?.folders.pop();
        self.cleanup(peer);
        popped
    }

    /// 피어의 폴더 스택 깊이
    pub fn folder_depth(&self, peer: &MacAddr) -> usize {
        self.peers.get(peer).map_or(0, |s| s.folders.depth())
    }

    /// 상태가 남아 있는 피어 수
    pub fn active_peers(&self) -> usize {
        self.peers.len()
    }

    fn cleanup(&mut self, peer: &MacAddr) {
        if self.peers.get(peer).is_some_and(PeerSession::is_idle) {
            self.peers.remove(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;

    const PEER: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const OTHER: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x01]);

    #[test]
    fn test_sanitize_relative() {
        assert_eq!(sanitize_relative("a.txt").unwrap(), PathBuf::from("a.txt"));
        assert_eq!(
            sanitize_relative("sub/./b.txt").unwrap(),
            Path::new("sub").join("b.txt")
        );
        assert_eq!(
            sanitize_relative("sub//b.txt").unwrap(),
            Path::new("sub").join("b.txt")
        );

        for bad in ["../escape.txt", "a/../../b", "/etc/passwd", "", ".", "./"] {
            assert!(
                matches!(sanitize_relative(bad), Err(Error::UnsafePath(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_flat_destination_is_peer_scoped() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        let opened = registry.start_file(PEER, "doc.txt", 0).unwrap();
        assert_eq!(
            opened.path,
            dir.path().join("aa-bb-cc-dd-ee-ff").join("received_doc.txt")
        );
        assert!(opened.abandoned.is_none());

        let closed = registry.take_file(&PEER).unwrap().finish().unwrap();
        assert!(closed.is_complete());
        assert_eq!(std::fs::metadata(&closed.path).unwrap().len(), 0);
        assert_eq!(registry.active_peers(), 0);
    }

    #[test]
    fn test_escape_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        registry.start_file(PEER, "keep.txt", 3).unwrap();
        let result = registry.start_file(PEER, "../escape.txt", 1);
        assert!(matches!(result, Err(Error::UnsafePath(_))));

        // 기존 세션은 그대로
        assert_eq!(registry.file_mut(&PEER).unwrap().name(), "keep.txt");
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!dir.path().join("received_escape.txt").exists());
    }

    #[test]
    fn test_duplicate_fragment_not_written_twice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut session = FileTransferSession::create("out.bin", 6, path.clone()).unwrap();

        let first = Chunk::new(1, Bytes::from_static(b"abc"));
        let second = Chunk::new(2, Bytes::from_static(b"def"));

        assert_eq!(session.write_fragment(&first).unwrap(), FragmentOutcome::Written);
        assert_eq!(session.write_fragment(&first).unwrap(), FragmentOutcome::Duplicate);
        assert_eq!(session.write_fragment(&second).unwrap(), FragmentOutcome::Written);

        let closed = session.finish().unwrap();
        assert_eq!(closed.bytes_received, 6);
        assert_eq!(std::fs::read(path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_second_file_start_abandons_first() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        registry.start_file(PEER, "one.txt", 10).unwrap();
        registry
            .file_mut(&PEER)
            .unwrap()
            .write_fragment(&Chunk::new(1, Bytes::from_static(b"12345")))
            .unwrap();

        let opened = registry.start_file(PEER, "two.txt", 1).unwrap();
        let abandoned = opened.abandoned.unwrap();
        assert_eq!(abandoned.name, "one.txt");
        assert_eq!(abandoned.bytes_received, 5);
        assert!(!abandoned.is_complete());
        assert_eq!(std::fs::read(&abandoned.path).unwrap(), b"12345");
        assert_eq!(registry.file_mut(&PEER).unwrap().name(), "two.txt");
    }

    #[test]
    fn test_failed_create_keeps_previous_session() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        registry.start_file(PEER, "one.txt", 10).unwrap();
        registry
            .file_mut(&PEER)
            .unwrap()
            .write_fragment(&Chunk::new(1, Bytes::from_static(b"123")))
            .unwrap();

        // 저장 경로에 디렉터리가 있으면 파일 생성 실패
        std::fs::create_dir_all(registry.peer_dir(PEER).join("received_two.txt")).unwrap();
        assert!(matches!(
            registry.start_file(PEER, "two.txt", 1),
            Err(Error::Io(_))
        ));

        let session = registry.file_mut(&PEER).unwrap();
        assert_eq!(session.name(), "one.txt");
        assert_eq!(session.bytes_received(), 3);
    }

    #[test]
    fn test_rejected_start_leaves_no_peer_entry() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        for (i, name) in ["../a", "/etc/passwd", ".."].iter().enumerate() {
            let spoofed = MacAddr::new([0x02, 0, 0, 0, 0, i as u8 + 0x10]);
            assert!(registry.start_file(spoofed, name, 1).is_err());
        }
        assert_eq!(registry.active_peers(), 0);

        std::fs::create_dir_all(registry.peer_dir(OTHER).join("received_x")).unwrap();
        assert!(registry.start_file(OTHER, "x", 1).is_err());
        assert_eq!(registry.active_peers(), 0);
    }

    #[test]
    fn test_folder_stack_never_negative() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        assert!(registry.pop_folder(&PEER).is_none());
        assert_eq!(registry.folder_depth(&PEER), 0);

        let root = registry.push_folder(PEER, "").unwrap();
        assert_eq!(
            root,
            dir.path().join("aa-bb-cc-dd-ee-ff").join("received_folder")
        );
        let sub = registry.push_folder(PEER, "sub").unwrap();
        assert_eq!(sub, root.join("sub"));
        assert!(sub.is_dir());
        assert_eq!(registry.folder_depth(&PEER), 2);

        let popped = registry.pop_folder(&PEER).unwrap();
        assert_eq!(popped.dir, sub);
        assert!(popped.finished_root.is_none());

        let popped = registry.pop_folder(&PEER).unwrap();
        assert_eq!(popped.finished_root, Some(root));

        assert!(registry.pop_folder(&PEER).is_none());
        assert_eq!(registry.folder_depth(&PEER), 0);
        assert_eq!(registry.active_peers(), 0);
    }

    #[test]
    fn test_folder_files_resolve_from_root() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        let root = registry.push_folder(PEER, "").unwrap();
        registry.push_folder(PEER, "sub").unwrap();
        let opened = registry.start_file(PEER, "sub/b.txt", 0).unwrap();
        assert_eq!(opened.path, root.join("sub").join("b.txt"));
    }

    #[test]
    fn test_unique_root_suffix() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        let first = registry.push_folder(PEER, "photos").unwrap();
        registry.pop_folder(&PEER).unwrap();
        let second = registry.push_folder(PEER, "photos").unwrap();

        assert!(first.ends_with("received_photos"));
        assert!(second.ends_with("received_photos_2"));
    }

    #[test]
    fn test_peers_are_independent() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(dir.path());

        registry.push_folder(PEER, "").unwrap();
        let opened = registry.start_file(OTHER, "a.txt", 0).unwrap();

        assert_eq!(
            opened.path,
            dir.path().join("02-00-00-00-00-01").join("received_a.txt")
        );
        assert_eq!(registry.folder_depth(&OTHER), 0);
        assert_eq!(registry.folder_depth(&PEER), 1);
    }
}
