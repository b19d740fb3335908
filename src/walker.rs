//! 폴더 순회
//!
//! 디렉터리 트리를 깊이 우선으로 돌며 구조 이벤트를 만든다.
//! 각 디렉터리에서: FOLDER_START → 파일들(이름순) → 하위 디렉터리들(이름순, 재귀) → FOLDER_END.
//! 루트의 상대 경로는 빈 문자열이고 경로 구분자는 항상 `/`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::{Error, Result};

/// 폴더 구조 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEvent {
    FolderStart(String),
    File(String),
    FolderEnd(String),
}

impl FolderEvent {
    /// 루트 기준 상대 경로
    pub fn relative_path(&self) -> &str {
        match self {
            FolderEvent::FolderStart(p) | FolderEvent::File(p) | FolderEvent::FolderEnd(p) => p,
        }
    }
}

/// `root`부터 새로 순회를 시작한다.
///
/// 반환된 이터레이터는 지연 평가되며 한 번만 소비할 수 있다.
pub fn walk(root: impl AsRef<Path>) -> Result<FolderWalker> {
    let root = root.as_ref();
    let metadata = match std::fs::metadata(root) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::FileNotFound(root.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_dir() {
        return Err(Error::NotADirectory(root.to_path_buf()));
    }

    // 파일 먼저, 그 다음 디렉터리. 각 그룹은 이름순.
    let entries = WalkDir::new(root)
        .follow_links(true)
        .sort_by(|a, b| {
            a.file_type()
                .is_dir()
                .cmp(&b.file_type().is_dir())
                .then_with(|| a.file_name().cmp(b.file_name()))
        })
        .into_iter();

    Ok(FolderWalker {
        root: root.to_path_buf(),
        entries,
        open: Vec::new(),
        pending: VecDeque::new(),
    })
}

/// 상대 경로(`a/b/c.txt`)를 루트 아래 절대 경로로 변환
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// 폴더 이벤트 이터레이터
pub struct FolderWalker {
    root: PathBuf,
    entries: walkdir::IntoIter,

    /// 열려 있는 폴더들의 상대 경로 (index == 깊이)
    open: Vec<String>,

    /// 엔트리 하나가 여러 이벤트를 만들 수 있으므로 버퍼링
    pending: VecDeque<FolderEvent>,
}

impl FolderWalker {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn visit(&mut self, entry: DirEntry) {
        // 깊이 d의 엔트리는 open[d - 1] 안에 있다. 더 깊은 폴더는 이미 끝남.
        self.close_until(entry.depth());

        let file_type = entry.file_type();
        let Some(relative) = self.relative(entry.path()) else {
            warn!("UTF-8이 아닌 경로 건너뜀: {:?}", entry.path());
            if file_type.is_dir() {
                self.entries.skip_current_dir();
            }
            return;
        };

        if file_type.is_dir() {
            self.open.push(relative.clone());
            self.pending.push_back(FolderEvent::FolderStart(relative));
        } else if file_type.is_file() {
            self.pending.push_back(FolderEvent::File(relative));
        } else {
            debug!("일반 파일이 아닌 엔트리 건너뜀: {:?}", entry.path());
        }
    }

    fn close_until(&mut self, depth: usize) {
        while self.open.len() > depth {
            if let Some(dir) = self.open.pop() {
                self.pending.push_back(FolderEvent::FolderEnd(dir));
            }
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.root).ok()?;
        let parts = stripped
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl Iterator for FolderWalker {
    type Item = FolderEvent;

    fn next(&mut self) -> Option<FolderEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match self.entries.next() {
                Some(Ok(entry)) => self.visit(entry),
                Some(Err(e)) => warn!("폴더 순회 중 항목 건너뜀: {}", e),
                None => {
                    self.close_until(0);
                    return self.pending.pop_front();
                }
            }
        }
    }
}
