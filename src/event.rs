//! 애플리케이션에 보고되는 수신 이벤트

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::mac::MacAddr;

/// 이벤트 수신기 타입
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// 이벤트 송신기 타입
pub type EventSender = mpsc::UnboundedSender<Event>;

/// 수신 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// 텍스트 메시지
    TextReceived { from: MacAddr, text: String },

    /// UTF-8이 아닌 텍스트 (버려짐)
    TextCorrupted { from: MacAddr },

    /// 파일 수신 시작
    FileStarted {
        from: MacAddr,
        name: String,
        size: u64,
        path: PathBuf,
    },

    /// 파일 수신 종료 (FILE_END)
    FileReceived {
        from: MacAddr,
        name: String,
        path: PathBuf,
        bytes_received: u64,
        declared_size: u64,
    },

    /// 새 FILE_START 때문에 닫힌 미완료 파일
    FileAbandoned {
        from: MacAddr,
        name: String,
        path: PathBuf,
        bytes_received: u64,
    },

    /// 폴더 생성
    FolderStarted { from: MacAddr, path: PathBuf },

    /// 폴더 하나 완료
    FolderCompleted { from: MacAddr, path: PathBuf },

    /// 폴더 전송 전체 완료 (스택이 비었음)
    FolderTransferCompleted { from: MacAddr, root: PathBuf },

    /// 피어 발견 (요청 또는 응답)
    PeerDiscovered { peer: MacAddr, username: String },
}

impl Event {
    /// 파일이 선언된 크기만큼 도착했는지 (FileReceived 외에는 None)
    pub fn is_complete(&self) -> Option<bool> {
        match self {
            Event::FileReceived {
                bytes_received,
                declared_size,
                ..
            } => Some(bytes_received == declared_size),
            _ => None,
        }
    }
}
