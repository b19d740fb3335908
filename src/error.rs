//! 에러 타입 정의

use std::path::PathBuf;

use thiserror::Error;

use crate::packet::PacketType;

/// Link-Chat 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("헤더 손상: 최소 {expected} 바이트 필요, got {got}")]
    MalformedHeader { expected: usize, got: usize },

    #[error("알 수 없는 패킷 타입: 0x{0:02X}")]
    UnknownPacketType(u8),

    #[error("페이로드 잘림 ({packet:?}): expected {expected} bytes, got {got}")]
    Truncated {
        packet: PacketType,
        expected: usize,
        got: usize,
    },

    #[error("UTF-8 디코딩 실패 ({packet:?})")]
    InvalidUtf8 { packet: PacketType },

    #[error("{field} 길이 초과: {len} > {max}")]
    LengthOverflow {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("CRC 불일치: seq={seq}, expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { seq: u16, expected: u32, got: u32 },

    #[error("파일 없음: {0}")]
    FileNotFound(PathBuf),

    #[error("디렉터리가 아님: {0}")]
    NotADirectory(PathBuf),

    #[error("안전하지 않은 경로: {0:?}")]
    UnsafePath(String),

    #[error("설정 누락: {0}")]
    NotConfigured(&'static str),

    #[error("유효하지 않은 MAC 주소: {0:?}")]
    InvalidMacAddress(String),

    #[error("설정 파일 파싱 에러: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("전송 계층 에러: {0}")]
    Transport(String),

    #[error("전송 취소됨")]
    Cancelled,

    #[error("채널 에러")]
    ChannelError,
}

impl Error {
    /// 수신 측에서 패킷 하나만 버리고 계속 진행해도 되는 입력 손상 에러인지
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Error::MalformedHeader { .. }
                | Error::UnknownPacketType(_)
                | Error::Truncated { .. }
                | Error::InvalidUtf8 { .. }
                | Error::ChecksumMismatch { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
