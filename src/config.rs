//! 프로토콜 설정
//!
//! 기본값 → TOML 파일 → 환경 변수 순서로 덮어쓴다.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mac::MacAddr;
use crate::packet::{FILE_DATA_OVERHEAD, MAX_PAYLOAD_LEN};
use crate::{Error, Result, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES};

/// 청크 최대 크기: FILE_DATA 페이로드가 16비트 길이에 들어가야 함
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD_LEN - FILE_DATA_OVERHEAD;

/// Link-Chat 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 탐색 요청/응답에 쓰이는 사용자 이름
    /// 없으면 DISCOVERY_REQUEST에 응답하지 않음
    pub username: Option<String>,

    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// ACK 대기 타임아웃 (밀리초, 시도 1회당)
    pub ack_timeout_ms: u64,

    /// 조각당 최대 전송 시도 횟수
    pub max_retries: u32,

    /// 수신 파일 저장 위치
    pub download_dir: PathBuf,

    /// 리스너 수신 큐 크기 (프레임 수)
    pub inbound_queue: usize,

    /// UDP 에뮬레이션 세그먼트 설정 (바이너리용)
    pub segment: SegmentConfig,
}

/// UDP로 에뮬레이션한 L2 세그먼트 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmentConfig {
    /// 이 노드의 MAC 주소
    pub mac: Option<MacAddr>,

    /// UDP 바인드 주소
    pub bind: SocketAddr,

    /// 세그먼트 구성원 (모든 프레임이 이 주소들로 복제됨)
    pub members: Vec<SocketAddr>,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            mac: None,
            bind: SocketAddr::from(([0, 0, 0, 0], 47_800)),
            members: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            chunk_size: DEFAULT_CHUNK_SIZE,        // 1KB, 이더넷 MTU 이하
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS, // 2초
            max_retries: DEFAULT_MAX_RETRIES,       // 3회
            download_dir: PathBuf::from("."),
            inbound_queue: 1024,
            segment: SegmentConfig::default(),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// 조각 하나가 최악의 경우 기다리는 시간
    pub fn worst_case_fragment_wait(&self) -> Duration {
        self.ack_timeout() * self.max_retries
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk_size는 1..={} 범위여야 함 (got {})",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries는 1 이상이어야 함".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(Error::InvalidConfig("ack_timeout_ms는 0보다 커야 함".into()));
        }
        if self.inbound_queue == 0 {
            return Err(Error::InvalidConfig("inbound_queue는 0보다 커야 함".into()));
        }
        if let Some(name) = &self.username {
            if name.len() > MAX_PAYLOAD_LEN {
                return Err(Error::InvalidConfig("username이 너무 김".into()));
            }
        }
        Ok(())
    }

    /// 손실이 많은 링크용 설정
    pub fn lossy_link() -> Self {
        Self {
            chunk_size: 512,      // 작은 청크
            ack_timeout_ms: 3000, // 3초
            max_retries: 6,
            ..Self::default()
        }
    }

    /// 조용한 로컬 LAN용 설정
    pub fn fast_lan() -> Self {
        Self {
            chunk_size: 1400, // 1500 MTU - 헤더 여유
            ack_timeout_ms: 500,
            max_retries: 3,
            inbound_queue: 4096,
            ..Self::default()
        }
    }
}

/// 환경 변수 이름
pub const ENV_USERNAME: &str = "LINKCHAT_USERNAME";
pub const ENV_DOWNLOAD_DIR: &str = "LINKCHAT_DOWNLOAD_DIR";
pub const ENV_CHUNK_SIZE: &str = "LINKCHAT_CHUNK_SIZE";
pub const ENV_ACK_TIMEOUT_MS: &str = "LINKCHAT_ACK_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "LINKCHAT_MAX_RETRIES";

/// 설정 로드: 기본값 → 파일(있으면) → 환경 변수
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => from_file(p)?,
        None => Config::default(),
    };
    apply_env(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// TOML 파일에서 설정 읽기
pub fn from_file(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)?;
    from_toml(&text)
}

pub fn from_toml(text: &str) -> Result<Config> {
    Ok(toml::from_str(text)?)
}

/// 환경 변수 덮어쓰기. 파싱 불가한 값은 무시한다.
fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(name) = var(ENV_USERNAME).filter(|s| !s.is_empty()) {
        config.username = Some(name);
    }
    if let Some(dir) = var(ENV_DOWNLOAD_DIR) {
        config.download_dir = PathBuf::from(dir);
    }
    if let Some(n) = var(ENV_CHUNK_SIZE).and_then(|s| s.parse().ok()) {
        config.chunk_size = n;
    }
    if let Some(n) = var(ENV_ACK_TIMEOUT_MS).and_then(|s| s.parse().ok()) {
        config.ack_timeout_ms = n;
    }
    if let Some(n) = var(ENV_MAX_RETRIES).and_then(|s| s.parse().ok()) {
        config.max_retries = n;
    }
}
