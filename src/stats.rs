//! 전송 통계

use std::time::{Duration, Instant};

/// 송신 측 누적 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송한 파일 수 (FILE_END까지 보낸 것)
    pub files_sent: u64,

    /// 전송한 폴더 트리 수
    pub folders_sent: u64,

    /// 파일 데이터 바이트 (재전송 제외)
    pub total_bytes: u64,

    /// FILE_DATA 전송 시도 수 (재전송 포함)
    pub fragments_sent: u64,

    /// 재전송 수
    pub retransmitted_fragments: u64,

    /// ACK 받은 조각 수
    pub confirmed_fragments: u64,

    /// 재시도를 모두 소진한 조각 수
    pub unconfirmed_fragments: u64,

    /// 받은 NACK 수
    pub total_nacks: u64,

    /// ACK 타임아웃 수
    pub total_timeouts: u64,

    /// 마지막 NACK 시간
    pub last_nack_time: Option<Instant>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            files_sent: 0,
            folders_sent: 0,
            total_bytes: 0,
            fragments_sent: 0,
            retransmitted_fragments: 0,
            confirmed_fragments: 0,
            unconfirmed_fragments: 0,
            total_nacks: 0,
            total_timeouts: 0,
            last_nack_time: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.fragments_sent == 0 {
            return 0.0;
        }
        self.retransmitted_fragments as f64 / self.fragments_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Files: {} | Bytes: {} | Fragments: {} ({} confirmed, {} unconfirmed) | Retransmit: {:.1}% | NACKs: {} | Timeouts: {}",
            self.elapsed().as_secs_f64(),
            self.files_sent,
            self.total_bytes,
            self.fragments_sent,
            self.confirmed_fragments,
            self.unconfirmed_fragments,
            self.retransmit_ratio() * 100.0,
            self.total_nacks,
            self.total_timeouts,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 수신 측 누적 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    /// 받은 텍스트 메시지 수
    pub messages: u64,

    /// 완료된 파일 수
    pub files_completed: u64,

    /// 받아들인 조각 수
    pub fragments_accepted: u64,

    /// 다시 온 조각 (ACK 유실로 인한 재전송)
    pub duplicate_fragments: u64,

    /// CRC 불일치로 NACK한 조각 수
    pub checksum_failures: u64,

    /// 세션 없이 도착한 FILE_DATA 등 프로토콜 위반
    pub protocol_violations: u64,

    /// 헤더/페이로드 손상으로 버린 패킷 수
    pub malformed_packets: u64,

    /// 기록한 바이트
    pub bytes_written: u64,
}

impl ReceiveStats {
    pub fn summary(&self) -> String {
        format!(
            "Messages: {} | Files: {} | Bytes: {} | Fragments: {} (+{} duplicate) | CRC failures: {} | Violations: {} | Malformed: {}",
            self.messages,
            self.files_completed,
            self.bytes_written,
            self.fragments_accepted,
            self.duplicate_fragments,
            self.checksum_failures,
            self.protocol_violations,
            self.malformed_packets,
        )
    }
}
