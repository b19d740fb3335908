//! # Link-Chat
//!
//! 이더넷 프레임 위에서 직접 동작하는 2계층 메시징 프로토콜
//!
//! ## 핵심 특징
//! - **3바이트 헤더**: 패킷 타입 + 페이로드 길이 (빅엔디언)
//! - **stop-and-wait 전송**: 조각마다 CRC32, ACK/NACK, 제한된 재시도
//! - **폴더 전송**: FOLDER_START / FILE / FOLDER_END 이벤트로 구조 재현
//! - **피어별 세션**: MAC 주소마다 독립된 파일/폴더 수신 상태
//! - **피어 탐색**: 브로드캐스트 요청, 유니캐스트 응답
//!
//! 실제 raw 소켓 I/O는 `transport::Transport` 뒤에 숨겨져 있다.

pub mod ack;
pub mod chunk;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod mac;
pub mod node;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transport;
pub mod walker;

pub use ack::{AckOutcome, PendingAcks};
pub use chunk::{checksum, verify_checksum, Chunk, ChunkReader, SeqNum};
pub use config::Config;
pub use discovery::{DiscoveredPeer, PeerDirectory};
pub use error::{Error, Result};
pub use event::{Event, EventReceiver};
pub use mac::MacAddr;
pub use node::Node;
pub use packet::{decode_header, encode_header, Header, Packet, PacketType, HEADER_SIZE};
pub use receiver::{Dispatcher, Listener};
pub use sender::{Delivery, FileReport, FolderReport, Sender, TransferHandle};
pub use session::SessionRegistry;
pub use stats::{ReceiveStats, TransferStats};
pub use transport::{Frame, Inbound, MemoryHub, Transport, UdpSegment};
pub use walker::{walk, FolderEvent};

/// 프로토콜 EtherType
pub const ETHER_TYPE: u16 = 0x1234;

/// 기본 조각 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// 기본 ACK 대기 시간 (밀리초)
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;

/// 기본 최대 전송 시도 횟수
pub const DEFAULT_MAX_RETRIES: u32 = 3;
