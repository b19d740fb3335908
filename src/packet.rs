//! Link-Chat 패킷 정의
//!
//! 모든 패킷은 3바이트 헤더 + 페이로드로 구성된다.
//!
//! ```text
//! +--------+----------------+-----------------------+
//! | type 1B| payload_len 2B | payload (payload_len) |
//! +--------+----------------+-----------------------+
//! ```
//!
//! 모든 정수는 big-endian (network order).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::Chunk;
use crate::{Error, Result};

/// 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 3;

/// 페이로드 최대 크기 (16비트 길이 필드)
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// FILE_DATA 페이로드에서 청크 앞에 붙는 필드 크기 (seq 2B + crc 4B)
pub const FILE_DATA_OVERHEAD: usize = 2 + 4;

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// 텍스트 메시지
    Text = 0x01,

    /// 파일 전송 시작 (이름 + 크기)
    FileStart = 0x02,

    /// 파일 조각
    FileData = 0x03,

    /// 파일 전송 종료
    FileEnd = 0x04,

    /// 브로드캐스트 피어 탐색 요청
    DiscoveryRequest = 0x05,

    /// 탐색 응답 (유니캐스트)
    DiscoveryResponse = 0x06,

    /// 조각 수신 확인
    FileAck = 0x07,

    /// 조각 손상 알림
    FileNack = 0x08,

    /// 폴더 시작 (상대 경로)
    FolderStart = 0x09,

    /// 폴더 종료
    FolderEnd = 0x0A,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let packet_type = match value {
            0x01 => PacketType::Text,
            0x02 => PacketType::FileStart,
            0x03 => PacketType::FileData,
            0x04 => PacketType::FileEnd,
            0x05 => PacketType::DiscoveryRequest,
            0x06 => PacketType::DiscoveryResponse,
            0x07 => PacketType::FileAck,
            0x08 => PacketType::FileNack,
            0x09 => PacketType::FolderStart,
            0x0A => PacketType::FolderEnd,
            other => return Err(Error::UnknownPacketType(other)),
        };
        Ok(packet_type)
    }
}

/// 패킷 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub payload_len: u16,
}

/// 헤더 인코딩
pub fn encode_header(packet_type: PacketType, payload_len: u16) -> [u8; HEADER_SIZE] {
    let [hi, lo] = payload_len.to_be_bytes();
    [packet_type as u8, hi, lo]
}

/// 헤더 디코딩
///
/// 3바이트 미만이면 `MalformedHeader`.
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::MalformedHeader {
            expected: HEADER_SIZE,
            got: bytes.len(),
        });
    }

    Ok(Header {
        packet_type: PacketType::try_from(bytes[0])?,
        payload_len: u16::from_be_bytes([bytes[1], bytes[2]]),
    })
}

/// 디코딩된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Text(String),
    FileStart { name: String, size: u64 },
    FileData(Chunk),
    FileEnd,
    FolderStart { path: String },
    FolderEnd,
    FileAck { seq: u16 },
    FileNack { seq: u16 },
    DiscoveryRequest { username: String },
    DiscoveryResponse { username: String },
}

impl Packet {
    /// 패킷 타입 반환
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Text(_) => PacketType::Text,
            Packet::FileStart { .. } => PacketType::FileStart,
            Packet::FileData(_) => PacketType::FileData,
            Packet::FileEnd => PacketType::FileEnd,
            Packet::FolderStart { .. } => PacketType::FolderStart,
            Packet::FolderEnd => PacketType::FolderEnd,
            Packet::FileAck { .. } => PacketType::FileAck,
            Packet::FileNack { .. } => PacketType::FileNack,
            Packet::DiscoveryRequest { .. } => PacketType::DiscoveryRequest,
            Packet::DiscoveryResponse { .. } => PacketType::DiscoveryResponse,
        }
    }

    /// 헤더를 포함한 전체 패킷 직렬화
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();

        match self {
            Packet::Text(text) => payload.put_slice(text.as_bytes()),
            Packet::FileStart { name, size } => {
                put_prefixed(&mut payload, "file name", name.as_bytes())?;
                payload.put_u64(*size);
            }
            Packet::FileData(chunk) => {
                payload.reserve(FILE_DATA_OVERHEAD + chunk.data.len());
                payload.put_u16(chunk.seq);
                payload.put_u32(chunk.checksum);
                payload.put_slice(&chunk.data);
            }
            Packet::FolderStart { path } => {
                put_prefixed(&mut payload, "folder path", path.as_bytes())?;
            }
            Packet::FileAck { seq } | Packet::FileNack { seq } => payload.put_u16(*seq),
            Packet::DiscoveryRequest { username } | Packet::DiscoveryResponse { username } => {
                payload.put_slice(username.as_bytes())
            }
            Packet::FileEnd | Packet::FolderEnd => {}
        }

        let payload_len = checked_u16("payload", payload.len())?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&encode_header(self.packet_type(), payload_len));
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// 프레임 페이로드에서 패킷 역직렬화
    ///
    /// 헤더의 길이 필드가 기준이다. 뒤에 붙은 바이트(이더넷 패딩)는 무시한다.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = decode_header(frame)?;
        let packet = header.packet_type;
        let expected = header.payload_len as usize;
        let available = frame.len() - HEADER_SIZE;

        let body = frame
            .get(HEADER_SIZE..HEADER_SIZE + expected)
            .ok_or(Error::Truncated {
                packet,
                expected,
                got: available,
            })?;

        decode_payload(packet, body)
    }
}

fn decode_payload(packet: PacketType, mut body: &[u8]) -> Result<Packet> {
    let decoded = match packet {
        PacketType::Text => Packet::Text(utf8(packet, body)?),

        PacketType::FileStart => {
            let name = take_prefixed(packet, &mut body)?;
            require(packet, body, 8)?;
            Packet::FileStart {
                name,
                size: body.get_u64(),
            }
        }

        PacketType::FileData => {
            require(packet, body, FILE_DATA_OVERHEAD)?;
            let seq = body.get_u16();
            let checksum = body.get_u32();
            Packet::FileData(Chunk {
                seq,
                checksum,
                data: Bytes::copy_from_slice(body),
            })
        }

        PacketType::FileEnd => Packet::FileEnd,

        PacketType::FolderStart => Packet::FolderStart {
            path: take_prefixed(packet, &mut body)?,
        },

        PacketType::FolderEnd => Packet::FolderEnd,

        PacketType::FileAck => {
            require(packet, body, 2)?;
            Packet::FileAck { seq: body.get_u16() }
        }

        PacketType::FileNack => {
            require(packet, body, 2)?;
            Packet::FileNack { seq: body.get_u16() }
        }

        PacketType::DiscoveryRequest => Packet::DiscoveryRequest {
            username: utf8(packet, body)?,
        },

        PacketType::DiscoveryResponse => Packet::DiscoveryResponse {
            username: utf8(packet, body)?,
        },
    };

    Ok(decoded)
}

fn checked_u16(field: &'static str, len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::LengthOverflow {
        field,
        len,
        max: MAX_PAYLOAD_LEN,
    })
}

/// `[2바이트 길이][바이트]` 쓰기
fn put_prefixed(buf: &mut BytesMut, field: &'static str, bytes: &[u8]) -> Result<()> {
    buf.put_u16(checked_u16(field, bytes.len())?);
    buf.put_slice(bytes);
    Ok(())
}

/// `[2바이트 길이][UTF-8]` 읽기. 길이가 남은 내용보다 크면 에러.
fn take_prefixed(packet: PacketType, body: &mut &[u8]) -> Result<String> {
    require(packet, body, 2)?;
    let len = body.get_u16() as usize;
    require(packet, body, len)?;

    let text = utf8(packet, &body[..len])?;
    body.advance(len);
    Ok(text)
}

fn require(packet: PacketType, body: &[u8], expected: usize) -> Result<()> {
    if body.len() < expected {
        return Err(Error::Truncated {
            packet,
            expected,
            got: body.len(),
        });
    }
    Ok(())
}

fn utf8(packet: PacketType, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8 { packet })
}
