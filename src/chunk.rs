//! 파일 조각(청크) 정의
//!
//! - Chunk: FILE_DATA 패킷 하나에 실리는 조각 (seq + CRC32 + 데이터)
//! - ChunkReader: 바이트 스트림을 고정 크기 청크로 분할 (송신측)

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// 청크 순번 (파일마다 1부터 시작)
pub type SeqNum = u16;

/// 첫 청크의 순번
pub const FIRST_SEQ: SeqNum = 1;

/// CRC32 체크섬 (순번은 포함하지 않고 데이터만)
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 체크섬 검증
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    checksum(data) == expected
}

/// 청크 (FILE_DATA 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 순번
    pub seq: SeqNum,

    /// 데이터의 CRC32
    pub checksum: u32,

    /// 실제 데이터
    pub data: Bytes,
}

impl Chunk {
    /// 새 청크 생성 (체크섬 계산 포함)
    pub fn new(seq: SeqNum, data: Bytes) -> Self {
        Self {
            seq,
            checksum: checksum(&data),
            data,
        }
    }

    /// CRC 검증
    pub fn verify(&self) -> bool {
        verify_checksum(&self.data, self.checksum)
    }

    /// CRC 검증 (불일치 시 기대값/실제값을 담은 에러)
    pub fn check(&self) -> Result<()> {
        let actual = checksum(&self.data);
        if actual != self.checksum {
            return Err(Error::ChecksumMismatch {
                seq: self.seq,
                expected: self.checksum,
                got: actual,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 메모리상의 데이터를 청크들로 분할
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let mut seq = FIRST_SEQ;
    data.chunks(chunk_size.max(1))
        .map(|piece| {
            let chunk = Chunk::new(seq, Bytes::copy_from_slice(piece));
            seq = seq.wrapping_add(1);
            chunk
        })
        .collect()
}

/// 비동기 리더에서 청크를 순서대로 읽어오는 분할기 (송신측)
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    next_seq: SeqNum,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            next_seq: FIRST_SEQ,
            done: false,
        }
    }

    /// 다음 청크 읽기. 스트림 끝이면 None.
    ///
    /// 마지막 청크를 제외한 모든 청크는 정확히 `chunk_size` 바이트다.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = BytesMut::zeroed(self.chunk_size);
        let mut filled = 0;

        // read()는 요청보다 적게 돌려줄 수 있으므로 가득 찰 때까지 반복
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk::new(self.next_seq, buf.freeze());
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(Some(chunk))
    }
}
