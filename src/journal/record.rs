use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};
use trackable::error::ErrorKindExt;

use crate::block::BlockSize;
use crate::{Error, ErrorKind, Result};

/// レコードの先頭部分のサイズ: `kind(1) + segment_id(8) + body_len(4)`
pub const FRAME_HEADER_SIZE: usize = 1 + 8 + 4;

/// レコードの末尾に付与されるチェックサムのサイズ.
pub const CHECKSUM_SIZE: usize = 4;

const KIND_END_OF_RECORDS: u8 = 0;
const KIND_ADD: u8 = 11;
const KIND_UPDATE: u8 = 12;
const KIND_DELETE: u8 = 13;
const KIND_ADD_TX: u8 = 14;
const KIND_UPDATE_TX: u8 = 15;
const KIND_DELETE_TX: u8 = 16;
const KIND_PREPARE: u8 = 17;
const KIND_COMMIT: u8 = 18;
const KIND_ROLLBACK: u8 = 19;

/// トランザクションのレコードが、どのセグメントに何個書き込まれたか、の要約.
///
/// プリペアおよびコミットレコードに埋め込まれ、リカバリ時の健全性検査に使われる.
pub type TransactionSummary = Vec<(u64, u32)>;

/// セグメントに追記されるレコード.
///
/// 物理的には、以下の形式で書き込まれる:
///
/// ```text
/// [kind:u8][segment_id:u64][body_len:u32][body][checksum:u32][padding]
/// ```
///
/// `segment_id`は、書き込み先セグメントの順序ID.
/// 再利用されたセグメントに残っている古いレコードを、現在のレコードと区別するために使われる.
///
/// `checksum`は`kind`から`body`までのadler32.
/// 末尾は、セグメントのブロックサイズ境界まで、ゼロで埋められる.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord<T> {
    Add {
        record_id: u64,
        record_type: u8,
        payload: T,
    },
    Update {
        record_id: u64,
        record_type: u8,
        payload: T,
    },
    Delete {
        record_id: u64,
    },
    AddTx {
        tx_id: u64,
        record_id: u64,
        record_type: u8,
        payload: T,
    },
    UpdateTx {
        tx_id: u64,
        record_id: u64,
        record_type: u8,
        payload: T,
    },
    DeleteTx {
        tx_id: u64,
        record_id: u64,
    },
    Prepare {
        tx_id: u64,
        summary: TransactionSummary,
        xid: T,
    },
    Commit {
        tx_id: u64,
        summary: TransactionSummary,
    },
    Rollback {
        tx_id: u64,
    },
}
impl<T: AsRef<[u8]>> JournalRecord<T> {
    /// 本体部分のサイズ（バイト数）を返す.
    pub fn body_size(&self) -> usize {
        match *self {
            JournalRecord::Add { ref payload, .. } | JournalRecord::Update { ref payload, .. } => {
                8 + 1 + 4 + payload.as_ref().len()
            }
            JournalRecord::Delete { .. } => 8,
            JournalRecord::AddTx { ref payload, .. }
            | JournalRecord::UpdateTx { ref payload, .. } => 8 + 8 + 1 + 4 + payload.as_ref().len(),
            JournalRecord::DeleteTx { .. } => 8 + 8,
            JournalRecord::Prepare {
                ref summary,
                ref xid,
                ..
            } => 8 + summary_size(summary) + 4 + xid.as_ref().len(),
            JournalRecord::Commit { ref summary, .. } => 8 + summary_size(summary),
            JournalRecord::Rollback { .. } => 8,
        }
    }

    /// アライメント前の、レコード全体のサイズを返す.
    pub fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_size() + CHECKSUM_SIZE
    }

    /// 書き込み時のサイズ（バイト数）を返す.
    ///
    /// `block_size`の境界に切り上げられた値となる.
    pub fn external_size(&self, block_size: BlockSize) -> u64 {
        block_size.ceil_align(self.frame_size() as u64)
    }

    /// `segment_id`のセグメントに書き込むものとして、`writer`にレコードを書き込む.
    ///
    /// パディングは書き込まれない.
    pub fn write_to<W: Write>(&self, segment_id: u64, mut writer: W) -> Result<()> {
        let mut buf = Vec::with_capacity(self.frame_size());
        buf.push(self.kind());
        track_io!(buf.write_u64::<BigEndian>(segment_id))?;
        track_io!(buf.write_u32::<BigEndian>(self.body_size() as u32))?;
        track!(self.write_body(&mut buf))?;

        let checksum = RollingAdler32::from_buffer(&buf).hash();
        track_io!(buf.write_u32::<BigEndian>(checksum))?;
        track_io!(writer.write_all(&buf))?;
        Ok(())
    }

    fn kind(&self) -> u8 {
        match *self {
            JournalRecord::Add { .. } => KIND_ADD,
            JournalRecord::Update { .. } => KIND_UPDATE,
            JournalRecord::Delete { .. } => KIND_DELETE,
            JournalRecord::AddTx { .. } => KIND_ADD_TX,
            JournalRecord::UpdateTx { .. } => KIND_UPDATE_TX,
            JournalRecord::DeleteTx { .. } => KIND_DELETE_TX,
            JournalRecord::Prepare { .. } => KIND_PREPARE,
            JournalRecord::Commit { .. } => KIND_COMMIT,
            JournalRecord::Rollback { .. } => KIND_ROLLBACK,
        }
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        match *self {
            JournalRecord::Add {
                record_id,
                record_type,
                ref payload,
            }
            | JournalRecord::Update {
                record_id,
                record_type,
                ref payload,
            } => {
                track!(write_data(buf, record_id, record_type, payload.as_ref()))?;
            }
            JournalRecord::Delete { record_id } => {
                track_io!(buf.write_u64::<BigEndian>(record_id))?;
            }
            JournalRecord::AddTx {
                tx_id,
                record_id,
                record_type,
                ref payload,
            }
            | JournalRecord::UpdateTx {
                tx_id,
                record_id,
                record_type,
                ref payload,
            } => {
                track_io!(buf.write_u64::<BigEndian>(tx_id))?;
                track!(write_data(buf, record_id, record_type, payload.as_ref()))?;
            }
            JournalRecord::DeleteTx { tx_id, record_id } => {
                track_io!(buf.write_u64::<BigEndian>(tx_id))?;
                track_io!(buf.write_u64::<BigEndian>(record_id))?;
            }
            JournalRecord::Prepare {
                tx_id,
                ref summary,
                ref xid,
            } => {
                track_io!(buf.write_u64::<BigEndian>(tx_id))?;
                track!(write_summary(buf, summary))?;
                track_io!(buf.write_u32::<BigEndian>(xid.as_ref().len() as u32))?;
                buf.extend_from_slice(xid.as_ref());
            }
            JournalRecord::Commit { tx_id, ref summary } => {
                track_io!(buf.write_u64::<BigEndian>(tx_id))?;
                track!(write_summary(buf, summary))?;
            }
            JournalRecord::Rollback { tx_id } => {
                track_io!(buf.write_u64::<BigEndian>(tx_id))?;
            }
        }
        Ok(())
    }
}
impl JournalRecord<Vec<u8>> {
    /// `bytes`の先頭から、`segment_id`のセグメントに属するレコードを読み込む.
    ///
    /// 成功した場合には、レコードとそのフレームサイズ(パディングを除く)のペアを返す.
    /// 未書き込み領域(種別が`0`)に到達した場合には`Ok(None)`が返される.
    ///
    /// # Errors
    ///
    /// 以下の場合には、種類が`ErrorKind::CorruptRecord`のエラーが返される:
    ///
    /// - 未知の種別
    /// - 宣言されている長さが`bytes`に収まらない
    /// - `segment_id`の不一致 (i.e., 再利用前のセグメントの古いレコード)
    /// - チェックサムの不一致
    /// - 本体部分の形式が不正
    pub fn read_from(bytes: &[u8], segment_id: u64) -> Result<Option<(Self, usize)>> {
        track_assert!(
            bytes.len() >= FRAME_HEADER_SIZE,
            ErrorKind::CorruptRecord,
            "Too short: {} bytes",
            bytes.len()
        );
        let kind = bytes[0];
        if kind == KIND_END_OF_RECORDS {
            return Ok(None);
        }
        track_assert!(
            KIND_ADD <= kind && kind <= KIND_ROLLBACK,
            ErrorKind::CorruptRecord,
            "Unknown journal record kind: {}",
            kind
        );

        let actual_segment_id = BigEndian::read_u64(&bytes[1..]);
        track_assert_eq!(
            actual_segment_id,
            segment_id,
            ErrorKind::CorruptRecord,
            "Stale record"
        );

        let body_len = BigEndian::read_u32(&bytes[9..]) as usize;
        let frame_size = FRAME_HEADER_SIZE + body_len + CHECKSUM_SIZE;
        track_assert!(
            frame_size <= bytes.len(),
            ErrorKind::CorruptRecord,
            "Record length exceeds the segment: body_len={}, remaining={}",
            body_len,
            bytes.len()
        );

        let checksum_offset = FRAME_HEADER_SIZE + body_len;
        let expected = BigEndian::read_u32(&bytes[checksum_offset..]);
        let actual = RollingAdler32::from_buffer(&bytes[..checksum_offset]).hash();
        track_assert_eq!(actual, expected, ErrorKind::CorruptRecord, "Checksum");

        let body = &bytes[FRAME_HEADER_SIZE..checksum_offset];
        let record = track!(Self::read_body(kind, body))?;
        Ok(Some((record, frame_size)))
    }

    fn read_body(kind: u8, mut body: &[u8]) -> Result<Self> {
        let reader = &mut body;
        let record = match kind {
            KIND_ADD => {
                let (record_id, record_type, payload) = track!(read_data(reader))?;
                JournalRecord::Add {
                    record_id,
                    record_type,
                    payload,
                }
            }
            KIND_UPDATE => {
                let (record_id, record_type, payload) = track!(read_data(reader))?;
                JournalRecord::Update {
                    record_id,
                    record_type,
                    payload,
                }
            }
            KIND_DELETE => JournalRecord::Delete {
                record_id: track!(read_u64(reader))?,
            },
            KIND_ADD_TX => {
                let tx_id = track!(read_u64(reader))?;
                let (record_id, record_type, payload) = track!(read_data(reader))?;
                JournalRecord::AddTx {
                    tx_id,
                    record_id,
                    record_type,
                    payload,
                }
            }
            KIND_UPDATE_TX => {
                let tx_id = track!(read_u64(reader))?;
                let (record_id, record_type, payload) = track!(read_data(reader))?;
                JournalRecord::UpdateTx {
                    tx_id,
                    record_id,
                    record_type,
                    payload,
                }
            }
            KIND_DELETE_TX => JournalRecord::DeleteTx {
                tx_id: track!(read_u64(reader))?,
                record_id: track!(read_u64(reader))?,
            },
            KIND_PREPARE => {
                let tx_id = track!(read_u64(reader))?;
                let summary = track!(read_summary(reader))?;
                let xid = track!(read_bytes(reader))?;
                JournalRecord::Prepare {
                    tx_id,
                    summary,
                    xid,
                }
            }
            KIND_COMMIT => JournalRecord::Commit {
                tx_id: track!(read_u64(reader))?,
                summary: track!(read_summary(reader))?,
            },
            KIND_ROLLBACK => JournalRecord::Rollback {
                tx_id: track!(read_u64(reader))?,
            },
            _ => track_panic!(ErrorKind::CorruptRecord, "Unknown kind: {}", kind),
        };
        track_assert_eq!(
            reader.len(),
            0,
            ErrorKind::CorruptRecord,
            "Trailing garbage"
        );
        Ok(record)
    }
}

fn summary_size(summary: &[(u64, u32)]) -> usize {
    4 + summary.len() * (8 + 4)
}

fn write_data(buf: &mut Vec<u8>, record_id: u64, record_type: u8, payload: &[u8]) -> Result<()> {
    track_io!(buf.write_u64::<BigEndian>(record_id))?;
    buf.push(record_type);
    track_io!(buf.write_u32::<BigEndian>(payload.len() as u32))?;
    buf.extend_from_slice(payload);
    Ok(())
}

fn write_summary(buf: &mut Vec<u8>, summary: &[(u64, u32)]) -> Result<()> {
    track_io!(buf.write_u32::<BigEndian>(summary.len() as u32))?;
    for &(segment_id, count) in summary {
        track_io!(buf.write_u64::<BigEndian>(segment_id))?;
        track_io!(buf.write_u32::<BigEndian>(count))?;
    }
    Ok(())
}

fn corrupted(e: io::Error) -> Error {
    track!(Error::from(ErrorKind::CorruptRecord.cause(e)))
}

fn read_u64(reader: &mut &[u8]) -> Result<u64> {
    reader.read_u64::<BigEndian>().map_err(corrupted)
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    reader.read_u32::<BigEndian>().map_err(corrupted)
}

fn read_bytes(reader: &mut &[u8]) -> Result<Vec<u8>> {
    let len = track!(read_u32(reader))? as usize;
    track_assert!(len <= reader.len(), ErrorKind::CorruptRecord);
    let (bytes, rest) = reader.split_at(len);
    *reader = rest;
    Ok(bytes.to_vec())
}

fn read_data(reader: &mut &[u8]) -> Result<(u64, u8, Vec<u8>)> {
    let record_id = track!(read_u64(reader))?;
    let record_type = reader.read_u8().map_err(corrupted)?;
    let payload = track!(read_bytes(reader))?;
    Ok((record_id, record_type, payload))
}

fn read_summary(reader: &mut &[u8]) -> Result<TransactionSummary> {
    let len = track!(read_u32(reader))? as usize;
    track_assert!(len * 12 <= reader.len(), ErrorKind::CorruptRecord);
    let mut summary = Vec::with_capacity(len);
    for _ in 0..len {
        let segment_id = track!(read_u64(reader))?;
        let count = track!(read_u32(reader))?;
        summary.push((segment_id, count));
    }
    Ok(summary)
}
