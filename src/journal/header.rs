use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::block::BlockSize;
use crate::{ErrorKind, Result};

/// セグメントの先頭に書き込まれるマジックナンバー.
///
/// "**S**egmented **J**ournal"の略.
pub const MAGIC_NUMBER: [u8; 4] = *b"sjnl";

/// セグメントフォーマットの現在のメジャーバージョン.
///
/// メジャーバージョンが異なるセグメント同士のデータ形式には互換性が無い.
pub const MAJOR_VERSION: u16 = 1;

/// セグメントフォーマットの現在のマイナーバージョン.
///
/// マイナーバージョンには、後方互換性がある.
pub const MINOR_VERSION: u16 = 0;

/// ヘッダを表現するのに必要なバイト数.
const HEADER_SIZE: u16 =
    2 /* major_version */ +
    2 /* minor_version */ +
    8 /* segment_id */ +
    8 /* created_at */ +
    16 /* UUID */ +
    4 /* block_size */;

/// **マジックナンバー** と **ヘッダサイズ** 、 **チェックサム** も含めたサイズ.
pub const FULL_HEADER_SIZE: u16 = 4 + 2 + HEADER_SIZE + 4;

/// セグメントのヘッダ情報.
///
/// セグメントの作成時(ないし再利用時)に、レコード群よりも先に書き込まれる.
/// ヘッダが読み込めないセグメントは「作成途中でクラッシュしたもの」とみなされる.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// メジャーバージョン.
    pub major_version: u16,

    /// マイナーバージョン.
    pub minor_version: u16,

    /// セグメントの順序ID.
    ///
    /// セグメントの作成(ないし再利用)の度に単調増加する値が割り当てられ、リカバリ時の再生順序を決定する.
    pub segment_id: u64,

    /// セグメントの作成時刻(UNIXエポックからのミリ秒).
    pub created_at: u64,

    /// ジャーナルの特定のインスタンスを識別するためのUUID.
    pub instance_uuid: Uuid,

    /// セグメントのブロックサイズ.
    pub block_size: BlockSize,
}
impl SegmentHeader {
    /// 現在時刻をタイムスタンプに持つ、新しいヘッダを生成する.
    pub fn new(segment_id: u64, instance_uuid: Uuid, block_size: BlockSize) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() * 1000 + u64::from(d.subsec_millis()))
            .unwrap_or(0);
        SegmentHeader {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            segment_id,
            created_at,
            instance_uuid,
            block_size,
        }
    }

    /// ヘッダ領域のサイズを返す.
    ///
    /// **ヘッダ領域** には、ヘッダ本体と、領域のサイズをブロック境界に揃えるためのパディングが含まれる.
    /// 最初のレコードは、この位置から書き込まれる.
    pub fn region_size(&self) -> u64 {
        Self::calc_region_size(self.block_size)
    }

    /// 指定されたブロックサイズを有するセグメントのために必要な、ヘッダ領域のサイズを計算する.
    pub fn calc_region_size(block_size: BlockSize) -> u64 {
        block_size.ceil_align(u64::from(FULL_HEADER_SIZE))
    }

    /// ヘッダ情報を`reader`から読み込む.
    ///
    /// # Errors
    ///
    /// マジックナンバーやチェックサムが一致しない場合、およびバージョンに互換性がない場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = [0; FULL_HEADER_SIZE as usize];
        track_io!(reader.read_exact(&mut bytes))?;

        let body_end = FULL_HEADER_SIZE as usize - 4;
        let checksum = BigEndian::read_u32(&bytes[body_end..]);
        track_assert_eq!(&bytes[..4], &MAGIC_NUMBER[..], ErrorKind::InvalidInput);
        track_assert_eq!(
            RollingAdler32::from_buffer(&bytes[..body_end]).hash(),
            checksum,
            ErrorKind::InvalidInput,
            "Header checksum"
        );

        let mut reader = &bytes[4..body_end];
        let header_size = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert_eq!(header_size, HEADER_SIZE, ErrorKind::InvalidInput);

        let major_version = track_io!(reader.read_u16::<BigEndian>())?;
        let minor_version = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert_eq!(
            major_version,
            MAJOR_VERSION,
            ErrorKind::InvalidInput,
            "Unsupported major version",
        );
        track_assert!(
            minor_version <= MINOR_VERSION,
            ErrorKind::InvalidInput,
            "Unsupported minor version: actual={}, supported={}",
            minor_version,
            MINOR_VERSION
        );

        let segment_id = track_io!(reader.read_u64::<BigEndian>())?;
        let created_at = track_io!(reader.read_u64::<BigEndian>())?;

        let mut instance_uuid = [0; 16];
        track_io!(reader.read_exact(&mut instance_uuid))?;
        let instance_uuid = Uuid::from_bytes(instance_uuid);

        let block_size = track_io!(reader.read_u32::<BigEndian>())?;
        let block_size = track!(BlockSize::new(block_size), "block_size:{}", block_size)?;

        Ok(SegmentHeader {
            major_version,
            minor_version,
            segment_id,
            created_at,
            instance_uuid,
            block_size,
        })
    }

    /// ヘッダ情報を`writer`に書き込む.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let mut buf = Vec::with_capacity(FULL_HEADER_SIZE as usize);
        buf.extend_from_slice(&MAGIC_NUMBER[..]);
        track_io!(buf.write_u16::<BigEndian>(HEADER_SIZE))?;
        track_io!(buf.write_u16::<BigEndian>(self.major_version))?;
        track_io!(buf.write_u16::<BigEndian>(self.minor_version))?;
        track_io!(buf.write_u64::<BigEndian>(self.segment_id))?;
        track_io!(buf.write_u64::<BigEndian>(self.created_at))?;
        buf.extend_from_slice(self.instance_uuid.as_bytes());
        track_io!(buf.write_u32::<BigEndian>(self.block_size.as_u32()))?;

        let checksum = RollingAdler32::from_buffer(&buf).hash();
        track_io!(buf.write_u32::<BigEndian>(checksum))?;
        track_io!(writer.write_all(&buf))?;
        Ok(())
    }

    /// ヘッダ領域を`writer`に書き込む.
    ///
    /// ヘッダ領域(サイズは`self.region_size()`)の未使用部分に0-パディングを行う以外は、
    /// `write_to`メソッドと同様.
    pub fn write_header_region_to<W: Write>(&self, mut writer: W) -> Result<()> {
        track!(self.write_to(&mut writer))?;

        let padding = vec![0; self.region_size() as usize - FULL_HEADER_SIZE as usize];
        track_io!(writer.write_all(&padding))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn it_works() -> TestResult {
        let header = SegmentHeader::new(42, Uuid::new_v4(), track!(BlockSize::new(512))?);
        assert_eq!(header.region_size(), 512);
        assert!(header.created_at > 0);

        let mut buf = Vec::new();
        track!(header.write_header_region_to(&mut buf))?;
        assert_eq!(buf.len(), 512);

        let h = track!(SegmentHeader::read_from(&buf[..]))?;
        assert_eq!(h, header);
        Ok(())
    }

    #[test]
    fn unaligned_region_size() {
        let header = SegmentHeader::new(1, Uuid::new_v4(), BlockSize::min());
        assert_eq!(header.region_size(), u64::from(FULL_HEADER_SIZE));
    }

    #[test]
    fn partially_written_header_is_rejected() -> TestResult {
        let header = SegmentHeader::new(7, Uuid::new_v4(), BlockSize::min());
        let mut buf = Vec::new();
        track!(header.write_to(&mut buf))?;

        // 作成途中のセグメント
        let mut torn = buf.clone();
        for b in &mut torn[20..] {
            *b = 0;
        }
        assert!(SegmentHeader::read_from(&torn[..]).is_err());

        // 全てゼロ
        assert!(SegmentHeader::read_from(&[0; 64][..]).is_err());
        Ok(())
    }

    #[test]
    fn compatibility_check_works() -> TestResult {
        let mut header = SegmentHeader::new(7, Uuid::new_v4(), BlockSize::min());

        // Higher minor version: NG
        header.minor_version = MINOR_VERSION + 1;
        let mut buf = Vec::new();
        track!(header.write_to(&mut buf))?;
        assert!(SegmentHeader::read_from(&buf[..]).is_err());

        // Higher major version: NG
        header.minor_version = MINOR_VERSION;
        header.major_version = MAJOR_VERSION + 1;
        let mut buf = Vec::new();
        track!(header.write_to(&mut buf))?;
        assert!(SegmentHeader::read_from(&buf[..]).is_err());
        Ok(())
    }
}
