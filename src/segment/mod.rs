//! セグメントファイルの永続化層のインターフェース定義と実装群.
//!
//! ジャーナル本体は、ここで定義されている[SegmentFactory]と[SegmentStorage]のみを介してI/Oを行う.
//! 実装は、ファイルシステムを用いる[FileSegmentFactory]と、テスト用のメモリ実装である
//! [MemorySegmentFactory]が提供されている.
//!
//! [SegmentFactory]: ./trait.SegmentFactory.html
//! [SegmentStorage]: ./trait.SegmentStorage.html
//! [FileSegmentFactory]: ./struct.FileSegmentFactory.html
//! [MemorySegmentFactory]: ./struct.MemorySegmentFactory.html
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

pub use self::file::{FileSegment, FileSegmentFactory, FileSegmentFactoryBuilder};
pub use self::memory::{MemorySegment, MemorySegmentFactory};

use crate::block::{AlignedBytes, BlockSize};
use crate::{ErrorKind, Result};

#[cfg(test)]
pub(crate) mod faulty;
mod file;
mod memory;

/// 一つのセグメント(固定長の追記専用ファイル)の読み書きを行うためのトレイト.
///
/// 読み書きの際には、位置およびサイズ、が`block_size()`の境界にアライメントされている必要がある.
pub trait SegmentStorage: Read + Write + Seek + Send + fmt::Debug {
    /// セグメントの内容を、物理デバイスに同期する.
    fn sync(&mut self) -> Result<()>;

    /// ロックを保持せずに同期を行うためのハンドルを返す.
    ///
    /// 書き込みを行ったスレッドが、ジャーナルの書き込みロックを解放した後に
    /// 同期完了を待つために使われる.
    fn sync_handle(&self) -> Arc<dyn SyncHandle>;

    /// 読み書き用カーソルの現在位置を返す.
    fn position(&self) -> u64;

    /// セグメントの容量(バイト単位)を返す.
    fn capacity(&self) -> u64;

    /// このインスタンスが要求するブロックサイズを返す.
    fn block_size(&self) -> BlockSize;

    /// `SeekFrom`形式で指定された位置を、開始地点からのオフセットに変換する.
    ///
    /// # Errors
    ///
    /// 「指定位置が容量を超えている」ないし「`0`未満」の場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    fn convert_to_offset(&self, pos: SeekFrom) -> Result<u64> {
        let offset = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => self.capacity() as i64 + delta,
            SeekFrom::Current(delta) => self.position() as i64 + delta,
        };
        track_assert!(0 <= offset, ErrorKind::InvalidInput);
        track_assert!(offset as u64 <= self.capacity(), ErrorKind::InvalidInput);
        Ok(offset as u64)
    }

    /// 指定位置に、アライン済みのバイト列を書き込む.
    fn write_aligned_at(&mut self, offset: u64, bytes: &AlignedBytes) -> Result<()> {
        track_io!(self.seek(SeekFrom::Start(offset)))?;
        track_io!(self.write_all(bytes))?;
        Ok(())
    }

    /// 指定位置から`size`バイトを読み込む.
    ///
    /// `size`はブロック境界に切り上げられた上で読み込まれる.
    fn read_aligned_at(&mut self, offset: u64, size: usize) -> Result<AlignedBytes> {
        let mut buf = AlignedBytes::new(size, self.block_size());
        buf.align();
        track_io!(self.seek(SeekFrom::Start(offset)))?;
        track_io!(self.read_exact(&mut buf))?;
        Ok(buf)
    }
}

/// セグメントの同期(e.g., `fdatasync`)のみを行うためのハンドル.
pub trait SyncHandle: Send + Sync {
    /// 対応するセグメントの内容を物理デバイスに同期する.
    fn sync(&self) -> Result<()>;
}

/// セグメント群の格納場所(e.g., ディレクトリ)を表すトレイト.
///
/// セグメントは名前で識別される.
/// 名前の命名規則はジャーナル側が決定し、実装はそれを解釈しない.
pub trait SegmentFactory: Send + 'static {
    /// セグメントの読み書きに使われる型.
    type Storage: SegmentStorage;

    /// 格納されている全てのセグメントの名前を返す.
    fn list(&self) -> Result<Vec<String>>;

    /// 指定容量のセグメントを新規に作成する.
    ///
    /// 作成直後のセグメントの内容は、全てゼロであることが保証される.
    ///
    /// # Errors
    ///
    /// 同名のセグメントが既に存在する場合にはエラーが返される.
    fn create(&self, name: &str, capacity: u64) -> Result<Self::Storage>;

    /// 既存のセグメントを開く.
    fn open(&self, name: &str) -> Result<Self::Storage>;

    /// セグメントの名前を変更する.
    ///
    /// 対象のセグメントは開かれたままでも良い.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// セグメントを削除する.
    fn delete(&self, name: &str) -> Result<()>;

    /// この格納場所のセグメントが要求するブロックサイズ(の最小値)を返す.
    fn block_size(&self) -> BlockSize;
}
