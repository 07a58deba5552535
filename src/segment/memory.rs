use std::cmp;
use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crate::block::BlockSize;
use crate::segment::{SegmentFactory, SegmentStorage, SyncHandle};
use crate::{Error, ErrorKind, Result};

type Memory = Arc<Mutex<Vec<u8>>>;

/// インスタンスを共有可能な、メモリベースの`SegmentFactory`の実装.
///
/// クローンされたインスタンス同士は、同じセグメント群を参照する.
/// そのため、ジャーナルを破棄した後に、同じファクトリを使って再起動時の挙動を確認することができる.
///
/// # 注意
///
/// これはテスト用途のみを意図した実装であり、"不揮発性"は満たしていない.
#[derive(Debug, Clone)]
pub struct MemorySegmentFactory {
    segments: Arc<Mutex<BTreeMap<String, Memory>>>,
    block_size: BlockSize,
}
impl MemorySegmentFactory {
    /// 新しい`MemorySegmentFactory`インスタンスを生成する.
    ///
    /// `MemorySegmentFactory::with_block_size(BlockSize::min())`と等しい.
    pub fn new() -> Self {
        Self::with_block_size(BlockSize::min())
    }

    /// ブロックサイズを指定して`MemorySegmentFactory`インスタンスを生成する.
    pub fn with_block_size(block_size: BlockSize) -> Self {
        MemorySegmentFactory {
            segments: Arc::new(Mutex::new(BTreeMap::new())),
            block_size,
        }
    }

    /// 指定セグメントの内容のコピーを返す.
    pub fn bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(memory) = track!(self.memory(name))? {
            let bytes = track!(memory.lock().map_err(Error::from))?.clone();
            Ok(Some(bytes))
        } else {
            Ok(None)
        }
    }

    /// 指定セグメントの`offset`以降を`bytes`で上書きする.
    ///
    /// アライメントの制約を受けないので、書き込み途中でのクラッシュ等を模倣するのに使える.
    pub fn overwrite(&self, name: &str, offset: usize, bytes: &[u8]) -> Result<()> {
        let memory = track!(self.memory(name))?;
        let memory = track_assert_some!(memory, ErrorKind::InvalidInput, "name={:?}", name);
        let mut memory = track!(memory.lock().map_err(Error::from))?;
        track_assert!(
            offset + bytes.len() <= memory.len(),
            ErrorKind::InvalidInput
        );
        memory[offset..][..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn memory(&self, name: &str) -> Result<Option<Memory>> {
        let segments = track!(self.segments.lock().map_err(Error::from))?;
        Ok(segments.get(name).cloned())
    }
}
impl Default for MemorySegmentFactory {
    fn default() -> Self {
        Self::new()
    }
}
impl SegmentFactory for MemorySegmentFactory {
    type Storage = MemorySegment;

    fn list(&self) -> Result<Vec<String>> {
        let segments = track!(self.segments.lock().map_err(Error::from))?;
        Ok(segments.keys().cloned().collect())
    }

    fn create(&self, name: &str, capacity: u64) -> Result<MemorySegment> {
        let mut segments = track!(self.segments.lock().map_err(Error::from))?;
        track_assert!(
            !segments.contains_key(name),
            ErrorKind::InvalidInput,
            "Segment already exists: {:?}",
            name
        );
        let memory = Arc::new(Mutex::new(vec![0; capacity as usize]));
        segments.insert(name.to_owned(), memory.clone());
        Ok(MemorySegment::new(memory, capacity, self.block_size))
    }

    fn open(&self, name: &str) -> Result<MemorySegment> {
        let memory = track!(self.memory(name))?;
        let memory = track_assert_some!(memory, ErrorKind::InvalidInput, "name={:?}", name);
        let capacity = track!(memory.lock().map_err(Error::from))?.len() as u64;
        Ok(MemorySegment::new(memory, capacity, self.block_size))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut segments = track!(self.segments.lock().map_err(Error::from))?;
        let memory = segments.remove(from);
        let memory = track_assert_some!(memory, ErrorKind::InvalidInput, "name={:?}", from);
        segments.insert(to.to_owned(), memory);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut segments = track!(self.segments.lock().map_err(Error::from))?;
        track_assert!(
            segments.remove(name).is_some(),
            ErrorKind::InvalidInput,
            "name={:?}",
            name
        );
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}

/// `MemorySegmentFactory`が生成するセグメント.
#[derive(Debug)]
pub struct MemorySegment {
    memory: Memory,
    capacity: u64,
    block_size: BlockSize,
    position: u64,
}
impl MemorySegment {
    fn new(memory: Memory, capacity: u64, block_size: BlockSize) -> Self {
        MemorySegment {
            memory,
            capacity,
            block_size,
            position: 0,
        }
    }

    fn with_bytes_mut<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut [u8]) -> T,
    {
        let position = self.position as usize;
        match self.memory.lock() {
            Ok(mut lock) => Ok(f(&mut lock[position..])),
            Err(error) => Err(track!(Error::from(error))),
        }
    }

    fn seek_impl(&mut self, position: u64) -> Result<()> {
        track_assert!(
            self.block_size.is_aligned(position),
            ErrorKind::InvalidInput
        );
        track_assert!(position <= self.capacity, ErrorKind::InvalidInput);
        self.position = position;
        Ok(())
    }

    fn read_impl(&mut self, buf: &mut [u8]) -> Result<usize> {
        track_assert!(
            self.block_size.is_aligned(buf.len() as u64),
            ErrorKind::InvalidInput
        );

        let size = track!(self.with_bytes_mut(|memory| {
            let len = cmp::min(memory.len(), buf.len());
            buf[..len].copy_from_slice(&memory[..len]);
            len
        }))?;
        self.position += size as u64;
        Ok(size)
    }

    fn write_impl(&mut self, buf: &[u8]) -> Result<usize> {
        track_assert!(
            self.block_size.is_aligned(buf.len() as u64),
            ErrorKind::InvalidInput
        );

        let size = track!(self.with_bytes_mut(|memory| {
            let len = cmp::min(memory.len(), buf.len());
            memory[..len].copy_from_slice(&buf[..len]);
            len
        }))?;
        self.position += size as u64;
        Ok(size)
    }
}
impl SegmentStorage for MemorySegment {
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
    fn sync_handle(&self) -> Arc<dyn SyncHandle> {
        Arc::new(NoopSync)
    }
    fn position(&self) -> u64 {
        self.position
    }
    fn capacity(&self) -> u64 {
        self.capacity
    }
    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}
impl Seek for MemorySegment {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.convert_to_offset(pos)?;
        track!(self.seek_impl(position))?;
        Ok(position)
    }
}
impl Read for MemorySegment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read_size = track!(self.read_impl(buf))?;
        Ok(read_size)
    }
}
impl Write for MemorySegment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written_size = track!(self.write_impl(buf))?;
        Ok(written_size)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct NoopSync;
impl SyncHandle for NoopSync {
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use trackable::result::TestResult;

    use super::*;
    use crate::block::AlignedBytes;

    #[test]
    fn it_works() -> TestResult {
        let factory = MemorySegmentFactory::new();
        let mut segment = track!(factory.create("foo", 1024))?;
        assert_eq!(segment.capacity(), 1024);
        assert_eq!(segment.position(), 0);

        let bytes = AlignedBytes::from_bytes(&[1; 512][..], BlockSize::min());
        track!(segment.write_aligned_at(512, &bytes))?;
        assert_eq!(segment.position(), 1024);

        let buf = track!(segment.read_aligned_at(0, 1024))?;
        assert_eq!(&buf[..512], &[0; 512][..]);
        assert_eq!(&buf[512..], &[1; 512][..]);

        // 容量超過
        assert!(segment.read_aligned_at(512, 1024).is_err());
        Ok(())
    }

    #[test]
    fn shared_between_clones() -> TestResult {
        let factory = MemorySegmentFactory::new();
        let mut segment = track!(factory.create("foo", 16))?;
        let bytes = AlignedBytes::from_bytes(b"bar", BlockSize::min());
        track!(segment.write_aligned_at(0, &bytes))?;
        mem::drop(segment);

        let cloned = factory.clone();
        track!(cloned.rename("foo", "baz"))?;
        assert_eq!(track!(factory.list())?, vec!["baz"]);

        let mut segment = track!(factory.open("baz"))?;
        let buf = track!(segment.read_aligned_at(0, 3))?;
        assert_eq!(&buf[..], b"bar");

        track!(factory.overwrite("baz", 1, b"x"))?;
        assert_eq!(track!(factory.bytes("baz"))?.map(|b| b[..3].to_vec()), Some(b"bxr".to_vec()));

        track!(factory.delete("baz"))?;
        assert!(factory.open("baz").is_err());
        assert_eq!(track!(factory.bytes("baz"))?, None);
        Ok(())
    }

    #[test]
    fn alignment_is_enforced() -> TestResult {
        let factory = MemorySegmentFactory::with_block_size(BlockSize::sector());
        let mut segment = track!(factory.create("foo", 1024))?;
        assert!(segment.seek(SeekFrom::Start(1)).is_err());
        assert!(segment.write(&[0; 100][..]).is_err());
        assert!(segment.write(&[0; 512][..]).is_ok());
        Ok(())
    }
}
