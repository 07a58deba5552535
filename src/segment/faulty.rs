//! 障害注入用のセグメントファクトリ (テスト専用).
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::block::BlockSize;
use crate::segment::{MemorySegment, MemorySegmentFactory, SegmentFactory};
use crate::{ErrorKind, Result};

/// 指定回数だけ`create`を失敗させる、`MemorySegmentFactory`のラッパー.
#[derive(Debug, Clone)]
pub struct FaultySegmentFactory {
    inner: MemorySegmentFactory,
    create_failures: Arc<AtomicUsize>,
}
impl FaultySegmentFactory {
    pub fn new() -> Self {
        FaultySegmentFactory {
            inner: MemorySegmentFactory::new(),
            create_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 以降の`count`回の`create`呼び出しを失敗させる.
    pub fn fail_creates(&self, count: usize) {
        self.create_failures.store(count, Ordering::SeqCst);
    }
}
impl SegmentFactory for FaultySegmentFactory {
    type Storage = MemorySegment;

    fn list(&self) -> Result<Vec<String>> {
        track!(self.inner.list())
    }

    fn create(&self, name: &str, capacity: u64) -> Result<MemorySegment> {
        let remaining = self.create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.create_failures.store(remaining - 1, Ordering::SeqCst);
            track_panic!(ErrorKind::Other, "Injected failure: name={:?}", name);
        }
        track!(self.inner.create(name, capacity))
    }

    fn open(&self, name: &str) -> Result<MemorySegment> {
        track!(self.inner.open(name))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        track!(self.inner.rename(from, to))
    }

    fn delete(&self, name: &str) -> Result<()> {
        track!(self.inner.delete(name))
    }

    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }
}
