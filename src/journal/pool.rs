//! セグメント群の物理的な管理(作成・待機・再利用・削除).
use slog::Logger;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::block::{AlignedBytes, BlockSize};
use crate::journal::file::JournalFile;
use crate::journal::header::SegmentHeader;
use crate::metrics::JournalMetrics;
use crate::segment::{SegmentFactory, SegmentStorage};
use crate::{ErrorKind, Result};

/// `FilePool`の設定.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// 維持しておくセグメントの最小数.
    pub min_files: usize,

    /// 各セグメントのサイズ(バイト数).
    pub file_size: u64,

    /// レコードおよびヘッダ領域のアライメント.
    pub block_size: BlockSize,

    /// セグメント名の接頭辞.
    pub prefix: String,

    /// セグメント名の拡張子.
    pub extension: String,

    /// ジャーナルのインスタンスUUID.
    pub instance_uuid: Uuid,
}

/// 開かれているセグメント.
///
/// 書き込み対象のセグメントと、待機中の空きセグメントがこの形で保持される.
#[derive(Debug)]
pub struct OpenSegment<S> {
    /// セグメントの帳簿.
    pub file: Arc<JournalFile>,

    /// 読み書き用のハンドル.
    pub storage: S,

    /// セグメントの名前.
    pub name: String,
}
impl<S> OpenSegment<S> {
    /// セグメントの順序IDを返す.
    pub fn segment_id(&self) -> u64 {
        self.file.segment_id()
    }
}

/// セグメント群の物理的な管理を担当する.
///
/// 以下の三種類のセグメントを扱う:
///
/// - 空き(free)セグメント: ヘッダのみが書き込まれた、待機中のセグメント (`FilePool`が保持)
/// - 書き込み対象(current)セグメント: `acquire`によって払い出されたセグメント (ジャーナルが保持)
/// - データ(data)セグメント: 書き込みが終了し、回収を待っているセグメント (`FilePool`は名前のみを保持)
#[derive(Debug)]
pub struct FilePool<F: SegmentFactory> {
    factory: F,
    options: PoolOptions,
    logger: Logger,
    metrics: JournalMetrics,
    next_segment_id: u64,
    free: VecDeque<OpenSegment<F::Storage>>,
    data: BTreeMap<u64, String>,
}
impl<F: SegmentFactory> FilePool<F> {
    /// 新しい`FilePool`インスタンスを生成する.
    pub fn new(factory: F, options: PoolOptions, logger: Logger, metrics: JournalMetrics) -> Self {
        FilePool {
            factory,
            options,
            logger,
            metrics,
            next_segment_id: 1,
            free: VecDeque::new(),
            data: BTreeMap::new(),
        }
    }

    /// セグメントファクトリへの参照を返す.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// 設定を返す.
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// セグメント内の、最初のレコードの書き込み位置を返す.
    pub fn header_region_size(&self) -> u64 {
        SegmentHeader::calc_region_size(self.options.block_size)
    }

    /// 一つのセグメントに書き込み可能なレコードの最大サイズを返す.
    pub fn max_record_size(&self) -> u64 {
        self.options.file_size - self.header_region_size()
    }

    /// 順序IDに対応するセグメント名を返す.
    pub fn segment_name(&self, segment_id: u64) -> String {
        format!(
            "{}{}.{}",
            self.options.prefix, segment_id, self.options.extension
        )
    }

    /// セグメント名から順序IDを取り出す.
    ///
    /// このジャーナルの命名規則に従っていない名前の場合には`None`が返される.
    pub fn parse_segment_name(&self, name: &str) -> Option<u64> {
        let suffix = format!(".{}", self.options.extension);
        if !name.starts_with(&self.options.prefix) || !name.ends_with(&suffix) {
            return None;
        }
        let end = name.len() - suffix.len();
        if end < self.options.prefix.len() {
            return None;
        }
        name[self.options.prefix.len()..end].parse().ok()
    }

    /// 新しく作成(ないし再利用)されるセグメントのヘッダに書き込むインスタンスUUIDを設定する.
    pub fn set_instance_uuid(&mut self, instance_uuid: Uuid) {
        self.options.instance_uuid = instance_uuid;
    }

    /// 次に割り当てられる順序IDを、少なくとも`segment_id`以上にする.
    pub fn ensure_next_segment_id(&mut self, segment_id: u64) {
        if self.next_segment_id < segment_id {
            self.next_segment_id = segment_id;
        }
    }

    /// 待機中の空きセグメントの数を返す.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// データセグメントの数を返す.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// データセグメントの名前を返す.
    pub fn data_segment_name(&self, segment_id: u64) -> Option<&str> {
        self.data.get(&segment_id).map(|name| name.as_str())
    }

    /// 待機中の空きセグメント群を返す.
    pub fn free_segments(&self) -> impl Iterator<Item = &OpenSegment<F::Storage>> {
        self.free.iter()
    }

    /// 空きセグメントとデータセグメントの合計が`min_files`に達するまで、新規にセグメントを作成する.
    ///
    /// セグメントが一つも存在しない場合には、`min_files`個のセグメントが作成されることになる.
    pub fn replenish(&mut self) -> Result<()> {
        while self.free.len() + self.data.len() < self.options.min_files {
            let segment = track!(self.create_segment())?;
            self.free.push_back(segment);
        }
        self.update_gauges();
        Ok(())
    }

    /// 次の書き込み対象となるセグメントを払い出す.
    ///
    /// 空きセグメントがなければ新規に作成される.
    /// また、次回の切り替えに備えて、最低一つの空きセグメントが常に待機しているようにする.
    pub fn acquire(&mut self) -> Result<OpenSegment<F::Storage>> {
        let segment = if let Some(segment) = self.free.pop_front() {
            segment
        } else {
            track!(self.create_segment())?
        };
        if self.free.is_empty() {
            match self.create_segment() {
                Ok(standby) => self.free.push_back(standby),
                Err(e) => {
                    // 払い出し前のセグメントは空きセグメントに戻す
                    self.free.push_front(segment);
                    self.update_gauges();
                    return Err(track!(e));
                }
            }
        }
        self.update_gauges();
        Ok(segment)
    }

    /// 書き込みが終了したセグメントを、データセグメントとして登録する.
    pub fn add_data(&mut self, segment_id: u64, name: String) {
        self.data.insert(segment_id, name);
        self.update_gauges();
    }

    /// ロード時に見つかった空きセグメントを登録する.
    ///
    /// 空きセグメント群は、順序IDの昇順に払い出される.
    pub fn add_free(&mut self, segment: OpenSegment<F::Storage>) {
        let index = self
            .free
            .iter()
            .position(|s| s.segment_id() > segment.segment_id())
            .unwrap_or_else(|| self.free.len());
        self.free.insert(index, segment);
        self.update_gauges();
    }

    /// 回収されたデータセグメントを、再利用ないし削除する.
    ///
    /// `free + data + 1 (書き込み対象) < min_files`ならば再利用され、それ以外は削除される.
    pub fn reclaim(&mut self, segment_id: u64) -> Result<()> {
        let name = track_assert_some!(
            self.data.remove(&segment_id),
            ErrorKind::InconsistentState,
            "Unknown data segment: {}",
            segment_id
        );
        if self.free.len() + self.data.len() + 1 < self.options.min_files {
            let storage = track!(self.factory.open(&name))?;
            let segment = track!(self.reset(storage, &name))?;
            info!(
                self.logger,
                "Segment is recycled: old_id={}, new_id={}",
                segment_id,
                segment.segment_id()
            );
            self.metrics.recycled_segments.increment();
            self.free.push_back(segment);
        } else {
            track!(self.delete(&name))?;
        }
        self.update_gauges();
        Ok(())
    }

    /// セグメントを物理的に削除する.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        track!(self.factory.delete(name))?;
        info!(self.logger, "Segment is deleted: {}", name);
        self.metrics.deleted_segments.increment();
        Ok(())
    }

    /// セグメントを初期化し直して、新しい順序IDを割り当てる.
    ///
    /// 手順は以下の通り:
    ///
    /// 1. 最初のレコードの位置をゼロで埋める (古いレコード群が読み込まれないようにするため)
    /// 2. 新しい順序IDでヘッダを書き直す
    /// 3. 同期する
    /// 4. 新しい順序IDに対応する名前に変更する
    ///
    /// 途中でクラッシュした場合でも、ロード時にはレコードを持たない空きセグメントとして扱われる.
    pub fn reset(&mut self, mut storage: F::Storage, name: &str) -> Result<OpenSegment<F::Storage>> {
        let block_size = self.options.block_size;
        let region_size = self.header_region_size();
        if region_size < storage.capacity() {
            let blank = AlignedBytes::new(block_size.as_u32() as usize, block_size);
            track!(storage.write_aligned_at(region_size, &blank))?;
        }

        let segment_id = self.allocate_segment_id();
        track!(self.write_header(&mut storage, segment_id))?;
        track!(storage.sync())?;

        let new_name = self.segment_name(segment_id);
        if new_name != name {
            track!(self.factory.rename(name, &new_name))?;
        }
        Ok(OpenSegment {
            file: Arc::new(JournalFile::new(segment_id, region_size)),
            storage,
            name: new_name,
        })
    }

    /// 全ての空きセグメントを同期した上で閉じる.
    pub fn close(&mut self) -> Result<()> {
        for mut segment in self.free.drain(..) {
            track!(segment.storage.sync())?;
        }
        self.data.clear();
        self.next_segment_id = 1;
        self.update_gauges();
        Ok(())
    }

    fn create_segment(&mut self) -> Result<OpenSegment<F::Storage>> {
        let segment_id = self.allocate_segment_id();
        let name = self.segment_name(segment_id);
        let mut storage = track!(self.factory.create(&name, self.options.file_size))?;
        let initialized = self
            .write_header(&mut storage, segment_id)
            .and_then(|()| storage.sync());
        if let Err(e) = initialized {
            drop(storage);
            if let Err(e) = self.factory.delete(&name) {
                warn!(
                    self.logger,
                    "Cannot delete half-initialized segment: name={}, reason={}", name, e
                );
            }
            return Err(track!(e));
        }

        info!(self.logger, "New segment is created: {}", name);
        self.metrics.created_segments.increment();
        Ok(OpenSegment {
            file: Arc::new(JournalFile::new(segment_id, self.header_region_size())),
            storage,
            name,
        })
    }

    fn write_header(&self, storage: &mut F::Storage, segment_id: u64) -> Result<()> {
        let header = SegmentHeader::new(
            segment_id,
            self.options.instance_uuid,
            self.options.block_size,
        );
        let mut buf = AlignedBytes::new(header.region_size() as usize, self.options.block_size);
        track!(header.write_header_region_to(&mut buf[..]))?;
        track!(storage.write_aligned_at(0, &buf))?;
        Ok(())
    }

    fn allocate_segment_id(&mut self) -> u64 {
        let segment_id = self.next_segment_id;
        self.next_segment_id += 1;
        segment_id
    }

    fn update_gauges(&self) {
        self.metrics.free_segments.set(self.free.len() as f64);
        self.metrics.data_segments.set(self.data.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use prometrics::metrics::MetricBuilder;
    use slog::{Discard, Logger};
    use trackable::result::TestResult;
    use uuid::Uuid;

    use super::*;
    use crate::journal::record::JournalRecord;
    use crate::segment::faulty::FaultySegmentFactory;
    use crate::segment::MemorySegmentFactory;

    fn pool(min_files: usize) -> FilePool<MemorySegmentFactory> {
        pool_with(MemorySegmentFactory::new(), min_files)
    }

    fn pool_with<F: SegmentFactory>(factory: F, min_files: usize) -> FilePool<F> {
        let options = PoolOptions {
            min_files,
            file_size: 1024,
            block_size: BlockSize::min(),
            prefix: "test-".to_owned(),
            extension: "jnl".to_owned(),
            instance_uuid: Uuid::new_v4(),
        };
        let logger = Logger::root(Discard, o!());
        let metrics = JournalMetrics::new(&MetricBuilder::new());
        FilePool::new(factory, options, logger, metrics)
    }

    #[test]
    fn segment_name_works() {
        let pool = pool(2);
        assert_eq!(pool.segment_name(12), "test-12.jnl");
        assert_eq!(pool.parse_segment_name("test-12.jnl"), Some(12));
        assert_eq!(pool.parse_segment_name("test-12.tmp"), None);
        assert_eq!(pool.parse_segment_name("foo-12.jnl"), None);
        assert_eq!(pool.parse_segment_name("test-.jnl"), None);
        assert_eq!(pool.parse_segment_name("test-x.jnl"), None);
    }

    #[test]
    fn initialize_and_acquire_works() -> TestResult {
        let mut pool = pool(3);
        track!(pool.replenish())?;
        assert_eq!(pool.free_len(), 3);
        assert_eq!(
            track!(pool.factory().list())?,
            vec!["test-1.jnl", "test-2.jnl", "test-3.jnl"]
        );

        let s = track!(pool.acquire())?;
        assert_eq!(s.segment_id(), 1);
        assert_eq!(s.file.write_offset(), pool.header_region_size());
        let s = track!(pool.acquire())?;
        assert_eq!(s.segment_id(), 2);

        // 最後の空きセグメントが払い出されたら、新しいセグメントが待機する
        let s = track!(pool.acquire())?;
        assert_eq!(s.segment_id(), 3);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.metrics.created_segments(), 4);
        assert!(track!(pool.factory().list())?.contains(&"test-4.jnl".to_owned()));
        Ok(())
    }

    #[test]
    fn failed_acquire_keeps_free_segment() -> TestResult {
        let factory = FaultySegmentFactory::new();
        let mut pool = pool_with(factory.clone(), 1);
        track!(pool.replenish())?;
        assert_eq!(pool.free_len(), 1);

        // 待機用セグメントの作成に失敗しても、空きセグメントは失われない
        factory.fail_creates(1);
        assert!(pool.acquire().is_err());
        assert_eq!(pool.free_len(), 1);
        assert_eq!(track!(pool.factory().list())?, vec!["test-1.jnl"]);

        let s = track!(pool.acquire())?;
        assert_eq!(s.segment_id(), 1);
        assert_eq!(pool.free_len(), 1);
        Ok(())
    }

    #[test]
    fn headers_are_readable() -> TestResult {
        let mut pool = pool(2);
        track!(pool.replenish())?;
        let bytes = track!(pool.factory().bytes("test-2.jnl"))?;
        let bytes = track_assert_some!(bytes, ErrorKind::Other);
        let header = track!(SegmentHeader::read_from(&bytes[..]))?;
        assert_eq!(header.segment_id, 2);
        assert_eq!(header.instance_uuid, pool.options().instance_uuid);
        Ok(())
    }

    #[test]
    fn reclaimed_segment_is_deleted_when_enough_files_exist() -> TestResult {
        let mut pool = pool(2);
        track!(pool.replenish())?;
        let current = track!(pool.acquire())?;
        pool.add_data(current.segment_id(), current.name.clone());
        let _next = track!(pool.acquire())?;
        assert_eq!(pool.data_len(), 1);

        track!(pool.reclaim(1))?;
        assert_eq!(pool.data_len(), 0);
        assert!(!track!(pool.factory().list())?.contains(&"test-1.jnl".to_owned()));
        assert_eq!(pool.metrics.deleted_segments(), 1);
        Ok(())
    }

    #[test]
    fn reclaimed_segment_is_recycled() -> TestResult {
        let mut pool = pool(5);
        track!(pool.replenish())?;
        let mut current = track!(pool.acquire())?;

        // 古いレコードを書き込んでおく
        let record = JournalRecord::Add {
            record_id: 1,
            record_type: 0,
            payload: b"foo".to_vec(),
        };
        let mut buf = Vec::new();
        track!(record.write_to(current.segment_id(), &mut buf))?;
        let buf = AlignedBytes::from_bytes(&buf, BlockSize::min());
        track!(current
            .storage
            .write_aligned_at(pool.header_region_size(), &buf))?;

        pool.add_data(current.segment_id(), current.name.clone());
        let _next = track!(pool.acquire())?;
        assert_eq!(pool.free_len(), 3);

        track!(pool.reclaim(1))?;
        assert_eq!(pool.free_len(), 4);
        assert_eq!(pool.metrics.recycled_segments(), 1);

        let names = track!(pool.factory().list())?;
        assert!(!names.contains(&"test-1.jnl".to_owned()));
        assert!(names.contains(&"test-6.jnl".to_owned()));

        // 最初のレコード位置はゼロで埋められている
        let bytes = track!(pool.factory().bytes("test-6.jnl"))?;
        let bytes = track_assert_some!(bytes, ErrorKind::Other);
        let header = track!(SegmentHeader::read_from(&bytes[..]))?;
        assert_eq!(header.segment_id, 6);
        let offset = pool.header_region_size() as usize;
        assert_eq!(track!(JournalRecord::read_from(&bytes[offset..], 6))?, None);
        Ok(())
    }

    #[test]
    fn free_segments_are_ordered() -> TestResult {
        let mut pool = pool(2);
        for id in &[5, 3, 4] {
            let name = pool.segment_name(*id);
            let storage = track!(pool.factory().create(&name, 1024))?;
            pool.add_free(OpenSegment {
                file: Arc::new(JournalFile::new(*id, 0)),
                storage,
                name,
            });
        }
        let ids = pool.free_segments().map(|s| s.segment_id()).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 4, 5]);
        Ok(())
    }
}
