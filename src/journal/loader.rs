//! 起動時のリカバリ処理.
//!
//! 全てのセグメントを順序IDの昇順に読み込み、レコード群を再生することで、
//! インデックスと各セグメントのカウンタを停止前と同じ状態に復元する.
use slog::Logger;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::journal::file::JournalFile;
use crate::journal::header::{SegmentHeader, FULL_HEADER_SIZE};
use crate::journal::index::RecordLocation;
use crate::journal::pool::{FilePool, OpenSegment};
use crate::journal::record::{JournalRecord, TransactionSummary, FRAME_HEADER_SIZE};
use crate::journal::table::{ApplyMode, SegmentTable};
use crate::journal::transaction::{Transaction, TransactionState, TxOperation};
use crate::record::{LoadResult, PreparedTransactionInfo, RecordInfo};
use crate::segment::{SegmentFactory, SegmentStorage};
use crate::{ErrorKind, Result};

/// リカバリの結果.
#[derive(Debug)]
pub struct Recovered {
    /// 利用者に返されるロード結果.
    pub result: LoadResult,

    /// 復元されたプリペア済みトランザクション群.
    pub transactions: Vec<Transaction>,

    /// 採用されたインスタンスUUID.
    pub instance_uuid: Uuid,
}

/// リカバリ処理を行う.
#[derive(Debug)]
pub struct Loader<'a, F: SegmentFactory> {
    pool: &'a mut FilePool<F>,
    table: &'a mut SegmentTable,
    logger: Logger,
    instance_uuid: Option<Uuid>,
    transactions: BTreeMap<u64, Transaction>,
    discarded: HashSet<u64>,
    records: BTreeMap<u64, RecordInfo>,
}
impl<'a, F: SegmentFactory> Loader<'a, F> {
    /// 新しい`Loader`インスタンスを生成する.
    ///
    /// `instance_uuid`が指定されている場合には、全てのセグメントのヘッダの値と一致する必要がある.
    pub fn new(
        pool: &'a mut FilePool<F>,
        table: &'a mut SegmentTable,
        logger: Logger,
        instance_uuid: Option<Uuid>,
    ) -> Self {
        Loader {
            pool,
            table,
            logger,
            instance_uuid,
            transactions: BTreeMap::new(),
            discarded: HashSet::new(),
            records: BTreeMap::new(),
        }
    }

    /// 全てのセグメントを読み込んで、状態を復元する.
    pub fn load(mut self) -> Result<Recovered> {
        let segments = track!(self.open_segments())?;
        if let Some(last) = segments.keys().next_back() {
            self.pool.ensure_next_segment_id(last + 1);
        }
        let instance_uuid = self.instance_uuid.unwrap_or_else(Uuid::new_v4);
        self.pool.set_instance_uuid(instance_uuid);

        let mut corrupted_segment = None;
        let mut last_data_segment = 0;
        let mut empty_segments = Vec::new();
        for (segment_id, (name, mut storage)) in segments {
            let file = Arc::new(JournalFile::new(
                segment_id,
                self.pool.header_region_size(),
            ));
            self.table.insert_file(file.clone());

            let scan = track!(self.replay_segment(&file, &mut storage))?;
            if scan.records == 0 {
                track!(self.table.remove_file(segment_id))?;
                if scan.corrupted {
                    corrupted_segment = Some(segment_id);
                }
                let segment = OpenSegment {
                    file,
                    storage,
                    name,
                };
                empty_segments.push((segment, scan.corrupted));
                continue;
            }

            if let Some(corrupted) = corrupted_segment {
                track_panic!(
                    ErrorKind::JournalCorrupted,
                    "The first record of the segment {} is corrupted, but the later segment {} has records",
                    corrupted,
                    segment_id
                );
            }
            info!(
                self.logger,
                "Segment is loaded: name={}, records={}, torn_tail={}",
                name,
                scan.records,
                scan.corrupted
            );
            file.set_write_offset(scan.end_offset);
            last_data_segment = segment_id;
            self.pool.add_data(segment_id, name);
        }

        // レコードを持たないセグメントは空きセグメントとして扱う.
        // ただし、データセグメントよりも古い順序IDを持つものや、ゴミが残っているものは初期化し直す.
        for (segment, corrupted) in empty_segments {
            if corrupted || segment.segment_id() < last_data_segment {
                let segment = track!(self.pool.reset(segment.storage, &segment.name))?;
                self.pool.add_free(segment);
            } else {
                self.pool.add_free(segment);
            }
        }
        track!(self.finish_transactions())?;
        track!(self.pool.replenish())?;

        let prepared_transactions = self
            .transactions
            .values()
            .filter_map(|tx| match *tx.state() {
                TransactionState::Prepared { ref xid, .. } => Some(PreparedTransactionInfo {
                    tx_id: tx.tx_id(),
                    xid: xid.clone(),
                    records: tx.records().to_vec(),
                    records_to_delete: tx.deleted_records(),
                }),
                TransactionState::Active => None,
            })
            .collect();
        Ok(Recovered {
            result: LoadResult {
                records: self.records.into_iter().map(|(_, r)| r).collect(),
                prepared_transactions,
            },
            transactions: self.transactions.into_iter().map(|(_, tx)| tx).collect(),
            instance_uuid,
        })
    }

    fn open_segments(&mut self) -> Result<BTreeMap<u64, (String, F::Storage)>> {
        let block_size = self.pool.options().block_size;
        let region_size = self.pool.header_region_size();

        let mut segments = BTreeMap::new();
        for name in track!(self.pool.factory().list())? {
            if self.pool.parse_segment_name(&name).is_none() {
                continue;
            }

            let mut storage = track!(self.pool.factory().open(&name))?;
            let header = if storage.capacity() < region_size {
                None
            } else {
                let bytes = track!(storage.read_aligned_at(0, FULL_HEADER_SIZE as usize))?;
                SegmentHeader::read_from(&bytes[..]).ok()
            };
            let header = if let Some(header) = header {
                header
            } else {
                warn!(
                    self.logger,
                    "Half-initialized segment is found: {}", name
                );
                drop(storage);
                track!(self.pool.delete(&name))?;
                continue;
            };

            track_assert_eq!(
                header.block_size,
                block_size,
                ErrorKind::InvalidInput,
                "Alignment mismatch: name={}",
                name
            );
            track_assert!(
                header.segment_id != 0,
                ErrorKind::JournalCorrupted,
                "Invalid segment id: name={}",
                name
            );
            if let Some(expected) = self.instance_uuid {
                track_assert_eq!(
                    header.instance_uuid,
                    expected,
                    ErrorKind::InvalidInput,
                    "Instance UUID mismatch: name={}",
                    name
                );
            } else {
                self.instance_uuid = Some(header.instance_uuid);
            }

            // 再利用処理の途中でクラッシュした場合には、名前が古いままになっている
            let expected_name = self.pool.segment_name(header.segment_id);
            let name = if name != expected_name {
                track!(self.pool.factory().rename(&name, &expected_name))?;
                expected_name
            } else {
                name
            };
            track_assert!(
                !segments.contains_key(&header.segment_id),
                ErrorKind::JournalCorrupted,
                "Duplicate segment id: {}",
                header.segment_id
            );
            segments.insert(header.segment_id, (name, storage));
        }
        Ok(segments)
    }

    fn replay_segment(&mut self, file: &JournalFile, storage: &mut F::Storage) -> Result<Scan> {
        let block_size = self.pool.options().block_size;
        let capacity = storage.capacity();
        let bytes = track!(storage.read_aligned_at(0, capacity as usize))?;

        let segment_id = file.segment_id();
        let mut scan = Scan {
            records: 0,
            corrupted: false,
            end_offset: self.pool.header_region_size(),
        };
        while scan.end_offset + FRAME_HEADER_SIZE as u64 <= capacity {
            let rest = &bytes[scan.end_offset as usize..capacity as usize];
            match JournalRecord::read_from(rest, segment_id) {
                Ok(None) => break,
                Ok(Some((record, size))) => {
                    let location = RecordLocation {
                        segment_id,
                        offset: scan.end_offset,
                        size: block_size.ceil_align(size as u64),
                    };
                    track!(self.replay_record(location, record))?;
                    scan.records += 1;
                    scan.end_offset += location.size;
                }
                Err(e) => {
                    if *e.kind() != ErrorKind::CorruptRecord {
                        return Err(track!(e));
                    }
                    warn!(
                        self.logger,
                        "Corrupted record is found; the rest of the segment is ignored";
                        "segment_id" => segment_id, "offset" => scan.end_offset, "reason" => e.to_string()
                    );
                    scan.corrupted = true;
                    break;
                }
            }
        }
        Ok(scan)
    }

    fn replay_record(
        &mut self,
        location: RecordLocation,
        record: JournalRecord<Vec<u8>>,
    ) -> Result<()> {
        let segment_id = location.segment_id;
        match record {
            JournalRecord::Add {
                record_id,
                record_type,
                payload,
            } => {
                track!(self.table.apply_add(record_id, location, ApplyMode::Replay))?;
                self.records.insert(
                    record_id,
                    RecordInfo {
                        id: record_id,
                        record_type,
                        payload,
                    },
                );
            }
            JournalRecord::Update {
                record_id,
                record_type,
                payload,
            } => {
                track!(self
                    .table
                    .apply_update(record_id, location, ApplyMode::Replay))?;
                self.records.insert(
                    record_id,
                    RecordInfo {
                        id: record_id,
                        record_type,
                        payload,
                    },
                );
            }
            JournalRecord::Delete { record_id } => {
                track!(self
                    .table
                    .apply_delete(record_id, segment_id, ApplyMode::Replay))?;
                self.records.remove(&record_id);
            }
            JournalRecord::AddTx {
                tx_id,
                record_id,
                record_type,
                payload,
            } => {
                let op = TxOperation::Add {
                    record_id,
                    location,
                };
                let record = RecordInfo {
                    id: record_id,
                    record_type,
                    payload,
                };
                track!(self.replay_tx_operation(tx_id, op, Some(record)))?;
            }
            JournalRecord::UpdateTx {
                tx_id,
                record_id,
                record_type,
                payload,
            } => {
                let op = TxOperation::Update {
                    record_id,
                    location,
                };
                let record = RecordInfo {
                    id: record_id,
                    record_type,
                    payload,
                };
                track!(self.replay_tx_operation(tx_id, op, Some(record)))?;
            }
            JournalRecord::DeleteTx { tx_id, record_id } => {
                let op = TxOperation::Delete {
                    record_id,
                    segment_id,
                };
                track!(self.replay_tx_operation(tx_id, op, None))?;
            }
            JournalRecord::Prepare {
                tx_id,
                summary,
                xid,
            } => {
                track!(self.replay_prepare(segment_id, tx_id, &summary, xid))?;
            }
            JournalRecord::Commit { tx_id, summary } => {
                track!(self.replay_commit(segment_id, tx_id, &summary))?;
            }
            JournalRecord::Rollback { tx_id } => {
                track!(self.replay_rollback(segment_id, tx_id))?;
            }
        }
        Ok(())
    }

    fn replay_tx_operation(
        &mut self,
        tx_id: u64,
        op: TxOperation,
        record: Option<RecordInfo>,
    ) -> Result<()> {
        track_assert!(
            !self.discarded.contains(&tx_id),
            ErrorKind::JournalCorrupted,
            "Operation for a discarded transaction: tx_id={}",
            tx_id
        );
        let segment_id = op.segment_id();
        let tx = self
            .transactions
            .entry(tx_id)
            .or_insert_with(|| Transaction::new(tx_id));
        track_assert!(
            !tx.is_prepared(),
            ErrorKind::JournalCorrupted,
            "Operation after prepare: tx_id={}",
            tx_id
        );
        track!(tx.push(op))?;
        if let Some(record) = record {
            tx.push_record(record);
        }
        track!(track!(self.table.file(segment_id))?.add_active_transaction(tx_id))?;
        Ok(())
    }

    fn replay_prepare(
        &mut self,
        segment_id: u64,
        tx_id: u64,
        summary: &TransactionSummary,
        xid: Vec<u8>,
    ) -> Result<()> {
        if !self.transactions.contains_key(&tx_id) {
            track_assert!(
                !self.has_remaining_segments(summary),
                ErrorKind::JournalCorrupted,
                "Prepare record for unknown transaction: tx_id={}",
                tx_id
            );
            warn!(
                self.logger,
                "Prepare record whose operations have all been reclaimed is ignored: tx_id={}",
                tx_id
            );
            return Ok(());
        }
        if !track!(self.check_summary(tx_id, summary))? {
            return Ok(());
        }

        let tx = track_assert_some!(self.transactions.get_mut(&tx_id), ErrorKind::Other);
        track_assert!(
            !tx.is_prepared(),
            ErrorKind::JournalCorrupted,
            "Duplicate prepare record: tx_id={}",
            tx_id
        );
        track!(tx.prepare(segment_id, xid))?;
        for s in tx.segments() {
            if self.table.contains(s) {
                track!(track!(self.table.file(s))?.add_prepared_transaction(tx_id))?;
            }
        }
        Ok(())
    }

    fn replay_commit(
        &mut self,
        segment_id: u64,
        tx_id: u64,
        summary: &TransactionSummary,
    ) -> Result<()> {
        if self.discarded.remove(&tx_id) {
            return Ok(());
        }
        if !self.transactions.contains_key(&tx_id) {
            track_assert!(
                !self.has_remaining_segments(summary),
                ErrorKind::JournalCorrupted,
                "Commit record for unknown transaction: tx_id={}",
                tx_id
            );
            return Ok(());
        }
        if !track!(self.check_summary(tx_id, summary))? {
            self.discarded.remove(&tx_id);
            return Ok(());
        }

        let tx = track_assert_some!(self.transactions.remove(&tx_id), ErrorKind::Other);
        for op in tx.operations() {
            track!(self.table.apply_operation(op, ApplyMode::Replay))?;
            match *op {
                TxOperation::Delete { record_id, .. } => {
                    self.records.remove(&record_id);
                }
                TxOperation::Add { record_id, .. } | TxOperation::Update { record_id, .. } => {
                    if let Some(record) = tx.records().iter().find(|r| r.id == record_id) {
                        self.records.insert(record_id, record.clone());
                    }
                }
            }
        }
        track!(self.table.terminate(&tx, segment_id, true))?;
        Ok(())
    }

    fn replay_rollback(&mut self, segment_id: u64, tx_id: u64) -> Result<()> {
        if self.discarded.remove(&tx_id) {
            return Ok(());
        }
        if let Some(tx) = self.transactions.remove(&tx_id) {
            let pin = tx.is_prepared();
            track!(self.table.terminate(&tx, segment_id, pin))?;
        }
        Ok(())
    }

    fn has_remaining_segments(&self, summary: &TransactionSummary) -> bool {
        summary.iter().any(|&(s, _)| self.table.contains(s))
    }

    // 要約と、実際に読み込まれた操作レコード数が一致するかを確認する.
    // 一致しない場合には、トランザクションを破棄して`false`を返す.
    fn check_summary(&mut self, tx_id: u64, summary: &TransactionSummary) -> Result<bool> {
        let tx = track_assert_some!(self.transactions.get(&tx_id), ErrorKind::Other);
        let expected = summary.iter().cloned().collect::<HashMap<_, _>>();
        let matched = summary
            .iter()
            .filter(|&&(s, _)| self.table.contains(s))
            .all(|&(s, count)| tx.count_in(s) == count)
            && tx
                .summary()
                .iter()
                .all(|&(s, _)| expected.contains_key(&s));
        if matched {
            return Ok(true);
        }

        warn!(
            self.logger,
            "Transaction summary mismatch; the transaction is discarded";
            "tx_id" => tx_id, "expected" => format!("{:?}", summary), "actual" => format!("{:?}", tx.summary())
        );
        track!(self.discard(tx_id))?;
        Ok(false)
    }

    fn discard(&mut self, tx_id: u64) -> Result<()> {
        if let Some(tx) = self.transactions.remove(&tx_id) {
            for s in tx.segments() {
                if self.table.contains(s) {
                    track!(track!(self.table.file(s))?.release_transaction(tx_id))?;
                }
            }
        }
        self.discarded.insert(tx_id);
        Ok(())
    }

    // 終了レコードが見つからなかったトランザクションの扱いを決める.
    // プリペア済みのものは復元し、それ以外は破棄する.
    fn finish_transactions(&mut self) -> Result<()> {
        let unprepared = self
            .transactions
            .values()
            .filter(|tx| !tx.is_prepared())
            .map(|tx| tx.tx_id())
            .collect::<Vec<_>>();
        for tx_id in unprepared {
            warn!(
                self.logger,
                "Unterminated transaction is discarded: tx_id={}", tx_id
            );
            track!(self.discard(tx_id))?;
        }
        for tx in self.transactions.values() {
            info!(
                self.logger,
                "Prepared transaction is restored: tx_id={}, operations={}",
                tx.tx_id(),
                tx.operations().len()
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Scan {
    records: usize,
    corrupted: bool,
    end_offset: u64,
}

#[cfg(test)]
mod tests {
    use prometrics::metrics::MetricBuilder;
    use slog::Discard;
    use trackable::result::TestResult;

    use super::*;
    use crate::block::{AlignedBytes, BlockSize};
    use crate::journal::pool::PoolOptions;
    use crate::metrics::JournalMetrics;
    use crate::segment::MemorySegmentFactory;

    const FILE_SIZE: u64 = 1024;
    const REGION: usize = 50;

    fn add(record_id: u64) -> JournalRecord<Vec<u8>> {
        JournalRecord::Add {
            record_id,
            record_type: 1,
            payload: b"foo".to_vec(),
        }
    }

    fn add_tx(tx_id: u64, record_id: u64) -> JournalRecord<Vec<u8>> {
        JournalRecord::AddTx {
            tx_id,
            record_id,
            record_type: 1,
            payload: b"foo".to_vec(),
        }
    }

    fn prepare(tx_id: u64, summary: &[(u64, u32)]) -> JournalRecord<Vec<u8>> {
        JournalRecord::Prepare {
            tx_id,
            summary: summary.to_vec(),
            xid: b"xid".to_vec(),
        }
    }

    fn commit(tx_id: u64, summary: &[(u64, u32)]) -> JournalRecord<Vec<u8>> {
        JournalRecord::Commit {
            tx_id,
            summary: summary.to_vec(),
        }
    }

    fn write_segment(
        factory: &MemorySegmentFactory,
        name: &str,
        segment_id: u64,
        records: &[JournalRecord<Vec<u8>>],
    ) -> Result<()> {
        let header = SegmentHeader::new(segment_id, Uuid::nil(), BlockSize::min());
        let mut buf = Vec::new();
        track!(header.write_header_region_to(&mut buf))?;
        for record in records {
            track!(record.write_to(segment_id, &mut buf))?;
        }
        let mut storage = track!(factory.create(name, FILE_SIZE))?;
        let bytes = AlignedBytes::from_bytes(&buf, BlockSize::min());
        track!(storage.write_aligned_at(0, &bytes))?;
        Ok(())
    }

    fn load(factory: &MemorySegmentFactory) -> Result<(Recovered, SegmentTable)> {
        let options = PoolOptions {
            min_files: 2,
            file_size: FILE_SIZE,
            block_size: BlockSize::min(),
            prefix: "journal-".to_owned(),
            extension: "jnl".to_owned(),
            instance_uuid: Uuid::nil(),
        };
        let logger = Logger::root(Discard, o!());
        let metrics = JournalMetrics::new(&MetricBuilder::new());
        let mut pool = FilePool::new(factory.clone(), options, logger.clone(), metrics);
        let mut table = SegmentTable::new();
        let recovered = track!(Loader::new(&mut pool, &mut table, logger, None).load())?;
        Ok((recovered, table))
    }

    fn load_error(factory: &MemorySegmentFactory) -> Option<ErrorKind> {
        load(factory).err().map(|e| *e.kind())
    }

    #[test]
    fn replay_restores_counters_and_live_sizes() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(
            &factory,
            "journal-1.jnl",
            1,
            &[add(1), add(2), add(3)]
        ))?;
        track!(write_segment(
            &factory,
            "journal-2.jnl",
            2,
            &[JournalRecord::Delete { record_id: 1 }, add(4)]
        ))?;

        let (recovered, table) = track!(load(&factory))?;
        assert_eq!(
            recovered
                .result
                .records
                .iter()
                .map(|r| r.id)
                .collect::<Vec<_>>(),
            vec![2, 3, 4]
        );

        let seg1 = track!(table.file(1))?;
        assert_eq!(seg1.pos_count(), 3);
        assert_eq!(seg1.live_size(), 66);
        assert_eq!(seg1.write_offset(), (REGION + 33 * 3) as u64);

        let seg2 = track!(table.file(2))?;
        assert_eq!(seg2.pos_count(), 1);
        assert_eq!(
            track!(seg2.neg_counts())?,
            vec![(1, 1)].into_iter().collect()
        );
        assert_eq!(seg2.live_size(), 33);

        // インデックスは、各レコードの最新の内容の位置を指している
        let location = track_assert_some!(table.index().get(4), ErrorKind::Other);
        assert_eq!(
            location,
            RecordLocation {
                segment_id: 2,
                offset: (REGION + 25) as u64,
                size: 33,
            }
        );
        Ok(())
    }

    #[test]
    fn commit_for_unknown_transaction_is_fatal() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(&factory, "journal-1.jnl", 1, &[add(1)]))?;
        track!(write_segment(
            &factory,
            "journal-2.jnl",
            2,
            &[commit(5, &[(1, 1)])]
        ))?;
        assert_eq!(load_error(&factory), Some(ErrorKind::JournalCorrupted));
        Ok(())
    }

    #[test]
    fn prepare_for_unknown_transaction_is_fatal() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(&factory, "journal-1.jnl", 1, &[add(1)]))?;
        track!(write_segment(
            &factory,
            "journal-2.jnl",
            2,
            &[prepare(5, &[(1, 1)])]
        ))?;
        assert_eq!(load_error(&factory), Some(ErrorKind::JournalCorrupted));
        Ok(())
    }

    #[test]
    fn lost_operation_of_committed_transaction_is_fatal() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(
            &factory,
            "journal-1.jnl",
            1,
            &[add(1), add_tx(5, 2)]
        ))?;
        track!(write_segment(
            &factory,
            "journal-2.jnl",
            2,
            &[commit(5, &[(1, 1)])]
        ))?;

        // セグメント1の二番目のレコード(トランザクション内の追加)の本体を壊す
        let offset = REGION + 33 + 13 + 4;
        let bytes = track!(factory.bytes("journal-1.jnl"))?;
        let bytes = track_assert_some!(bytes, ErrorKind::Other);
        track!(factory.overwrite("journal-1.jnl", offset, &[!bytes[offset]]))?;

        // 末尾の破損としては扱われず、後続のコミットが対応する操作を見つけられないことで検出される
        assert_eq!(load_error(&factory), Some(ErrorKind::JournalCorrupted));
        Ok(())
    }

    #[test]
    fn orphan_terminators_are_ignored() -> TestResult {
        let factory = MemorySegmentFactory::new();

        // トランザクションのレコードを含んでいたセグメント1と2は、既に回収済み
        track!(write_segment(
            &factory,
            "journal-3.jnl",
            3,
            &[
                prepare(5, &[(1, 1)]),
                commit(6, &[(2, 1)]),
                JournalRecord::Rollback { tx_id: 7 },
                add(1),
            ]
        ))?;

        let (recovered, table) = track!(load(&factory))?;
        assert_eq!(
            recovered
                .result
                .records
                .iter()
                .map(|r| r.id)
                .collect::<Vec<_>>(),
            vec![1]
        );
        assert!(recovered.result.prepared_transactions.is_empty());

        let seg3 = track!(table.file(3))?;
        assert!(!track!(seg3.has_open_transactions())?);
        assert!(track!(seg3.pinned_segments())?.is_empty());
        Ok(())
    }

    #[test]
    fn summary_mismatch_discards_transaction() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(
            &factory,
            "journal-1.jnl",
            1,
            &[add_tx(5, 1), add_tx(6, 2)]
        ))?;
        track!(write_segment(
            &factory,
            "journal-2.jnl",
            2,
            &[
                // 要約では二つの操作があることになっている
                commit(5, &[(1, 2)]),
                // セグメント2には操作が存在しない
                prepare(6, &[(1, 1), (2, 1)]),
                // 破棄済みのトランザクションの終了レコードは読み飛ばされる
                JournalRecord::Rollback { tx_id: 6 },
                add(3),
            ]
        ))?;

        let (recovered, table) = track!(load(&factory))?;
        assert_eq!(
            recovered
                .result
                .records
                .iter()
                .map(|r| r.id)
                .collect::<Vec<_>>(),
            vec![3]
        );
        assert!(recovered.result.prepared_transactions.is_empty());
        assert!(recovered.transactions.is_empty());

        let seg1 = track!(table.file(1))?;
        assert_eq!(seg1.pos_count(), 0);
        assert!(!track!(seg1.has_open_transactions())?);
        Ok(())
    }

    #[test]
    fn operation_for_discarded_transaction_is_fatal() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(
            &factory,
            "journal-1.jnl",
            1,
            &[add_tx(5, 1), prepare(5, &[(1, 2)]), add_tx(5, 2)]
        ))?;
        assert_eq!(load_error(&factory), Some(ErrorKind::JournalCorrupted));
        Ok(())
    }

    #[test]
    fn operation_after_prepare_is_fatal() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(
            &factory,
            "journal-1.jnl",
            1,
            &[add_tx(5, 1), prepare(5, &[(1, 1)]), add_tx(5, 2)]
        ))?;
        assert_eq!(load_error(&factory), Some(ErrorKind::JournalCorrupted));
        Ok(())
    }

    #[test]
    fn prepared_transaction_is_restored() -> TestResult {
        let factory = MemorySegmentFactory::new();
        track!(write_segment(
            &factory,
            "journal-1.jnl",
            1,
            &[
                add(1),
                JournalRecord::UpdateTx {
                    tx_id: 5,
                    record_id: 1,
                    record_type: 2,
                    payload: b"bar".to_vec(),
                },
            ]
        ))?;
        track!(write_segment(
            &factory,
            "journal-2.jnl",
            2,
            &[prepare(5, &[(1, 1)])]
        ))?;

        let (recovered, table) = track!(load(&factory))?;
        assert_eq!(recovered.result.prepared_transactions.len(), 1);
        let prepared = &recovered.result.prepared_transactions[0];
        assert_eq!(prepared.tx_id, 5);
        assert_eq!(prepared.xid, b"xid".to_vec());
        assert_eq!(
            prepared.records,
            vec![RecordInfo {
                id: 1,
                record_type: 2,
                payload: b"bar".to_vec(),
            }]
        );

        // 効果はまだ適用されておらず、関係するセグメントは回収対象外
        assert_eq!(recovered.result.records.len(), 1);
        assert_eq!(recovered.result.records[0].payload, b"foo".to_vec());
        for s in 1..3 {
            assert!(track!(track!(table.file(s))?.has_open_transactions())?);
        }
        Ok(())
    }

    #[test]
    fn stale_segment_name_is_fixed() -> TestResult {
        let factory = MemorySegmentFactory::new();

        // 再利用の途中でクラッシュし、ヘッダだけが新しい順序IDに書き換わった状態
        track!(write_segment(&factory, "journal-1.jnl", 7, &[add(1)]))?;

        let (recovered, table) = track!(load(&factory))?;
        assert_eq!(recovered.result.records.len(), 1);
        assert!(table.contains(7));
        assert!(!table.contains(1));

        let names = track!(factory.list())?;
        assert!(names.contains(&"journal-7.jnl".to_owned()));
        assert!(!names.contains(&"journal-1.jnl".to_owned()));
        Ok(())
    }
}
