//! セグメント群の帳簿とインデックスの管理.
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::journal::file::JournalFile;
use crate::journal::index::{RecordIndex, RecordLocation};
use crate::journal::reclaimer::SegmentSnapshot;
use crate::journal::transaction::{Transaction, TxOperation};
use crate::{ErrorKind, Result};

/// 操作の適用モード.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// 通常の追記時.
    ///
    /// 事前に検証が済んでいるため、前提が満たされない場合は内部不整合となる.
    Live,

    /// リカバリ時.
    ///
    /// 起点セグメントが既に回収されている可能性があるため、
    /// 未知のレコードに対する更新は新規追加とみなし、削除は無視する.
    Replay,
}

/// 既知のセグメント群の帳簿と、生存レコードのインデックスを保持する.
///
/// レコードの追加・更新・削除の効果は、全てこのテーブルを経由して適用される.
#[derive(Debug, Default)]
pub struct SegmentTable {
    files: BTreeMap<u64, Arc<JournalFile>>,
    index: RecordIndex,
}
impl SegmentTable {
    /// 新しい`SegmentTable`インスタンスを生成する.
    pub fn new() -> Self {
        Self::default()
    }

    /// 生存レコードのインデックスを返す.
    pub fn index(&self) -> &RecordIndex {
        &self.index
    }

    /// 既知のセグメント群の帳簿を、順序IDの昇順で返す.
    pub fn files(&self) -> impl Iterator<Item = &Arc<JournalFile>> {
        self.files.values()
    }

    /// 指定セグメントが既知かどうかを判定する.
    pub fn contains(&self, segment_id: u64) -> bool {
        self.files.contains_key(&segment_id)
    }

    /// 指定セグメントの帳簿を返す.
    pub fn file(&self, segment_id: u64) -> Result<&Arc<JournalFile>> {
        let file = self.files.get(&segment_id);
        let file = track_assert_some!(
            file,
            ErrorKind::InconsistentState,
            "Unknown segment: {}",
            segment_id
        );
        Ok(file)
    }

    /// セグメントを登録する.
    pub fn insert_file(&mut self, file: Arc<JournalFile>) {
        self.files.insert(file.segment_id(), file);
    }

    /// セグメントを取り除き、他のセグメントが保持している関連情報も削除する.
    pub fn remove_file(&mut self, segment_id: u64) -> Result<Option<Arc<JournalFile>>> {
        let removed = self.files.remove(&segment_id);
        for file in self.files.values() {
            track!(file.forget_segment(segment_id))?;
        }
        Ok(removed)
    }

    /// 全てのセグメントのスナップショットを取得する.
    pub fn snapshots(&self) -> Result<Vec<SegmentSnapshot>> {
        self.files
            .values()
            .map(|f| track!(SegmentSnapshot::from_file(f)))
            .collect()
    }

    /// レコードの追加を適用する.
    pub fn apply_add(
        &mut self,
        record_id: u64,
        location: RecordLocation,
        mode: ApplyMode,
    ) -> Result<()> {
        let kind = match mode {
            ApplyMode::Live => ErrorKind::InconsistentState,
            ApplyMode::Replay => ErrorKind::JournalCorrupted,
        };
        track_assert!(
            !self.index.contains(record_id),
            kind,
            "Duplicate record: record_id={}, segment_id={}",
            record_id,
            location.segment_id
        );
        let file = track!(self.file(location.segment_id))?;
        file.inc_pos();
        file.add_live_size(location.size);
        self.index.insert(record_id, location);
        Ok(())
    }

    /// レコードの更新を適用する.
    ///
    /// 更新レコードを含むセグメントが新たな起点となり、以前の起点のレコードは打ち消される.
    pub fn apply_update(
        &mut self,
        record_id: u64,
        location: RecordLocation,
        mode: ApplyMode,
    ) -> Result<()> {
        let origin = self.index.get(record_id);
        if origin.is_none() {
            track_assert_eq!(
                mode,
                ApplyMode::Replay,
                ErrorKind::InconsistentState,
                "No such record: {}",
                record_id
            );
        }

        let file = track!(self.file(location.segment_id))?;
        file.inc_pos();
        file.add_live_size(location.size);
        if let Some(origin) = origin {
            track!(file.inc_neg(origin.segment_id))?;
            self.cancel(origin);
        }
        self.index.insert(record_id, location);
        Ok(())
    }

    /// レコードの削除を適用する.
    pub fn apply_delete(&mut self, record_id: u64, segment_id: u64, mode: ApplyMode) -> Result<()> {
        if let Some(origin) = self.index.remove(record_id) {
            track!(self.file(segment_id)?.inc_neg(origin.segment_id))?;
            self.cancel(origin);
        } else {
            track_assert_eq!(
                mode,
                ApplyMode::Replay,
                ErrorKind::InconsistentState,
                "No such record: {}",
                record_id
            );
        }
        Ok(())
    }

    fn cancel(&self, origin: RecordLocation) {
        // 起点セグメントが既に回収されている場合は何もしない
        if let Some(file) = self.files.get(&origin.segment_id) {
            file.sub_live_size(origin.size);
        }
    }

    /// トランザクション内の操作を適用する.
    ///
    /// カウンタは、コミットレコードではなく、操作レコードを含むセグメントに対して加算される.
    pub fn apply_operation(&mut self, operation: &TxOperation, mode: ApplyMode) -> Result<()> {
        match *operation {
            TxOperation::Add {
                record_id,
                location,
            } => track!(self.apply_add(record_id, location, mode)),
            TxOperation::Update {
                record_id,
                location,
            } => track!(self.apply_update(record_id, location, mode)),
            TxOperation::Delete {
                record_id,
                segment_id,
            } => track!(self.apply_delete(record_id, segment_id, mode)),
        }
    }

    /// トランザクションが`terminator`上で終了したことを記録する.
    ///
    /// `pin`が`true`の場合には、トランザクションのレコードを含むセグメント群が残っている間は、
    /// `terminator`が回収されないようにする.
    pub fn terminate(&self, tx: &Transaction, terminator: u64, pin: bool) -> Result<()> {
        let segments = tx
            .segments()
            .into_iter()
            .filter(|s| self.files.contains_key(s))
            .collect::<Vec<_>>();
        for s in &segments {
            track!(self.files[s].release_transaction(tx.tx_id()))?;
        }
        if pin {
            track!(self
                .file(terminator)?
                .add_terminated_transaction(tx.tx_id(), segments))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    fn table(segments: &[u64]) -> SegmentTable {
        let mut table = SegmentTable::new();
        for &s in segments {
            table.insert_file(Arc::new(JournalFile::new(s, 0)));
        }
        table
    }

    fn at(segment_id: u64, offset: u64) -> RecordLocation {
        RecordLocation {
            segment_id,
            offset,
            size: 33,
        }
    }

    fn counters(table: &SegmentTable, segment_id: u64) -> Result<(u64, BTreeMap<u64, u64>)> {
        let file = track!(table.file(segment_id))?;
        Ok((file.pos_count(), track!(file.neg_counts())?))
    }

    fn live_size(table: &SegmentTable, segment_id: u64) -> Result<u64> {
        Ok(track!(table.file(segment_id))?.live_size())
    }

    #[test]
    fn add_update_delete_works() -> TestResult {
        let mut table = table(&[1, 2]);
        track!(table.apply_add(10, at(1, 50), ApplyMode::Live))?;
        track!(table.apply_add(11, at(1, 83), ApplyMode::Live))?;
        assert_eq!(track!(live_size(&table, 1))?, 66);

        track!(table.apply_update(10, at(2, 50), ApplyMode::Live))?;
        track!(table.apply_delete(11, 2, ApplyMode::Live))?;

        assert_eq!(
            table.index().iter().collect::<Vec<_>>(),
            vec![(10, at(2, 50))]
        );
        assert_eq!(track!(counters(&table, 1))?, (2, BTreeMap::new()));
        assert_eq!(
            track!(counters(&table, 2))?,
            (1, vec![(1, 2)].into_iter().collect())
        );
        assert_eq!(track!(live_size(&table, 1))?, 0);
        assert_eq!(track!(live_size(&table, 2))?, 33);

        // 重複追加・存在しないレコードの操作は内部不整合
        let e = table.apply_add(10, at(2, 83), ApplyMode::Live).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InconsistentState));
        let e = table.apply_delete(11, 2, ApplyMode::Live).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InconsistentState));
        Ok(())
    }

    #[test]
    fn replay_tolerates_reclaimed_origins() -> TestResult {
        let mut table = table(&[3]);

        // 起点が回収済みの更新は、新規追加とみなされる
        track!(table.apply_update(10, at(3, 50), ApplyMode::Replay))?;
        assert_eq!(table.index().get(10), Some(at(3, 50)));
        assert_eq!(track!(counters(&table, 3))?, (1, BTreeMap::new()));

        // 未知のレコードの削除は無視される
        track!(table.apply_delete(11, 3, ApplyMode::Replay))?;
        assert_eq!(track!(counters(&table, 3))?, (1, BTreeMap::new()));

        // 重複追加はジャーナルの破損
        let e = table.apply_add(10, at(3, 83), ApplyMode::Replay).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::JournalCorrupted));
        Ok(())
    }

    #[test]
    fn remove_file_forgets_references() -> TestResult {
        let mut table = table(&[1, 2]);
        track!(table.apply_add(10, at(1, 50), ApplyMode::Live))?;
        track!(table.apply_add(11, at(1, 83), ApplyMode::Live))?;
        track!(table.apply_delete(10, 2, ApplyMode::Live))?;
        assert_eq!(track!(table.snapshots())?.len(), 2);

        assert!(track!(table.remove_file(1))?.is_some());
        assert!(!table.contains(1));
        assert_eq!(track!(counters(&table, 2))?, (0, BTreeMap::new()));

        // 起点が失われたレコードを打ち消しても、帳簿は壊れない
        track!(table.apply_delete(11, 2, ApplyMode::Live))?;
        assert_eq!(table.index().len(), 0);
        Ok(())
    }

    #[test]
    fn terminate_works() -> TestResult {
        let mut table = table(&[1, 2, 3]);
        let mut tx = Transaction::new(7);
        track!(tx.push(TxOperation::Add {
            record_id: 10,
            location: at(1, 50)
        }))?;
        track!(table.file(1))?.add_active_transaction(7)?;
        track!(tx.prepare(2, Vec::new()))?;
        for s in tx.segments() {
            track!(table.file(s))?.add_prepared_transaction(7)?;
        }

        track!(table.apply_operation(&tx.operations()[0], ApplyMode::Live))?;
        assert_eq!(track!(live_size(&table, 1))?, 33);
        track!(table.terminate(&tx, 3, true))?;
        for s in 1..4 {
            assert!(!track!(track!(table.file(s))?.has_open_transactions())?);
        }
        assert_eq!(
            track!(track!(table.file(3))?.pinned_segments())?,
            vec![1, 2].into_iter().collect()
        );
        Ok(())
    }
}
