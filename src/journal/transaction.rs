//! 進行中のトランザクション.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::journal::index::RecordLocation;
use crate::journal::record::TransactionSummary;
use crate::record::RecordInfo;
use crate::{ErrorKind, Result};

/// トランザクションに属する一つの操作.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOperation {
    Add {
        record_id: u64,
        location: RecordLocation,
    },
    Update {
        record_id: u64,
        location: RecordLocation,
    },
    Delete {
        record_id: u64,
        segment_id: u64,
    },
}
impl TxOperation {
    /// 操作対象のレコードのIDを返す.
    pub fn record_id(&self) -> u64 {
        match *self {
            TxOperation::Add { record_id, .. }
            | TxOperation::Update { record_id, .. }
            | TxOperation::Delete { record_id, .. } => record_id,
        }
    }

    /// 操作のレコードが書き込まれたセグメントの順序IDを返す.
    pub fn segment_id(&self) -> u64 {
        match *self {
            TxOperation::Add { location, .. } | TxOperation::Update { location, .. } => {
                location.segment_id
            }
            TxOperation::Delete { segment_id, .. } => segment_id,
        }
    }
}

/// トランザクションの状態.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// 操作を受け付けている状態.
    Active,

    /// プリペア済み.
    ///
    /// 以降は、コミットかロールバックのみが可能.
    Prepared {
        /// プリペアレコードが書き込まれたセグメント.
        segment_id: u64,

        /// 二相コミットのトランザクションブランチ識別子.
        xid: Vec<u8>,
    },
}

/// メモリ上で操作を蓄積しているトランザクション.
///
/// 操作の効果(インデックスやカウンタの更新)は、コミット時に初めて適用される.
#[derive(Debug, Clone)]
pub struct Transaction {
    tx_id: u64,
    state: TransactionState,
    operations: Vec<TxOperation>,
    segment_counts: BTreeMap<u64, u32>,

    // トランザクション内から見た各レコードの生存状態
    visible: HashMap<u64, bool>,

    // リカバリ時にのみ使われる、追加・更新されたレコードの内容
    records: Vec<RecordInfo>,
}
impl Transaction {
    /// 新しい`Transaction`インスタンスを生成する.
    pub fn new(tx_id: u64) -> Self {
        Transaction {
            tx_id,
            state: TransactionState::Active,
            operations: Vec::new(),
            segment_counts: BTreeMap::new(),
            visible: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// トランザクションIDを返す.
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// 現在の状態を返す.
    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// プリペア済みかどうかを判定する.
    pub fn is_prepared(&self) -> bool {
        if let TransactionState::Prepared { .. } = self.state {
            true
        } else {
            false
        }
    }

    /// 蓄積されている操作群を、発行順に返す.
    pub fn operations(&self) -> &[TxOperation] {
        &self.operations
    }

    /// 追加・更新されたレコードの内容を返す.
    ///
    /// リカバリによって復元されたトランザクション以外では、常に空となる.
    pub fn records(&self) -> &[RecordInfo] {
        &self.records
    }

    /// トランザクション内から見た、レコードの生存状態を返す.
    ///
    /// このトランザクションで操作されていないレコードの場合には`None`が返される.
    pub fn visibility(&self, record_id: u64) -> Option<bool> {
        self.visible.get(&record_id).cloned()
    }

    /// 操作を追加する.
    ///
    /// # Errors
    ///
    /// プリペア済みの場合には`ErrorKind::IllegalTransactionState`が返される.
    pub fn push(&mut self, operation: TxOperation) -> Result<()> {
        track_assert_eq!(
            self.state,
            TransactionState::Active,
            ErrorKind::IllegalTransactionState,
            "tx_id={}",
            self.tx_id
        );
        *self
            .segment_counts
            .entry(operation.segment_id())
            .or_insert(0) += 1;
        let exists = match operation {
            TxOperation::Delete { .. } => false,
            _ => true,
        };
        self.visible.insert(operation.record_id(), exists);
        self.operations.push(operation);
        Ok(())
    }

    /// 追加ないし更新されたレコードの内容を保持しておく.
    pub(crate) fn push_record(&mut self, record: RecordInfo) {
        self.records.retain(|r| r.id != record.id);
        self.records.push(record);
    }

    /// トランザクションをプリペア済みにする.
    ///
    /// # Errors
    ///
    /// 既にプリペア済みの場合には`ErrorKind::IllegalTransactionState`が、
    /// 操作が一つも存在しない場合には`ErrorKind::TransactionNotFound`が返される.
    pub fn prepare(&mut self, segment_id: u64, xid: Vec<u8>) -> Result<()> {
        track_assert_eq!(
            self.state,
            TransactionState::Active,
            ErrorKind::IllegalTransactionState,
            "tx_id={}",
            self.tx_id
        );
        track_assert!(
            !self.operations.is_empty(),
            ErrorKind::TransactionNotFound,
            "tx_id={}",
            self.tx_id
        );
        self.state = TransactionState::Prepared { segment_id, xid };
        Ok(())
    }

    /// セグメント毎の操作レコード数の要約を返す.
    pub fn summary(&self) -> TransactionSummary {
        self.segment_counts
            .iter()
            .map(|(&segment_id, &count)| (segment_id, count))
            .collect()
    }

    /// 指定セグメント内の操作レコードの数を返す.
    pub fn count_in(&self, segment_id: u64) -> u32 {
        self.segment_counts.get(&segment_id).cloned().unwrap_or(0)
    }

    /// このトランザクションのレコード(プリペアレコードを含む)を保持しているセグメント群を返す.
    pub fn segments(&self) -> BTreeSet<u64> {
        let mut segments = self.segment_counts.keys().cloned().collect::<BTreeSet<_>>();
        if let TransactionState::Prepared { segment_id, .. } = self.state {
            segments.insert(segment_id);
        }
        segments
    }

    /// このトランザクションが操作したレコードのID群を返す.
    pub fn touched_records(&self) -> impl Iterator<Item = u64> + '_ {
        self.visible.keys().cloned()
    }

    /// 削除されたレコードのID群を、発行順に返す.
    pub fn deleted_records(&self) -> Vec<u64> {
        self.operations
            .iter()
            .filter_map(|op| match *op {
                TxOperation::Delete { record_id, .. } => Some(record_id),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    fn at(segment_id: u64) -> RecordLocation {
        RecordLocation {
            segment_id,
            offset: 0,
            size: 33,
        }
    }

    #[test]
    fn operations_are_accumulated() -> TestResult {
        let mut tx = Transaction::new(1);
        assert_eq!(tx.tx_id(), 1);
        assert_eq!(tx.visibility(10), None);

        track!(tx.push(TxOperation::Add {
            record_id: 10,
            location: at(3)
        }))?;
        track!(tx.push(TxOperation::Update {
            record_id: 10,
            location: at(4)
        }))?;
        track!(tx.push(TxOperation::Delete {
            record_id: 11,
            segment_id: 4
        }))?;
        assert_eq!(tx.operations().len(), 3);
        assert_eq!(tx.visibility(10), Some(true));
        assert_eq!(tx.visibility(11), Some(false));
        assert_eq!(tx.summary(), vec![(3, 1), (4, 2)]);
        assert_eq!(tx.count_in(4), 2);
        assert_eq!(tx.count_in(5), 0);
        assert_eq!(tx.deleted_records(), vec![11]);

        let mut touched = tx.touched_records().collect::<Vec<_>>();
        touched.sort();
        assert_eq!(touched, vec![10, 11]);
        Ok(())
    }

    #[test]
    fn prepare_works() -> TestResult {
        let mut tx = Transaction::new(1);

        // 空のトランザクションはプリペアできない
        let e = tx.prepare(5, Vec::new()).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::TransactionNotFound));

        track!(tx.push(TxOperation::Add {
            record_id: 10,
            location: at(3)
        }))?;
        track!(tx.prepare(5, b"xid".to_vec()))?;
        assert!(tx.is_prepared());
        assert_eq!(tx.segments(), vec![3, 5].into_iter().collect());

        // プリペア後の操作追加・再プリペアは不可
        let e = tx
            .push(TxOperation::Delete {
                record_id: 10,
                segment_id: 5,
            })
            .err()
            .map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::IllegalTransactionState));

        let e = tx.prepare(5, Vec::new()).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::IllegalTransactionState));
        Ok(())
    }
}
