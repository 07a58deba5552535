//! セグメント毎の帳簿.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{Error, Result};

/// 一つのセグメントに対応する、メモリ上の帳簿.
///
/// 以下の情報を保持する:
///
/// - 順序ID
/// - 書き込み位置
/// - `pos_count`: このセグメントを起点(origin)とする、生存したことのあるレコードの数
/// - `neg_counts`: このセグメント内の更新・削除レコードが打ち消した、他セグメント(自身を含む)のレコードの数
/// - `live_size`: このセグメントを起点とする生存レコード群の合計サイズ (コンパクションの判定に使用)
/// - トランザクションの所属情報 (アクティブ、プリペア済み、終了済み)
///
/// 追記スレッドとリクレイマとで共有されるため、各カウンタはアトミック変数ないしロックで保護されている.
#[derive(Debug)]
pub struct JournalFile {
    segment_id: u64,
    write_offset: AtomicU64,
    pos_count: AtomicU64,
    live_size: AtomicU64,
    neg_counts: Mutex<HashMap<u64, u64>>,
    transactions: Mutex<Membership>,
}
impl JournalFile {
    /// 新しい`JournalFile`インスタンスを生成する.
    pub fn new(segment_id: u64, write_offset: u64) -> Self {
        JournalFile {
            segment_id,
            write_offset: AtomicU64::new(write_offset),
            pos_count: AtomicU64::new(0),
            live_size: AtomicU64::new(0),
            neg_counts: Mutex::new(HashMap::new()),
            transactions: Mutex::new(Membership::default()),
        }
    }

    /// セグメントの順序IDを返す.
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// 次のレコードの書き込み位置を返す.
    pub fn write_offset(&self) -> u64 {
        self.write_offset.load(Ordering::SeqCst)
    }

    pub(crate) fn set_write_offset(&self, offset: u64) {
        self.write_offset.store(offset, Ordering::SeqCst);
    }

    /// このセグメントを起点とするレコードが一つ生存状態になったことを記録する.
    pub fn inc_pos(&self) {
        self.pos_count.fetch_add(1, Ordering::SeqCst);
    }

    /// `pos_count`の値を返す.
    pub fn pos_count(&self) -> u64 {
        self.pos_count.load(Ordering::SeqCst)
    }

    pub(crate) fn add_live_size(&self, size: u64) {
        self.live_size.fetch_add(size, Ordering::SeqCst);
    }

    pub(crate) fn sub_live_size(&self, size: u64) {
        let mut current = self.live_size.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(size);
            match self.live_size.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// このセグメントを起点とする生存レコード群の合計サイズを返す.
    pub fn live_size(&self) -> u64 {
        self.live_size.load(Ordering::SeqCst)
    }

    /// このセグメント内のレコードが、`origin`を起点とするレコードを一つ打ち消したことを記録する.
    pub fn inc_neg(&self, origin: u64) -> Result<()> {
        let mut negs = track!(self.neg_counts.lock().map_err(Error::from))?;
        *negs.entry(origin).or_insert(0) += 1;
        Ok(())
    }

    /// 起点セグメント毎の`neg_count`のスナップショットを返す.
    pub fn neg_counts(&self) -> Result<BTreeMap<u64, u64>> {
        let negs = track!(self.neg_counts.lock().map_err(Error::from))?;
        Ok(negs.iter().map(|(&k, &v)| (k, v)).collect())
    }

    /// 削除されたセグメントに関する情報を取り除く.
    pub(crate) fn forget_segment(&self, segment_id: u64) -> Result<()> {
        track!(self.neg_counts.lock().map_err(Error::from))?.remove(&segment_id);
        let mut transactions = track!(self.transactions.lock().map_err(Error::from))?;
        for segments in transactions.terminated.values_mut() {
            segments.remove(&segment_id);
        }
        Ok(())
    }

    /// トランザクションのレコードがこのセグメントに書き込まれたことを記録する.
    pub fn add_active_transaction(&self, tx_id: u64) -> Result<()> {
        let mut transactions = track!(self.transactions.lock().map_err(Error::from))?;
        transactions.active.insert(tx_id);
        Ok(())
    }

    /// トランザクションがプリペアされたことを記録する.
    pub fn add_prepared_transaction(&self, tx_id: u64) -> Result<()> {
        let mut transactions = track!(self.transactions.lock().map_err(Error::from))?;
        transactions.prepared.insert(tx_id);
        Ok(())
    }

    /// トランザクションの終了に伴い、アクティブおよびプリペア済みの集合から取り除く.
    pub fn release_transaction(&self, tx_id: u64) -> Result<()> {
        let mut transactions = track!(self.transactions.lock().map_err(Error::from))?;
        transactions.active.remove(&tx_id);
        transactions.prepared.remove(&tx_id);
        Ok(())
    }

    /// トランザクションの終了レコード(コミット・ロールバック)がこのセグメントに書き込まれたことを記録する.
    ///
    /// `segments`は、そのトランザクションのレコードを保持しているセグメント群.
    /// それらが残っている間は、このセグメントも回収されない.
    pub fn add_terminated_transaction<I>(&self, tx_id: u64, segments: I) -> Result<()>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut transactions = track!(self.transactions.lock().map_err(Error::from))?;
        let segment_id = self.segment_id;
        transactions
            .terminated
            .entry(tx_id)
            .or_insert_with(BTreeSet::new)
            .extend(segments.into_iter().filter(|&s| s != segment_id));
        Ok(())
    }

    /// 未終了のトランザクション(アクティブないしプリペア済み)を含んでいるかどうかを判定する.
    pub fn has_open_transactions(&self) -> Result<bool> {
        let transactions = track!(self.transactions.lock().map_err(Error::from))?;
        Ok(!(transactions.active.is_empty() && transactions.prepared.is_empty()))
    }

    /// このセグメントに終了レコードが存在するトランザクション群の、レコードを保持するセグメントの一覧.
    pub fn pinned_segments(&self) -> Result<BTreeSet<u64>> {
        let transactions = track!(self.transactions.lock().map_err(Error::from))?;
        Ok(transactions
            .terminated
            .values()
            .flat_map(|s| s.iter().cloned())
            .collect())
    }
}

#[derive(Debug, Default)]
struct Membership {
    active: HashSet<u64>,
    prepared: HashSet<u64>,
    terminated: HashMap<u64, BTreeSet<u64>>,
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn counters_work() -> TestResult {
        let file = JournalFile::new(3, 512);
        assert_eq!(file.segment_id(), 3);
        assert_eq!(file.write_offset(), 512);
        assert_eq!(file.pos_count(), 0);
        assert!(track!(file.neg_counts())?.is_empty());

        file.inc_pos();
        file.inc_pos();
        track!(file.inc_neg(1))?;
        track!(file.inc_neg(3))?;
        track!(file.inc_neg(3))?;
        assert_eq!(file.pos_count(), 2);
        assert_eq!(
            track!(file.neg_counts())?,
            vec![(1, 1), (3, 2)].into_iter().collect()
        );

        track!(file.forget_segment(1))?;
        assert_eq!(
            track!(file.neg_counts())?,
            vec![(3, 2)].into_iter().collect()
        );
        Ok(())
    }

    #[test]
    fn live_size_works() {
        let file = JournalFile::new(1, 0);
        file.add_live_size(33);
        file.add_live_size(40);
        assert_eq!(file.live_size(), 73);

        file.sub_live_size(33);
        assert_eq!(file.live_size(), 40);

        // 下限は0
        file.sub_live_size(100);
        assert_eq!(file.live_size(), 0);
    }

    #[test]
    fn transaction_membership_works() -> TestResult {
        let file = JournalFile::new(5, 0);
        assert!(!track!(file.has_open_transactions())?);

        track!(file.add_active_transaction(10))?;
        assert!(track!(file.has_open_transactions())?);

        track!(file.add_prepared_transaction(10))?;
        track!(file.release_transaction(10))?;
        assert!(!track!(file.has_open_transactions())?);

        track!(file.add_prepared_transaction(11))?;
        assert!(track!(file.has_open_transactions())?);
        track!(file.release_transaction(11))?;

        track!(file.add_terminated_transaction(10, vec![2, 5, 4]))?;
        assert_eq!(
            track!(file.pinned_segments())?,
            vec![2, 4].into_iter().collect()
        );

        track!(file.forget_segment(2))?;
        assert_eq!(
            track!(file.pinned_segments())?,
            vec![4].into_iter().collect()
        );
        Ok(())
    }
}
