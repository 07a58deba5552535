//! 不要になったセグメントの判定.
//!
//! セグメント`F`は、以下を満たす場合に回収可能となる:
//!
//! ```text
//! Σ_X X.neg_count_for(F) == F.pos_count()
//! ```
//!
//! つまり`F`を起点とする全てのレコードが、いずれかのセグメント(`F`自身を含む)の
//! 更新ないし削除レコードによって打ち消されていれば、`F`はもう必要ない.
//!
//! ただし、回収の結果として削除済みのデータがリカバリ時に復活することがないように、
//! 述語を満たすセグメントであっても、以下の場合には保持される:
//!
//! - 書き込み対象のセグメント、および未終了のトランザクションを含むセグメント
//! - 保持されるセグメントのレコードを打ち消しているセグメント
//! - 保持されるセグメントに属するトランザクションの、終了レコードを含むセグメント
use std::collections::{BTreeMap, BTreeSet};

use crate::journal::file::JournalFile;
use crate::Result;

/// リクレイマが参照する、セグメントの帳簿のスナップショット.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSnapshot {
    /// セグメントの順序ID.
    pub segment_id: u64,

    /// このセグメントを起点とするレコードの数.
    pub pos_count: u64,

    /// このセグメントが打ち消した、起点セグメント毎のレコード数.
    pub neg_counts: BTreeMap<u64, u64>,

    /// このセグメントが終了レコードを保持しているトランザクションの、レコードを含むセグメント群.
    pub pinned_segments: BTreeSet<u64>,

    /// 未終了のトランザクションを含んでいるかどうか.
    pub has_open_transactions: bool,
}
impl SegmentSnapshot {
    /// `JournalFile`の現在の状態からスナップショットを作成する.
    pub fn from_file(file: &JournalFile) -> Result<Self> {
        // カウンタよりも先にトランザクションの状態を確認する
        let has_open_transactions = track!(file.has_open_transactions())?;
        Ok(SegmentSnapshot {
            segment_id: file.segment_id(),
            pos_count: file.pos_count(),
            neg_counts: track!(file.neg_counts())?,
            pinned_segments: track!(file.pinned_segments())?,
            has_open_transactions,
        })
    }

    fn neg_count_for(&self, origin: u64) -> u64 {
        self.neg_counts.get(&origin).cloned().unwrap_or(0)
    }
}

/// `target`が回収可能な状態かどうかを判定する.
///
/// `segments`には、`target`自身も含めた全てのセグメントを渡す必要がある.
pub fn is_reclaimable(target: &SegmentSnapshot, segments: &[SegmentSnapshot]) -> bool {
    let negs: u64 = segments
        .iter()
        .map(|s| s.neg_count_for(target.segment_id))
        .sum();
    negs == target.pos_count
}

/// 回収対象となるセグメント群を、順序IDの昇順で返す.
///
/// `current`は書き込み対象のセグメントの順序ID.
pub fn plan(segments: &[SegmentSnapshot], current: Option<u64>) -> Vec<u64> {
    let mut ordered = segments.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|s| s.segment_id);

    let mut retained = BTreeSet::new();
    let mut candidates = BTreeSet::new();
    for s in &ordered {
        if Some(s.segment_id) != current
            && !s.has_open_transactions
            && is_reclaimable(s, segments)
        {
            candidates.insert(s.segment_id);
        } else {
            retained.insert(s.segment_id);
        }
    }

    // 依存先(打ち消し対象ないしトランザクションのレコード)は、常に自分よりも古いセグメントなので、
    // 昇順に一度走査するだけで十分
    let mut reclaimable = Vec::new();
    for s in ordered {
        if !candidates.contains(&s.segment_id) {
            continue;
        }
        let cancels_retained = s
            .neg_counts
            .iter()
            .any(|(origin, &n)| n > 0 && *origin != s.segment_id && retained.contains(origin));
        let pinned = s.pinned_segments.iter().any(|p| retained.contains(p));
        if cancels_retained || pinned {
            retained.insert(s.segment_id);
        } else {
            reclaimable.push(s.segment_id);
        }
    }
    reclaimable
}
