//! セグメント化された追記専用ジャーナル.
//!
//! レコード群は、固定長のセグメント(ファイル)群に順番に追記されていく.
//! 書き込み対象のセグメントが一杯になると、待機中の空きセグメントに切り替えられ、
//! 全てのレコードが不要になったセグメントは、回収された上で再利用ないし削除される.
//!
//! # 状態遷移
//!
//! ```text
//! Created --start()--> Started --load()--> Loaded
//!    ^                                        |
//!    +------------------stop()----------------+
//! ```
//!
//! 追記系の操作は`Loaded`状態でのみ受け付けられる.
//!
//! # セグメント回収の仕組み
//!
//! 各セグメントは、以下の二種類のカウンタを保持している:
//!
//! - `pos_count`: このセグメントを起点(origin)とするレコードの数
//! - `neg_counts`: このセグメント内の更新・削除レコードが打ち消した、起点セグメント毎のレコード数
//!
//! 全セグメントの`neg_counts`のうち、あるセグメント`F`を対象とするものの合計が`F`の`pos_count`と一致すれば、
//! `F`を起点とするレコードは全て打ち消されており、`F`は回収可能となる.
//!
//! 詳細は[reclaimer]モジュールを参照のこと.
//!
//! # コンパクション
//!
//! 長く生存するレコードが一つでも残っていると、そのセグメントは回収されない.
//! そのようなセグメントが溜まった場合には、生存レコード群を書き込み対象のセグメントに
//! 更新レコードとして書き直すことで(i.e., 起点を移すことで)、古いセグメント群を回収可能にする.
//! 書き直されたレコードは通常の更新と区別されないため、途中でクラッシュしても再起動時に特別な処理は不要.
//!
//! [reclaimer]: ./reclaimer/index.html
use prometrics::metrics::MetricBuilder;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub use self::builder::{JournalBuilder, MIN_FILE_SIZE};
pub use self::header::{SegmentHeader, MAGIC_NUMBER, MAJOR_VERSION, MINOR_VERSION};
pub use self::record::{JournalRecord, TransactionSummary};

use self::index::RecordLocation;
use self::loader::Loader;
use self::pool::{FilePool, OpenSegment, PoolOptions};
use self::reclaimer::SegmentSnapshot;
use self::table::{ApplyMode, SegmentTable};
use self::transaction::{Transaction, TxOperation};
use crate::block::AlignedBytes;
use crate::metrics::JournalMetrics;
use crate::record::LoadResult;
use crate::segment::{SegmentFactory, SegmentStorage, SyncHandle};
use crate::{Error, ErrorKind, Result};

pub mod reclaimer;

mod builder;
mod file;
mod header;
mod index;
mod loader;
mod pool;
mod record;
mod table;
mod transaction;

/// 一つのセグメントの統計情報.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    /// セグメントの順序ID.
    pub segment_id: u64,

    /// 次のレコードの書き込み位置.
    pub write_offset: u64,

    /// このセグメントを起点とするレコードの数.
    pub pos_count: u64,

    /// このセグメントが打ち消した、起点セグメント毎のレコード数.
    pub neg_counts: BTreeMap<u64, u64>,

    /// このセグメントを起点とする生存レコード群の合計サイズ.
    pub live_size: u64,
}

/// `JournalBuilder`から渡される、ジャーナル本体の設定.
#[derive(Debug, Clone)]
pub(crate) struct JournalOptions {
    pub instance_uuid: Option<Uuid>,
    pub sync_on_write: bool,
    pub auto_reclaim: bool,
    pub compact_min_files: usize,
    pub compact_percentage: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Loaded,
}

/// セグメント化された追記専用ジャーナル.
///
/// 全てのメソッドは`&self`で呼び出し可能であり、インスタンスはスレッド間で共有できる.
/// 書き込み位置の確保から書き込み完了までは内部のロックによって直列化されるが、
/// 同期(`sync=true`)の完了待ちはロックの外で行われる.
///
/// インスタンスの生成には[JournalBuilder]を使用する.
///
/// [JournalBuilder]: ./struct.JournalBuilder.html
#[derive(Debug)]
pub struct Journal<F: SegmentFactory> {
    inner: Mutex<Inner<F>>,
    options: JournalOptions,
    logger: Logger,
    metrics: JournalMetrics,
}
impl<F: SegmentFactory> Journal<F> {
    pub(crate) fn new(
        factory: F,
        pool_options: PoolOptions,
        options: JournalOptions,
        logger: Logger,
        metrics: &MetricBuilder,
    ) -> Self {
        let metrics = JournalMetrics::new(metrics);
        let pool = FilePool::new(factory, pool_options, logger.clone(), metrics.clone());
        Journal {
            inner: Mutex::new(Inner {
                state: State::Created,
                pool,
                table: SegmentTable::new(),
                current: None,
                transactions: HashMap::new(),
                tx_locks: HashMap::new(),
                compacting: false,
            }),
            options,
            logger,
            metrics,
        }
    }

    /// ジャーナルを起動する.
    ///
    /// # Errors
    ///
    /// 既に起動済みの場合には`ErrorKind::AlreadyStarted`が返される.
    pub fn start(&self) -> Result<()> {
        let mut inner = track!(self.lock())?;
        if inner.state != State::Created {
            track_panic!(ErrorKind::AlreadyStarted);
        }

        let segments = track!(inner.pool.factory().list())?;
        inner.state = State::Started;
        info!(
            self.logger,
            "Journal is started: {} files in the storage",
            segments.len()
        );
        Ok(())
    }

    /// 既存のセグメント群を読み込んで、停止前の状態を復元する.
    ///
    /// セグメントが一つも存在しない場合には、`min_files`個のセグメントが新規に作成される.
    ///
    /// 読み込みの完了後は、常に新しい空きセグメントが書き込み対象となる.
    ///
    /// # Errors
    ///
    /// 起動前に呼ばれた場合には`ErrorKind::NotStarted`が、
    /// 二回以上呼ばれた場合には`ErrorKind::AlreadyLoaded`が返される.
    ///
    /// また、セグメント群が回復不能な形で壊れている場合には`ErrorKind::JournalCorrupted`が返される.
    /// なお、末尾の書き込み途中のレコードは、エラーとはならずに単に無視される.
    ///
    /// ロードに失敗した場合、ジャーナルは`Started`状態のまま残る.
    pub fn load(&self) -> Result<LoadResult> {
        let mut guard = track!(self.lock())?;
        match guard.state {
            State::Created => track_panic!(ErrorKind::NotStarted),
            State::Loaded => track_panic!(ErrorKind::AlreadyLoaded),
            State::Started => {}
        }

        let inner = &mut *guard;
        let loader = Loader::new(
            &mut inner.pool,
            &mut inner.table,
            self.logger.clone(),
            self.options.instance_uuid,
        );
        let loaded = loader.load().and_then(|recovered| -> Result<_> {
            let current = track!(inner.pool.acquire())?;
            Ok((recovered, current))
        });
        let (recovered, current) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                track!(inner.clear())?;
                inner.state = State::Started;
                return Err(track!(e));
            }
        };

        for tx in recovered.transactions {
            for record_id in tx.touched_records() {
                inner.tx_locks.insert(record_id, tx.tx_id());
            }
            inner.transactions.insert(tx.tx_id(), tx);
        }
        inner.table.insert_file(current.file.clone());
        inner.current = Some(current);
        inner.state = State::Loaded;
        self.update_live_records(inner);

        info!(
            self.logger,
            "Journal is loaded: records={}, prepared_transactions={}, data_files={}, free_files={}",
            recovered.result.records.len(),
            recovered.result.prepared_transactions.len(),
            inner.pool.data_len(),
            inner.pool.free_len();
            "instance_uuid" => recovered.instance_uuid.to_string()
        );
        Ok(recovered.result)
    }

    /// ジャーナルを停止する.
    ///
    /// 開かれている全てのセグメントを同期した上で閉じ、`Created`状態に戻る.
    /// その後、再び`start()`と`load()`を呼び出すことが可能.
    ///
    /// 未終了のトランザクションは、メモリ上からは破棄される.
    /// (プリペア済みのものは、次回のロード時に復元される)
    pub fn stop(&self) -> Result<()> {
        let mut inner = track!(self.lock())?;
        if inner.state == State::Created {
            return Ok(());
        }
        if let Some(current) = inner.current.as_mut() {
            track!(current.storage.sync())?;
            self.metrics.syncs.increment();
        }
        track!(inner.clear())?;
        info!(self.logger, "Journal is stopped");
        Ok(())
    }

    /// レコードを追加する.
    ///
    /// `sync`が`true`の場合には、レコードが物理デバイスに同期されるまで呼び出しがブロックする.
    ///
    /// # Errors
    ///
    /// - 同じIDのレコードが既に生存している場合には`ErrorKind::DuplicateId`
    /// - 未終了のトランザクションがIDを操作中の場合には`ErrorKind::RecordIsTransactional`
    /// - レコードが大きすぎて一つのセグメントに収まらない場合には`ErrorKind::InvalidInput`
    pub fn append_add(
        &self,
        record_id: u64,
        record_type: u8,
        payload: &[u8],
        sync: bool,
    ) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.check_not_transactional(record_id))?;
            track_assert!(
                !inner.table.index().contains(record_id),
                ErrorKind::DuplicateId,
                "record_id={}",
                record_id
            );

            let record = JournalRecord::Add {
                record_id,
                record_type,
                payload,
            };
            let (location, handle) = track!(self.write(inner, &record))?;
            track!(inner
                .table
                .apply_add(record_id, location, ApplyMode::Live))?;
            self.update_live_records(inner);
            handle
        };
        track!(self.sync(&handle, sync))
    }

    /// レコードを更新する.
    ///
    /// 更新後は、このレコードを含むセグメントが、対象レコードの新たな起点となる.
    ///
    /// # Errors
    ///
    /// - 対象のレコードが存在しない場合には`ErrorKind::RecordNotFound`
    /// - 未終了のトランザクションがIDを操作中の場合には`ErrorKind::RecordIsTransactional`
    pub fn append_update(
        &self,
        record_id: u64,
        record_type: u8,
        payload: &[u8],
        sync: bool,
    ) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.check_not_transactional(record_id))?;
            track_assert!(
                inner.table.index().contains(record_id),
                ErrorKind::RecordNotFound,
                "record_id={}",
                record_id
            );

            let record = JournalRecord::Update {
                record_id,
                record_type,
                payload,
            };
            let (location, handle) = track!(self.write(inner, &record))?;
            track!(inner
                .table
                .apply_update(record_id, location, ApplyMode::Live))?;
            handle
        };
        track!(self.sync(&handle, sync))
    }

    /// レコードを削除する.
    ///
    /// # Errors
    ///
    /// - 対象のレコードが存在しない場合には`ErrorKind::RecordNotFound`
    /// - 未終了のトランザクションがIDを操作中の場合には`ErrorKind::RecordIsTransactional`
    pub fn append_delete(&self, record_id: u64, sync: bool) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.check_not_transactional(record_id))?;
            track_assert!(
                inner.table.index().contains(record_id),
                ErrorKind::RecordNotFound,
                "record_id={}",
                record_id
            );

            let record: JournalRecord<&[u8]> = JournalRecord::Delete { record_id };
            let (location, handle) = track!(self.write(inner, &record))?;
            track!(inner
                .table
                .apply_delete(record_id, location.segment_id, ApplyMode::Live))?;
            self.update_live_records(inner);
            handle
        };
        track!(self.sync(&handle, sync))
    }

    /// トランザクション内でレコードを追加する.
    ///
    /// 効果はトランザクションのコミット時に初めて反映される.
    /// それまでの間、対象のIDは、このトランザクション以外からは操作できなくなる.
    ///
    /// # Errors
    ///
    /// - 同じIDのレコードが(トランザクション内から見て)生存している場合には`ErrorKind::DuplicateId`
    /// - 他のトランザクションがIDを操作中の場合には`ErrorKind::RecordIsTransactional`
    /// - トランザクションがプリペア済みの場合には`ErrorKind::IllegalTransactionState`
    pub fn append_add_tx(
        &self,
        tx_id: u64,
        record_id: u64,
        record_type: u8,
        payload: &[u8],
    ) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.check_transactional_operation(tx_id, record_id))?;
            track_assert!(
                !inner.is_visible(tx_id, record_id),
                ErrorKind::DuplicateId,
                "tx_id={}, record_id={}",
                tx_id,
                record_id
            );

            let record = JournalRecord::AddTx {
                tx_id,
                record_id,
                record_type,
                payload,
            };
            let (location, handle) = track!(self.write(inner, &record))?;
            let op = TxOperation::Add {
                record_id,
                location,
            };
            track!(inner.register_operation(tx_id, op))?;
            handle
        };
        track!(self.sync(&handle, false))
    }

    /// トランザクション内でレコードを更新する.
    ///
    /// # Errors
    ///
    /// - 対象のレコードが(トランザクション内から見て)存在しない場合には`ErrorKind::RecordNotFound`
    /// - 他のトランザクションがIDを操作中の場合には`ErrorKind::RecordIsTransactional`
    /// - トランザクションがプリペア済みの場合には`ErrorKind::IllegalTransactionState`
    pub fn append_update_tx(
        &self,
        tx_id: u64,
        record_id: u64,
        record_type: u8,
        payload: &[u8],
    ) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.check_transactional_operation(tx_id, record_id))?;
            track_assert!(
                inner.is_visible(tx_id, record_id),
                ErrorKind::RecordNotFound,
                "tx_id={}, record_id={}",
                tx_id,
                record_id
            );

            let record = JournalRecord::UpdateTx {
                tx_id,
                record_id,
                record_type,
                payload,
            };
            let (location, handle) = track!(self.write(inner, &record))?;
            let op = TxOperation::Update {
                record_id,
                location,
            };
            track!(inner.register_operation(tx_id, op))?;
            handle
        };
        track!(self.sync(&handle, false))
    }

    /// トランザクション内でレコードを削除する.
    ///
    /// # Errors
    ///
    /// - 対象のレコードが(トランザクション内から見て)存在しない場合には`ErrorKind::RecordNotFound`
    /// - 他のトランザクションがIDを操作中の場合には`ErrorKind::RecordIsTransactional`
    /// - トランザクションがプリペア済みの場合には`ErrorKind::IllegalTransactionState`
    pub fn append_delete_tx(&self, tx_id: u64, record_id: u64) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.check_transactional_operation(tx_id, record_id))?;
            track_assert!(
                inner.is_visible(tx_id, record_id),
                ErrorKind::RecordNotFound,
                "tx_id={}, record_id={}",
                tx_id,
                record_id
            );

            let record: JournalRecord<&[u8]> = JournalRecord::DeleteTx { tx_id, record_id };
            let (location, handle) = track!(self.write(inner, &record))?;
            let op = TxOperation::Delete {
                record_id,
                segment_id: location.segment_id,
            };
            track!(inner.register_operation(tx_id, op))?;
            handle
        };
        track!(self.sync(&handle, false))
    }

    /// トランザクションをプリペアする(二相コミットの第一段階).
    ///
    /// `xid`は、トランザクションブランチ識別子で、ジャーナルはその内容を解釈しない.
    ///
    /// # Errors
    ///
    /// - 操作を一つも含まない(未知の)トランザクションの場合には`ErrorKind::TransactionNotFound`
    /// - 既にプリペア済みの場合には`ErrorKind::IllegalTransactionState`
    pub fn append_prepare(&self, tx_id: u64, xid: &[u8], sync: bool) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            let summary = {
                let tx = track!(inner.transaction(tx_id))?;
                track_assert!(
                    !tx.is_prepared(),
                    ErrorKind::IllegalTransactionState,
                    "Already prepared: tx_id={}",
                    tx_id
                );
                tx.summary()
            };

            let record = JournalRecord::Prepare {
                tx_id,
                summary,
                xid,
            };
            let (location, handle) = track!(self.write(inner, &record))?;

            let tx = track_assert_some!(
                inner.transactions.get_mut(&tx_id),
                ErrorKind::InconsistentState
            );
            track!(tx.prepare(location.segment_id, xid.to_vec()))?;
            for s in tx.segments() {
                track!(track!(inner.table.file(s))?.add_prepared_transaction(tx_id))?;
            }
            handle
        };
        track!(self.sync(&handle, sync))
    }

    /// トランザクションをコミットする.
    ///
    /// トランザクション内の操作の効果が、発行順に反映される.
    /// プリペア済みでないトランザクションもコミット可能(一相コミット).
    ///
    /// # Errors
    ///
    /// 未知のトランザクションの場合には`ErrorKind::TransactionNotFound`が返される.
    pub fn append_commit(&self, tx_id: u64, sync: bool) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            let summary = track!(inner.transaction(tx_id))?.summary();

            let record: JournalRecord<&[u8]> = JournalRecord::Commit { tx_id, summary };
            let (location, handle) = track!(self.write(inner, &record))?;

            let tx = track_assert_some!(
                inner.transactions.remove(&tx_id),
                ErrorKind::InconsistentState
            );
            for op in tx.operations() {
                track!(inner.table.apply_operation(op, ApplyMode::Live))?;
            }
            track!(inner.finish_transaction(&tx, location.segment_id, true))?;
            self.update_live_records(inner);
            handle
        };
        track!(self.sync(&handle, sync))
    }

    /// トランザクションをロールバックする.
    ///
    /// トランザクション内の操作は、何の効果も残さずに破棄される.
    ///
    /// # Errors
    ///
    /// 未知のトランザクションの場合には`ErrorKind::TransactionNotFound`が返される.
    pub fn append_rollback(&self, tx_id: u64, sync: bool) -> Result<()> {
        let handle = {
            let mut guard = track!(self.lock())?;
            let inner = &mut *guard;
            track!(inner.check_loaded())?;
            track!(inner.transaction(tx_id))?;

            let record: JournalRecord<&[u8]> = JournalRecord::Rollback { tx_id };
            let (location, handle) = track!(self.write(inner, &record))?;

            let tx = track_assert_some!(
                inner.transactions.remove(&tx_id),
                ErrorKind::InconsistentState
            );
            let pin = tx.is_prepared();
            track!(inner.finish_transaction(&tx, location.segment_id, pin))?;
            handle
        };
        track!(self.sync(&handle, sync))
    }

    /// 回収可能なセグメントを探して、再利用ないし削除する.
    ///
    /// 判定自体はロックの外で、各セグメントのカウンタのスナップショットに対して行われる.
    ///
    /// 結果値は、回収されたセグメントの数.
    pub fn check_and_reclaim_files(&self) -> Result<usize> {
        let (files, current) = {
            let inner = track!(self.lock())?;
            track!(inner.check_loaded())?;
            let files = inner.table.files().cloned().collect::<Vec<_>>();
            (files, inner.current_segment_id())
        };

        let snapshots = files
            .iter()
            .map(|f| track!(SegmentSnapshot::from_file(f)))
            .collect::<Result<Vec<_>>>()?;
        let plan = reclaimer::plan(&snapshots, current);
        if plan.is_empty() {
            return Ok(0);
        }

        let mut guard = track!(self.lock())?;
        let inner = &mut *guard;
        track!(inner.check_loaded())?;
        track!(self.reclaim(inner, &plan))
    }

    /// 書き込み対象のセグメントに空きがあっても、強制的に次のセグメントに切り替える.
    ///
    /// 切り替えに失敗した場合には、以前の書き込み対象セグメントがそのまま使われ続ける.
    pub fn force_move_next_file(&self) -> Result<()> {
        let mut guard = track!(self.lock())?;
        let inner = &mut *guard;
        track!(inner.check_loaded())?;
        track!(self.rotate_and_compact(inner))
    }

    /// コンパクションを実行する.
    ///
    /// 書き込み対象のセグメントを切り替えた上で、データセグメント群に残っている生存レコードを
    /// 新しい書き込み対象セグメントに書き直し、不要になったセグメント群を回収する.
    ///
    /// 未終了のトランザクションのレコードを含むセグメントと、
    /// 未終了のトランザクションが操作中のレコードは対象外となる.
    ///
    /// 結果値は、書き直されたレコードの数.
    pub fn compact(&self) -> Result<usize> {
        let mut guard = track!(self.lock())?;
        let inner = &mut *guard;
        track!(inner.check_loaded())?;
        track!(self.rotate(inner))?;
        track!(self.compact_segments(inner))
    }

    /// 生存しているレコードの数を返す.
    pub fn record_count(&self) -> Result<usize> {
        let inner = track!(self.lock())?;
        Ok(inner.table.index().len())
    }

    /// データセグメント(書き込みが終了し、回収を待っているセグメント)の数を返す.
    pub fn data_files_count(&self) -> Result<usize> {
        let inner = track!(self.lock())?;
        Ok(inner.pool.data_len())
    }

    /// 待機中の空きセグメントの数を返す.
    pub fn free_files_count(&self) -> Result<usize> {
        let inner = track!(self.lock())?;
        Ok(inner.pool.free_len())
    }

    /// 開かれているセグメント(書き込み対象と空きセグメント)の数を返す.
    pub fn opened_files_count(&self) -> Result<usize> {
        let inner = track!(self.lock())?;
        Ok(inner.pool.free_len() + inner.current.iter().count())
    }

    /// 既知のセグメント(データセグメントと書き込み対象)毎の統計情報を、順序IDの昇順で返す.
    pub fn segments(&self) -> Result<Vec<SegmentStats>> {
        let inner = track!(self.lock())?;
        inner
            .table
            .files()
            .map(|f| -> Result<SegmentStats> {
                Ok(SegmentStats {
                    segment_id: f.segment_id(),
                    write_offset: f.write_offset(),
                    pos_count: f.pos_count(),
                    neg_counts: track!(f.neg_counts())?,
                    live_size: f.live_size(),
                })
            })
            .collect()
    }

    /// 内部状態を人間が読める形式で返す.
    ///
    /// デバッグ用途であり、出力形式は安定していない.
    pub fn debug(&self) -> Result<String> {
        let segments = track!(self.segments())?;
        let inner = track!(self.lock())?;
        let mut s = format!(
            "state={:?}, records={}, data_files={}, free_files={}, transactions={}, current={:?}\n",
            inner.state,
            inner.table.index().len(),
            inner.pool.data_len(),
            inner.pool.free_len(),
            inner.transactions.len(),
            inner.current_segment_id()
        );
        for segment in segments {
            s += &format!(
                "  segment {}: write_offset={}, pos_count={}, neg_counts={:?}, live_size={}\n",
                segment.segment_id,
                segment.write_offset,
                segment.pos_count,
                segment.neg_counts,
                segment.live_size
            );
        }
        for free in inner.pool.free_segments() {
            s += &format!("  free {}: {}\n", free.segment_id(), free.name);
        }
        Ok(s)
    }

    /// ジャーナルのメトリクスを返す.
    pub fn metrics(&self) -> &JournalMetrics {
        &self.metrics
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<F>>> {
        track!(self.inner.lock().map_err(Error::from))
    }

    fn write<T: AsRef<[u8]>>(
        &self,
        inner: &mut Inner<F>,
        record: &JournalRecord<T>,
    ) -> Result<(RecordLocation, Arc<dyn SyncHandle>)> {
        let block_size = inner.pool.options().block_size;
        let size = record.external_size(block_size);
        track_assert!(
            size <= inner.pool.max_record_size(),
            ErrorKind::InvalidInput,
            "Too large record: size={}, max={}",
            size,
            inner.pool.max_record_size()
        );

        let capacity = inner.pool.options().file_size;
        if capacity - track!(inner.current())?.file.write_offset() < size {
            track!(self.rotate_and_compact(inner))?;

            // コンパクションによって、切り替え後のセグメントも埋まっている可能性がある
            if capacity - track!(inner.current())?.file.write_offset() < size {
                track!(self.rotate(inner))?;
            }
        }

        let current = track!(inner.current_mut())?;
        let offset = current.file.write_offset();
        let mut buf = AlignedBytes::new(size as usize, block_size);
        track!(record.write_to(current.segment_id(), &mut buf[..]))?;
        track!(current.storage.write_aligned_at(offset, &buf))?;
        current.file.set_write_offset(offset + size);

        self.metrics.appended_records.increment(record);
        self.metrics.appended_bytes.add_u64(size);
        let location = RecordLocation {
            segment_id: current.segment_id(),
            offset,
            size,
        };
        Ok((location, current.storage.sync_handle()))
    }

    // 次のセグメントの確保に成功した場合にのみ、書き込み対象を切り替える.
    // 失敗時には以前の書き込み対象がそのまま残るため、後続の追記は継続可能.
    fn rotate(&self, inner: &mut Inner<F>) -> Result<()> {
        if let Some(old) = inner.current.as_mut() {
            track!(old.storage.sync())?;
            self.metrics.syncs.increment();
        }
        let next = track!(inner.pool.acquire())?;
        if let Some(old) = inner.current.take() {
            debug!(
                self.logger,
                "Segment is closed: name={}, write_offset={}",
                old.name,
                old.file.write_offset()
            );
            inner.pool.add_data(old.segment_id(), old.name);
        }

        debug!(self.logger, "Switched to the next segment: {}", next.name);
        inner.table.insert_file(next.file.clone());
        inner.current = Some(next);
        self.metrics.rotations.increment();

        if self.options.auto_reclaim {
            let snapshots = track!(inner.table.snapshots())?;
            let plan = reclaimer::plan(&snapshots, inner.current_segment_id());
            track!(self.reclaim(inner, &plan))?;
        }
        Ok(())
    }

    fn rotate_and_compact(&self, inner: &mut Inner<F>) -> Result<()> {
        track!(self.rotate(inner))?;
        if !inner.compacting && self.needs_compaction(inner) {
            track!(self.compact_segments(inner))?;
        }
        Ok(())
    }

    // データセグメントの数が`compact_min_files`を超えており、
    // かつ生存レコードの割合が`compact_percentage`を下回っているかどうか.
    fn needs_compaction(&self, inner: &Inner<F>) -> bool {
        let min_files = self.options.compact_min_files;
        if min_files == 0 {
            return false;
        }

        let current = inner.current_segment_id();
        let mut files = 0;
        let mut live_size = 0;
        for file in inner.table.files() {
            if Some(file.segment_id()) == current {
                continue;
            }
            files += 1;
            live_size += file.live_size();
        }
        if files <= min_files {
            return false;
        }

        let total_size = files as u64 * inner.pool.options().file_size;
        live_size * 100 < total_size * u64::from(self.options.compact_percentage)
    }

    fn compact_segments(&self, inner: &mut Inner<F>) -> Result<usize> {
        inner.compacting = true;
        let result = self.rewrite_live_records(inner);
        inner.compacting = false;
        let compacted = track!(result)?;

        let snapshots = track!(inner.table.snapshots())?;
        let plan = reclaimer::plan(&snapshots, inner.current_segment_id());
        let reclaimed = track!(self.reclaim(inner, &plan))?;

        self.metrics.compactions.increment();
        self.metrics.compacted_records.add_u64(compacted as u64);
        info!(
            self.logger,
            "Compaction finished: compacted_records={}, reclaimed_segments={}",
            compacted,
            reclaimed
        );
        Ok(compacted)
    }

    // 対象のデータセグメント群の生存レコードを、書き込み対象セグメントに更新レコードとして書き直す.
    fn rewrite_live_records(&self, inner: &mut Inner<F>) -> Result<usize> {
        let current = inner.current_segment_id();
        let mut targets = BTreeSet::new();
        for file in inner.table.files() {
            if Some(file.segment_id()) != current && !track!(file.has_open_transactions())? {
                targets.insert(file.segment_id());
            }
        }

        let mut moves = BTreeMap::new();
        for (record_id, location) in inner.table.index().iter() {
            if targets.contains(&location.segment_id) && !inner.tx_locks.contains_key(&record_id) {
                moves
                    .entry(location.segment_id)
                    .or_insert_with(Vec::new)
                    .push((record_id, location));
            }
        }

        let mut compacted = 0;
        for (segment_id, records) in moves {
            let name = track_assert_some!(
                inner.pool.data_segment_name(segment_id),
                ErrorKind::InconsistentState,
                "Unknown data segment: {}",
                segment_id
            );
            let name = name.to_owned();
            let mut storage = track!(inner.pool.factory().open(&name))?;
            for (record_id, location) in records {
                let bytes = track!(storage.read_aligned_at(location.offset, location.size as usize))?;
                let record = track!(JournalRecord::read_from(&bytes[..], segment_id))?;
                let (record, _) = track_assert_some!(
                    record,
                    ErrorKind::InconsistentState,
                    "No record: record_id={}, location={:?}",
                    record_id,
                    location
                );
                let (record_type, payload) = match record {
                    JournalRecord::Add {
                        record_type,
                        payload,
                        ..
                    }
                    | JournalRecord::Update {
                        record_type,
                        payload,
                        ..
                    }
                    | JournalRecord::AddTx {
                        record_type,
                        payload,
                        ..
                    }
                    | JournalRecord::UpdateTx {
                        record_type,
                        payload,
                        ..
                    } => (record_type, payload),
                    other => track_panic!(
                        ErrorKind::InconsistentState,
                        "Unexpected record: record_id={}, record={:?}",
                        record_id,
                        other
                    ),
                };

                let update = JournalRecord::Update {
                    record_id,
                    record_type,
                    payload,
                };
                let (new_location, _) = track!(self.write(inner, &update))?;
                track!(inner
                    .table
                    .apply_update(record_id, new_location, ApplyMode::Live))?;
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    fn reclaim(&self, inner: &mut Inner<F>, plan: &[u64]) -> Result<usize> {
        let current = inner.current_segment_id();
        let plan = plan
            .iter()
            .cloned()
            .filter(|&s| inner.table.contains(s) && Some(s) != current)
            .collect::<Vec<_>>();
        if plan.is_empty() {
            return Ok(0);
        }

        // 打ち消し側のレコードが永続化される前に、起点のセグメントを消してはいけない
        if let Some(current) = inner.current.as_mut() {
            track!(current.storage.sync())?;
            self.metrics.syncs.increment();
        }
        for &segment_id in &plan {
            track!(inner.table.remove_file(segment_id))?;
            track!(inner.pool.reclaim(segment_id))?;
            self.metrics.reclaimed_segments.increment();
        }
        info!(
            self.logger,
            "{} segments are reclaimed: data_files={}, free_files={}",
            plan.len(),
            inner.pool.data_len(),
            inner.pool.free_len()
        );
        Ok(plan.len())
    }

    fn sync(&self, handle: &Arc<dyn SyncHandle>, sync: bool) -> Result<()> {
        if sync || self.options.sync_on_write {
            track!(handle.sync())?;
            self.metrics.syncs.increment();
        }
        Ok(())
    }

    fn update_live_records(&self, inner: &Inner<F>) {
        self.metrics
            .live_records
            .set(inner.table.index().len() as f64);
    }
}

#[derive(Debug)]
struct Inner<F: SegmentFactory> {
    state: State,
    pool: FilePool<F>,
    table: SegmentTable,
    current: Option<OpenSegment<F::Storage>>,
    transactions: HashMap<u64, Transaction>,

    // レコードID => それを操作中のトランザクションID
    tx_locks: HashMap<u64, u64>,

    // コンパクション中の書き込みで、再帰的にコンパクションが起動されないようにするためのフラグ
    compacting: bool,
}
impl<F: SegmentFactory> Inner<F> {
    fn check_loaded(&self) -> Result<()> {
        match self.state {
            State::Loaded => Ok(()),
            State::Created | State::Started => track_panic!(ErrorKind::NotStarted),
        }
    }

    fn check_not_transactional(&self, record_id: u64) -> Result<()> {
        if let Some(tx_id) = self.tx_locks.get(&record_id) {
            track_panic!(
                ErrorKind::RecordIsTransactional,
                "record_id={}, tx_id={}",
                record_id,
                tx_id
            );
        }
        Ok(())
    }

    fn check_transactional_operation(&self, tx_id: u64, record_id: u64) -> Result<()> {
        if let Some(tx) = self.transactions.get(&tx_id) {
            track_assert!(
                !tx.is_prepared(),
                ErrorKind::IllegalTransactionState,
                "Already prepared: tx_id={}",
                tx_id
            );
        }
        if let Some(&owner) = self.tx_locks.get(&record_id) {
            track_assert_eq!(
                owner,
                tx_id,
                ErrorKind::RecordIsTransactional,
                "record_id={}",
                record_id
            );
        }
        Ok(())
    }

    // トランザクション内から見て、レコードが生存しているかどうか
    fn is_visible(&self, tx_id: u64, record_id: u64) -> bool {
        self.transactions
            .get(&tx_id)
            .and_then(|tx| tx.visibility(record_id))
            .unwrap_or_else(|| self.table.index().contains(record_id))
    }

    fn transaction(&self, tx_id: u64) -> Result<&Transaction> {
        let tx = track_assert_some!(
            self.transactions.get(&tx_id),
            ErrorKind::TransactionNotFound,
            "tx_id={}",
            tx_id
        );
        Ok(tx)
    }

    fn register_operation(&mut self, tx_id: u64, op: TxOperation) -> Result<()> {
        let record_id = op.record_id();
        track!(track!(self.table.file(op.segment_id()))?.add_active_transaction(tx_id))?;
        track!(self
            .transactions
            .entry(tx_id)
            .or_insert_with(|| Transaction::new(tx_id))
            .push(op))?;
        self.tx_locks.insert(record_id, tx_id);
        Ok(())
    }

    fn finish_transaction(&mut self, tx: &Transaction, terminator: u64, pin: bool) -> Result<()> {
        for record_id in tx.touched_records() {
            self.tx_locks.remove(&record_id);
        }
        track!(self.table.terminate(tx, terminator, pin))
    }

    fn current(&self) -> Result<&OpenSegment<F::Storage>> {
        let current = track_assert_some!(self.current.as_ref(), ErrorKind::InconsistentState);
        Ok(current)
    }

    fn current_mut(&mut self) -> Result<&mut OpenSegment<F::Storage>> {
        let current = track_assert_some!(self.current.as_mut(), ErrorKind::InconsistentState);
        Ok(current)
    }

    fn current_segment_id(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.segment_id())
    }

    fn clear(&mut self) -> Result<()> {
        self.current = None;
        track!(self.pool.close())?;
        self.table = SegmentTable::new();
        self.transactions.clear();
        self.tx_locks.clear();
        self.compacting = false;
        self.state = State::Created;
        Ok(())
    }
}
