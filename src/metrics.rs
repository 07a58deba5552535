//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

use crate::journal::JournalRecord;

/// ジャーナルのメトリクス.
#[derive(Debug, Clone)]
pub struct JournalMetrics {
    pub(crate) appended_records: JournalRecordCounter,
    pub(crate) appended_bytes: Counter,
    pub(crate) syncs: Counter,
    pub(crate) rotations: Counter,
    pub(crate) created_segments: Counter,
    pub(crate) recycled_segments: Counter,
    pub(crate) deleted_segments: Counter,
    pub(crate) reclaimed_segments: Counter,
    pub(crate) compactions: Counter,
    pub(crate) compacted_records: Counter,
    pub(crate) live_records: Gauge,
    pub(crate) data_segments: Gauge,
    pub(crate) free_segments: Gauge,
}
impl JournalMetrics {
    /// 追記されたレコードの数.
    ///
    /// リカバリ時に読み込まれたレコードは含まれない.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_appended_records_total { type="add|update|delete|add_tx|update_tx|delete_tx|prepare|commit|rollback" } <COUNTER>
    /// ```
    pub fn appended_records(&self) -> &JournalRecordCounter {
        &self.appended_records
    }

    /// 追記されたバイト数の合計(パディングを含む).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_appended_bytes_total <COUNTER>
    /// ```
    pub fn appended_bytes(&self) -> u64 {
        self.appended_bytes.value() as u64
    }

    /// 発行された同期命令の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_syncs_total <COUNTER>
    /// ```
    pub fn syncs(&self) -> u64 {
        self.syncs.value() as u64
    }

    /// 書き込み対象セグメントの切り替え回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_rotations_total <COUNTER>
    /// ```
    pub fn rotations(&self) -> u64 {
        self.rotations.value() as u64
    }

    /// 新規に作成されたセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_created_segments_total <COUNTER>
    /// ```
    pub fn created_segments(&self) -> u64 {
        self.created_segments.value() as u64
    }

    /// 回収後に再利用されたセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_recycled_segments_total <COUNTER>
    /// ```
    pub fn recycled_segments(&self) -> u64 {
        self.recycled_segments.value() as u64
    }

    /// 物理的に削除されたセグメントの数.
    ///
    /// ロード時に見つかった作成途中のセグメントの削除も含まれる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_deleted_segments_total <COUNTER>
    /// ```
    pub fn deleted_segments(&self) -> u64 {
        self.deleted_segments.value() as u64
    }

    /// リクレイマによって回収されたセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_reclaimed_segments_total <COUNTER>
    /// ```
    pub fn reclaimed_segments(&self) -> u64 {
        self.reclaimed_segments.value() as u64
    }

    /// 実行されたコンパクションの回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_compactions_total <COUNTER>
    /// ```
    pub fn compactions(&self) -> u64 {
        self.compactions.value() as u64
    }

    /// コンパクションによって書き直されたレコードの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_compacted_records_total <COUNTER>
    /// ```
    pub fn compacted_records(&self) -> u64 {
        self.compacted_records.value() as u64
    }

    /// 生存中のレコードの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_live_records <GAUGE>
    /// ```
    pub fn live_records(&self) -> u64 {
        self.live_records.value() as u64
    }

    /// データセグメント(書き込みが終了したセグメント)の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_data_segments <GAUGE>
    /// ```
    pub fn data_segments(&self) -> u64 {
        self.data_segments.value() as u64
    }

    /// 待機中の空きセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// segjournal_journal_free_segments <GAUGE>
    /// ```
    pub fn free_segments(&self) -> u64 {
        self.free_segments.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("segjournal").subsystem("journal");
        JournalMetrics {
            appended_records: JournalRecordCounter::new(
                &builder,
                "appended_records_total",
                "Number of records appended to the journal",
            ),
            appended_bytes: builder
                .counter("appended_bytes_total")
                .help("Number of bytes appended to the journal (including padding)")
                .finish()
                .expect("Never fails"),
            syncs: builder
                .counter("syncs_total")
                .help("Number of synchronizations issued to the segments")
                .finish()
                .expect("Never fails"),
            rotations: builder
                .counter("rotations_total")
                .help("Number of times the current segment was switched")
                .finish()
                .expect("Never fails"),
            created_segments: builder
                .counter("created_segments_total")
                .help("Number of newly created segments")
                .finish()
                .expect("Never fails"),
            recycled_segments: builder
                .counter("recycled_segments_total")
                .help("Number of segments returned to the free pool")
                .finish()
                .expect("Never fails"),
            deleted_segments: builder
                .counter("deleted_segments_total")
                .help("Number of physically deleted segments")
                .finish()
                .expect("Never fails"),
            reclaimed_segments: builder
                .counter("reclaimed_segments_total")
                .help("Number of segments reclaimed by the reclaimer")
                .finish()
                .expect("Never fails"),
            compactions: builder
                .counter("compactions_total")
                .help("Number of compactions")
                .finish()
                .expect("Never fails"),
            compacted_records: builder
                .counter("compacted_records_total")
                .help("Number of live records rewritten by compactions")
                .finish()
                .expect("Never fails"),
            live_records: builder
                .gauge("live_records")
                .help("Number of live records")
                .finish()
                .expect("Never fails"),
            data_segments: builder
                .gauge("data_segments")
                .help("Number of closed data segments")
                .finish()
                .expect("Never fails"),
            free_segments: builder
                .gauge("free_segments")
                .help("Number of standby free segments")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// 種類毎のレコード数を保持するカウンタ.
#[derive(Debug, Clone)]
pub struct JournalRecordCounter {
    pub(crate) add: Counter,
    pub(crate) update: Counter,
    pub(crate) delete: Counter,
    pub(crate) add_tx: Counter,
    pub(crate) update_tx: Counter,
    pub(crate) delete_tx: Counter,
    pub(crate) prepare: Counter,
    pub(crate) commit: Counter,
    pub(crate) rollback: Counter,
}
impl JournalRecordCounter {
    /// ADDレコードの数.
    pub fn add(&self) -> u64 {
        self.add.value() as u64
    }

    /// UPDATEレコードの数.
    pub fn update(&self) -> u64 {
        self.update.value() as u64
    }

    /// DELETEレコードの数.
    pub fn delete(&self) -> u64 {
        self.delete.value() as u64
    }

    /// トランザクション内のADDレコードの数.
    pub fn add_tx(&self) -> u64 {
        self.add_tx.value() as u64
    }

    /// トランザクション内のUPDATEレコードの数.
    pub fn update_tx(&self) -> u64 {
        self.update_tx.value() as u64
    }

    /// トランザクション内のDELETEレコードの数.
    pub fn delete_tx(&self) -> u64 {
        self.delete_tx.value() as u64
    }

    /// PREPAREレコードの数.
    pub fn prepare(&self) -> u64 {
        self.prepare.value() as u64
    }

    /// COMMITレコードの数.
    pub fn commit(&self) -> u64 {
        self.commit.value() as u64
    }

    /// ROLLBACKレコードの数.
    pub fn rollback(&self) -> u64 {
        self.rollback.value() as u64
    }

    /// 全種類の合計.
    pub fn sum(&self) -> u64 {
        self.add()
            + self.update()
            + self.delete()
            + self.add_tx()
            + self.update_tx()
            + self.delete_tx()
            + self.prepare()
            + self.commit()
            + self.rollback()
    }

    pub(crate) fn increment<T>(&self, record: &JournalRecord<T>) {
        match *record {
            JournalRecord::Add { .. } => self.add.increment(),
            JournalRecord::Update { .. } => self.update.increment(),
            JournalRecord::Delete { .. } => self.delete.increment(),
            JournalRecord::AddTx { .. } => self.add_tx.increment(),
            JournalRecord::UpdateTx { .. } => self.update_tx.increment(),
            JournalRecord::DeleteTx { .. } => self.delete_tx.increment(),
            JournalRecord::Prepare { .. } => self.prepare.increment(),
            JournalRecord::Commit { .. } => self.commit.increment(),
            JournalRecord::Rollback { .. } => self.rollback.increment(),
        }
    }

    fn new(builder: &MetricBuilder, name: &str, help: &str) -> Self {
        let counter = |record_type| {
            builder
                .counter(name)
                .help(help)
                .label("type", record_type)
                .finish()
                .expect("Never fails")
        };
        JournalRecordCounter {
            add: counter("add"),
            update: counter("update"),
            delete: counter("delete"),
            add_tx: counter("add_tx"),
            update_tx: counter("update_tx"),
            delete_tx: counter("delete_tx"),
            prepare: counter("prepare"),
            commit: counter("commit"),
            rollback: counter("rollback"),
        }
    }
}
