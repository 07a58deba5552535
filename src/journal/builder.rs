use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use uuid::Uuid;

use crate::block::BlockSize;
use crate::journal::header::SegmentHeader;
use crate::journal::pool::PoolOptions;
use crate::journal::{Journal, JournalOptions};
use crate::segment::SegmentFactory;
use crate::{ErrorKind, Result};

/// セグメントサイズの最小値.
pub const MIN_FILE_SIZE: u64 = 1024;

/// `Journal`のビルダ.
#[derive(Debug, Clone)]
pub struct JournalBuilder {
    min_files: usize,
    file_size: u64,
    alignment: Option<BlockSize>,
    prefix: String,
    extension: String,
    sync_on_write: bool,
    auto_reclaim: bool,
    compact_min_files: usize,
    compact_percentage: u8,
    instance_uuid: Option<Uuid>,
    logger: Logger,
    metrics: MetricBuilder,
}
impl JournalBuilder {
    /// デフォルト設定で`JournalBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        JournalBuilder {
            min_files: 2,
            file_size: 10 * 1024 * 1024,
            alignment: None,
            prefix: "journal-".to_owned(),
            extension: "jnl".to_owned(),
            sync_on_write: false,
            auto_reclaim: true,
            compact_min_files: 10,
            compact_percentage: 30,
            instance_uuid: None,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// 維持するセグメントの最小数を設定する.
    ///
    /// ジャーナルは、空きセグメントとデータセグメントの合計がこの値を下回らないようにセグメントを作成し、
    /// 回収したセグメントは、合計がこの値に満たない場合にのみ再利用する(それ以外は削除する).
    ///
    /// `2`以上である必要がある. デフォルト値は`2`.
    pub fn min_files(&mut self, n: usize) -> &mut Self {
        self.min_files = n;
        self
    }

    /// 各セグメントのサイズ(バイト数)を設定する.
    ///
    /// `MIN_FILE_SIZE`以上で、かつアライメントの倍数である必要がある.
    ///
    /// デフォルト値は`10 * 1024 * 1024` (10MiB).
    pub fn file_size(&mut self, size: u64) -> &mut Self {
        self.file_size = size;
        self
    }

    /// レコードおよびヘッダ領域のアライメントを設定する.
    ///
    /// セグメントファクトリが要求するブロックサイズの倍数である必要がある.
    ///
    /// デフォルトでは、セグメントファクトリが要求するブロックサイズがそのまま使われる
    /// (e.g., `O_DIRECT`を使う場合には`512`).
    ///
    /// なお、既存のセグメントのアライメントと異なる値を指定した場合には、ロードに失敗する.
    pub fn alignment(&mut self, alignment: BlockSize) -> &mut Self {
        self.alignment = Some(alignment);
        self
    }

    /// セグメント名の接頭辞を設定する.
    ///
    /// セグメント名は`${prefix}${順序ID}.${extension}`となる.
    ///
    /// デフォルト値は`"journal-"`.
    pub fn prefix(&mut self, prefix: &str) -> &mut Self {
        self.prefix = prefix.to_owned();
        self
    }

    /// セグメント名の拡張子を設定する.
    ///
    /// デフォルト値は`"jnl"`.
    pub fn extension(&mut self, extension: &str) -> &mut Self {
        self.extension = extension.to_owned();
        self
    }

    /// 全ての追記を同期的に行うかどうかを設定する.
    ///
    /// `true`の場合には、追記メソッドの`sync`引数の値に関わらず、
    /// 書き込みの度に同期命令(e.g., `fdatasync`)が発行される.
    ///
    /// デフォルト値は`false`.
    pub fn sync_on_write(&mut self, enabled: bool) -> &mut Self {
        self.sync_on_write = enabled;
        self
    }

    /// 書き込み対象セグメントの切り替え時に、自動で回収処理を行うかどうかを設定する.
    ///
    /// `false`の場合には、利用者が`Journal::check_and_reclaim_files()`を明示的に呼び出す必要がある.
    ///
    /// デフォルト値は`true`.
    pub fn auto_reclaim(&mut self, enabled: bool) -> &mut Self {
        self.auto_reclaim = enabled;
        self
    }

    /// 自動コンパクションが検討されるデータセグメント数の下限を設定する.
    ///
    /// データセグメントの数がこの値を超えている場合に限り、
    /// 書き込み対象セグメントの切り替え時に`compact_percentage`に基づく判定が行われる.
    ///
    /// `0`を指定すると自動コンパクションは無効となる
    /// (`Journal::compact()`による明示的な実行は引き続き可能).
    ///
    /// デフォルト値は`10`.
    pub fn compact_min_files(&mut self, n: usize) -> &mut Self {
        self.compact_min_files = n;
        self
    }

    /// 自動コンパクションの閾値を、データセグメントの総容量に対する生存レコードの割合(百分率)で設定する.
    ///
    /// データセグメント群の生存レコードの合計サイズが、この割合を下回った場合にコンパクションが実行される.
    ///
    /// `100`以下である必要がある. デフォルト値は`30`.
    pub fn compact_percentage(&mut self, percentage: u8) -> &mut Self {
        self.compact_percentage = percentage;
        self
    }

    /// ジャーナルインスタンスを識別するためのUUIDを設定する.
    ///
    /// ロード時の挙動は以下の通り:
    ///
    /// - 既存のセグメントが存在する場合:
    ///   - ここで指定した値と各セグメントのヘッダの値が比較され、もし異なっている場合にはロードに失敗する
    ///   - 本メソッドが呼ばれていない場合は、既存のセグメントの値が採用される
    /// - セグメントが存在しない場合:
    ///   - ここで指定した値が識別子として採用される
    ///   - 本メソッドが呼ばれていない場合は、ランダムなUUIDが割り当てられる
    pub fn instance_uuid(&mut self, uuid: Uuid) -> &mut Self {
        self.instance_uuid = Some(uuid);
        self
    }

    /// ロガーを設定する.
    ///
    /// デフォルト値は`Logger::root(Discard, o!())`.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 指定されたセグメントファクトリを用いる`Journal`を生成する.
    ///
    /// 生成直後のジャーナルは`Created`状態であり、
    /// 利用するためには`Journal::start()`と`Journal::load()`を順に呼び出す必要がある.
    ///
    /// # Errors
    ///
    /// 設定値が不正な場合には`ErrorKind::InvalidInput`エラーが返される.
    pub fn build<F: SegmentFactory>(&self, factory: F) -> Result<Journal<F>> {
        track_assert!(
            self.min_files >= 2,
            ErrorKind::InvalidInput,
            "min_files must be 2 or more: {}",
            self.min_files
        );

        let alignment = self.alignment.unwrap_or_else(|| factory.block_size());
        track_assert!(
            alignment.contains(factory.block_size()),
            ErrorKind::InvalidInput,
            "alignment={}, storage_block_size={}",
            alignment.as_u32(),
            factory.block_size().as_u32()
        );
        track_assert!(
            self.file_size >= MIN_FILE_SIZE,
            ErrorKind::InvalidInput,
            "Too small file size: {}",
            self.file_size
        );
        track_assert!(
            alignment.is_aligned(self.file_size),
            ErrorKind::InvalidInput,
            "file_size={}, alignment={}",
            self.file_size,
            alignment.as_u32()
        );
        track_assert!(
            SegmentHeader::calc_region_size(alignment) < self.file_size,
            ErrorKind::InvalidInput,
            "No space for records: file_size={}, alignment={}",
            self.file_size,
            alignment.as_u32()
        );
        track_assert!(
            self.compact_percentage <= 100,
            ErrorKind::InvalidInput,
            "compact_percentage must be 100 or less: {}",
            self.compact_percentage
        );
        track_assert!(!self.extension.is_empty(), ErrorKind::InvalidInput);
        track_assert!(
            !self.prefix.contains('/') && !self.extension.contains('/'),
            ErrorKind::InvalidInput
        );

        let options = PoolOptions {
            min_files: self.min_files,
            file_size: self.file_size,
            block_size: alignment,
            prefix: self.prefix.clone(),
            extension: self.extension.clone(),
            instance_uuid: self.instance_uuid.unwrap_or_else(Uuid::nil),
        };
        let journal_options = JournalOptions {
            instance_uuid: self.instance_uuid,
            sync_on_write: self.sync_on_write,
            auto_reclaim: self.auto_reclaim,
            compact_min_files: self.compact_min_files,
            compact_percentage: self.compact_percentage,
        };
        Ok(Journal::new(
            factory,
            options,
            journal_options,
            self.logger.clone(),
            &self.metrics,
        ))
    }
}
impl Default for JournalBuilder {
    fn default() -> Self {
        Self::new()
    }
}
