//! Segmented Journal.
//!
//! `segjournal`は、メッセージブローカー等での利用を想定した、セグメント化された追記専用のレコードジャーナル.
//!
//! # 特徴
//!
//! - 64bitのIDを有するレコード群の追加・更新・削除を、固定長のセグメント群に追記していく
//! - 二相コミットに対応したトランザクションをサポート
//!   - トランザクション内の操作は、コミットされるまで他から見えず、また他からの操作も受け付けない
//!   - プリペア済みのトランザクションは、再起動後も復元される
//! - 全てのレコードが打ち消されたセグメントは自動的に回収され、再利用ないし削除される
//!   - 回収の判定は、各セグメントが保持する二種類のカウンタ(`pos_count`と`neg_counts`)に基づく
//! - 生存レコードの割合が低いセグメント群は、生存レコードを書き直すことで圧縮(コンパクション)される
//! - 再起動時には、全てのセグメントを順序IDの順に読み直して、生存レコード群を復元する
//!   - 末尾の書き込み途中のレコードは、単に無視される
//! - `O_DIRECT`による、OSのページキャッシュを経由しない書き込みに対応
//!
//! # モジュールの依存関係
//!
//! ```text
//! journal => segment => block
//! ```
//!
//! - [journal]モジュール:
//!   - 主に[Journal]構造体を提供
//!   - `segjournal`の利用者が直接触るのはこの構造体
//!   - レコードのフォーマット、セグメントの回収、再起動時の復元処理等を担当する
//! - [segment]モジュール:
//!   - 主に[SegmentStorage]トレイトと[SegmentFactory]トレイト、およびそれらのファイル版とメモリ版の実装を提供
//!   - [journal]に対して永続化層を提供するのが目的
//! - [block]モジュール:
//!   - アライメントを表す[BlockSize]と、アライメントが保証されたバッファである[AlignedBytes]を提供
//!
//! # 使用例
//!
//! ```
//! # extern crate segjournal;
//! use segjournal::JournalBuilder;
//! use segjournal::segment::MemorySegmentFactory;
//!
//! # fn main() -> segjournal::Result<()> {
//! let factory = MemorySegmentFactory::new();
//! let journal = JournalBuilder::new().build(factory.clone())?;
//! journal.start()?;
//! journal.load()?;
//!
//! journal.append_add(1, 0, b"foo", true)?;
//! journal.append_add_tx(10, 2, 0, b"bar")?;
//! journal.append_commit(10, true)?;
//! journal.stop()?;
//!
//! // 同じセグメント群から状態を復元する
//! let journal = JournalBuilder::new().build(factory)?;
//! journal.start()?;
//! let result = journal.load()?;
//! assert_eq!(result.records.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! [journal]: ./journal/index.html
//! [Journal]: ./journal/struct.Journal.html
//! [segment]: ./segment/index.html
//! [SegmentStorage]: ./segment/trait.SegmentStorage.html
//! [SegmentFactory]: ./segment/trait.SegmentFactory.html
//! [block]: ./block/index.html
//! [BlockSize]: ./block/struct.BlockSize.html
//! [AlignedBytes]: ./block/struct.AlignedBytes.html
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
extern crate libc;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;
extern crate uuid;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};
pub use crate::journal::{Journal, JournalBuilder};
pub use crate::record::{LoadResult, PreparedTransactionInfo, RecordInfo};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod block;
pub mod journal;
pub mod metrics;
pub mod record;
pub mod segment;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
