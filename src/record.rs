//! ロード結果として利用者に返されるデータ型群.

/// 生存しているレコード.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// レコードのID.
    pub id: u64,

    /// 利用者が定義するレコードの種別.
    ///
    /// ジャーナルはこの値を解釈しない.
    pub record_type: u8,

    /// レコードの内容.
    pub payload: Vec<u8>,
}

/// プリペア済みのまま終了していないトランザクション.
///
/// ロード後も`Prepared`状態で復元されており、コミットないしロールバックが可能.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransactionInfo {
    /// トランザクションID.
    pub tx_id: u64,

    /// 二相コミットのトランザクションブランチ識別子.
    pub xid: Vec<u8>,

    /// トランザクション内で追加ないし更新されたレコード群.
    pub records: Vec<RecordInfo>,

    /// トランザクション内で削除されたレコードのID群.
    pub records_to_delete: Vec<u64>,
}

/// `Journal::load()`の結果.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// コミット済みの生存レコード群 (IDの昇順).
    pub records: Vec<RecordInfo>,

    /// 未終了のプリペア済みトランザクション群 (トランザクションIDの昇順).
    pub prepared_transactions: Vec<PreparedTransactionInfo>,
}
