use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else {
            ErrorKind::Other.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::Other.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
///
/// 大きく分けて「ジャーナルの状態遷移違反」「利用者の呼び出し方の誤り」「永続化データの破損」
/// 「I/O等のその他のエラー」の四つに分類される.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// ジャーナルが起動(ないしロード)されていない.
    ///
    /// `Journal::start()`と`Journal::load()`の完了前に、追記等の操作が呼び出された場合に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して、呼び出し順序を正しくする
    NotStarted,

    /// `Journal::start()`が二回以上呼び出された.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正する
    AlreadyStarted,

    /// `Journal::load()`が二回以上呼び出された.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正する
    AlreadyLoaded,

    /// 既に生存しているレコードと同じIDでの追加が行われた.
    DuplicateId,

    /// 更新ないし削除の対象となるレコードが存在しない.
    RecordNotFound,

    /// 対象のレコードが、未終了のトランザクションによって操作中である.
    ///
    /// トランザクションがコミットないしロールバックされるまでは、
    /// そのトランザクション以外からレコードを変更することはできない.
    ///
    /// # 典型的な対応策
    ///
    /// - 該当トランザクションの終了を待ってからリトライする
    RecordIsTransactional,

    /// 指定されたIDのトランザクションが存在しない.
    TransactionNotFound,

    /// トランザクションの状態遷移として不正な操作が行われた.
    ///
    /// E.g., プリペア済みのトランザクションへの操作の追加
    IllegalTransactionState,

    /// レコードのデコードに失敗した.
    ///
    /// チェックサムの不一致や、長さの不整合等、で返される.
    ///
    /// リカバリ時には「そのセグメントの有効なデータの終端」として扱われ、利用者には通常返されない.
    CorruptRecord,

    /// ジャーナルが回復不能な形で破損している.
    ///
    /// 後続のセグメントにデータが存在するにも関わらず先頭レコードが壊れているセグメントがある場合や、
    /// 存在しないトランザクションのコミットレコードが見つかった場合等、に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - もし人手で復旧可能な場合には復旧する
    /// - それが無理であれば、諦めて初期化(全削除)を行う
    JournalCorrupted,

    /// 入力が不正.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,

    /// その他エラー.
    ///
    /// E.g., I/Oエラー
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側で（指数バックオフ等を挟みつつ）何度かリトライ
    ///   - それでもダメなら、致命的な異常が発生していると判断
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
