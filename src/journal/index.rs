//! 生存レコードの所在を管理するためのインデックス.
use std::collections::BTreeMap;

/// レコードの格納位置.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// レコードを保持しているセグメントの順序ID.
    pub segment_id: u64,

    /// セグメント内でのレコードの開始位置.
    pub offset: u64,

    /// アライメント後のレコードのサイズ.
    pub size: u64,
}

/// 生存中のレコードと、その起点(最新の内容を保持するレコードの位置)の対応を保持するインデックス.
///
/// このインデックス自体は永続化されることはないメモリ上のデータ構造であり、
/// ジャーナルのロード時に、セグメント群の内容を用いて毎回再構築される.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordIndex {
    // `BTreeMap`の方が`HashMap`よりもメモリ効率が良いので、こちらを採用
    map: BTreeMap<u64, RecordLocation>,
}
impl RecordIndex {
    /// 指定されたレコードの格納位置を返す.
    pub fn get(&self, record_id: u64) -> Option<RecordLocation> {
        self.map.get(&record_id).cloned()
    }

    /// 指定されたレコードが生存しているかどうかを判定する.
    pub fn contains(&self, record_id: u64) -> bool {
        self.map.contains_key(&record_id)
    }

    /// レコードの格納位置を登録(ないし更新)する.
    ///
    /// 以前の格納位置があれば、それを返す.
    pub fn insert(&mut self, record_id: u64, location: RecordLocation) -> Option<RecordLocation> {
        self.map.insert(record_id, location)
    }

    /// レコードを削除して、その格納位置を返す.
    pub fn remove(&mut self, record_id: u64) -> Option<RecordLocation> {
        self.map.remove(&record_id)
    }

    /// 登録されているレコード群を、IDの昇順で走査する.
    pub fn iter(&self) -> impl Iterator<Item = (u64, RecordLocation)> + '_ {
        self.map.iter().map(|(&id, &location)| (id, location))
    }

    /// インデックスのサイズ(i.e., 生存レコード数)を返す.
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(segment_id: u64, offset: u64) -> RecordLocation {
        RecordLocation {
            segment_id,
            offset,
            size: 32,
        }
    }

    #[test]
    fn it_works() {
        let mut index = RecordIndex::default();
        assert_eq!(index.len(), 0);

        assert_eq!(index.insert(10, location(1, 0)), None);
        assert_eq!(index.insert(5, location(1, 32)), None);
        assert_eq!(index.insert(10, location(2, 0)), Some(location(1, 0)));
        assert_eq!(index.get(10), Some(location(2, 0)));
        assert!(index.contains(5));
        assert_eq!(
            index.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            vec![5, 10]
        );
        assert_eq!(index.len(), 2);

        assert_eq!(index.remove(5), Some(location(1, 32)));
        assert_eq!(index.remove(5), None);
        assert_eq!(index.len(), 1);
    }
}
