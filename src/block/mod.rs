//! セグメントのブロック(読み書きの際のアライメント単位)関連の構成要素.
use crate::{ErrorKind, Result};

pub(crate) use self::aligned_bytes::AlignedBytes;

mod aligned_bytes;

/// セグメントのアライメント単位を表現するための構造体.
///
/// ジャーナルに追記される全てのレコードは、このサイズの倍数に切り上げられた上で書き込まれる.
/// バッファリングなしI/O(e.g., `O_DIRECT`)を使う場合には、
/// 物理デバイスのセクタサイズ(通常は`512`)の倍数を指定する必要がある.
///
/// 指定されたサイズのブロック境界にアライメントを行うための補助メソッド群も提供している.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockSize(u32);
impl BlockSize {
    /// 許容されるブロックサイズの最小値.
    ///
    /// また`BlockSize::default()`で使われる値でもある.
    pub const MIN: u32 = 1;

    /// 許容されるブロックサイズの最大値.
    pub const MAX: u32 = 1 << 20;

    /// バッファリングなしI/Oで要求される典型的なブロックサイズ.
    pub const SECTOR: u32 = 512;

    /// 許容可能な最小のブロックサイズを持つ`BlockSize`インスタンスを返す.
    ///
    /// # Examples
    ///
    /// ```
    /// use segjournal::block::BlockSize;
    ///
    /// assert_eq!(BlockSize::min().as_u32(), BlockSize::MIN);
    /// ```
    pub fn min() -> Self {
        BlockSize(Self::MIN)
    }

    /// `BlockSize::SECTOR`のブロックサイズを持つインスタンスを返す.
    pub fn sector() -> Self {
        BlockSize(Self::SECTOR)
    }

    /// 指定された値のブロックサイズを表現する`BlockSize`インスタンスを生成する.
    ///
    /// # Errors
    ///
    /// 以下の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される:
    ///
    /// - `block_size`が二の冪ではない
    /// - `block_size`が`BlockSize::MAX`を超えている
    ///
    /// # Examples
    ///
    /// ```
    /// use segjournal::ErrorKind;
    /// use segjournal::block::BlockSize;
    ///
    /// assert_eq!(BlockSize::new(1).ok().map(|a| a.as_u32()), Some(1));
    /// assert_eq!(BlockSize::new(512).ok().map(|a| a.as_u32()), Some(512));
    /// assert_eq!(BlockSize::new(4096).ok().map(|a| a.as_u32()), Some(4096));
    ///
    /// assert_eq!(BlockSize::new(0).err().map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
    /// assert_eq!(BlockSize::new(513).err().map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(block_size: u32) -> Result<Self> {
        track_assert!(
            block_size.is_power_of_two(),
            ErrorKind::InvalidInput,
            "block_size:{}",
            block_size
        );
        track_assert!(block_size <= Self::MAX, ErrorKind::InvalidInput);
        Ok(BlockSize(block_size))
    }

    /// 指定位置より後方の最初のブロックサイズ位置を返す.
    ///
    /// # Examples
    ///
    /// ```
    /// use segjournal::block::BlockSize;
    ///
    /// let block_size = BlockSize::new(512).unwrap();
    /// assert_eq!(block_size.ceil_align(0), 0);
    /// assert_eq!(block_size.ceil_align(1), 512);
    /// assert_eq!(block_size.ceil_align(512), 512);
    /// ```
    pub fn ceil_align(self, position: u64) -> u64 {
        let block_size = u64::from(self.0);
        (position + block_size - 1) / block_size * block_size
    }

    /// 指定位置より前方の最初のブロックサイズ位置を返す.
    ///
    /// # Examples
    ///
    /// ```
    /// use segjournal::block::BlockSize;
    ///
    /// let block_size = BlockSize::new(512).unwrap();
    /// assert_eq!(block_size.floor_align(0), 0);
    /// assert_eq!(block_size.floor_align(1), 0);
    /// assert_eq!(block_size.floor_align(512), 512);
    /// ```
    pub fn floor_align(self, position: u64) -> u64 {
        let block_size = u64::from(self.0);
        (position / block_size) * block_size
    }

    /// ブロックサイズ値を`u32`に変換して返す.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// このブロックサイズが`other`を包含しているかを確認する.
    ///
    /// "包含している"とは「`self`のブロックサイズが`other`のブロックサイズの倍数」であることを意味する.
    ///
    /// # Examples
    ///
    /// ```
    /// use segjournal::block::BlockSize;
    ///
    /// let block_size = BlockSize::new(2048).unwrap();
    /// assert!(block_size.contains(BlockSize::new(512).unwrap()));
    /// assert!(block_size.contains(BlockSize::min()));
    /// assert!(!block_size.contains(BlockSize::new(4096).unwrap()));
    /// ```
    pub fn contains(self, other: BlockSize) -> bool {
        self.0 >= other.0 && self.0 % other.0 == 0
    }

    /// 指定位置がブロックサイズ境界に沿っているかどうかを判定する.
    ///
    /// # Examples
    ///
    /// ```
    /// use segjournal::block::BlockSize;
    ///
    /// let block_size = BlockSize::new(512).unwrap();
    /// assert!(block_size.is_aligned(0));
    /// assert!(block_size.is_aligned(512));
    /// assert!(block_size.is_aligned(1024));
    ///
    /// assert!(!block_size.is_aligned(511));
    /// assert!(!block_size.is_aligned(513));
    /// ```
    pub fn is_aligned(self, position: u64) -> bool {
        (position % u64::from(self.0)) == 0
    }
}
impl Default for BlockSize {
    fn default() -> Self {
        Self::min()
    }
}
