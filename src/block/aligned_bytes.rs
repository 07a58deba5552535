use crate::block::BlockSize;

/// 指定のブロック境界に開始位置および終端位置が揃えられたバイト列.
///
/// `O_DIRECT`付きで開かれたセグメントへの読み書きは、
/// メモリ上のバッファのアドレスもブロック境界に揃っている必要があるため、このバッファを経由して行う.
#[derive(Debug)]
pub struct AlignedBytes {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
    block_size: BlockSize,
}
impl AlignedBytes {
    /// 新しい`AlignedBytes`インスタンスを生成する.
    ///
    /// 結果のバイト列はゼロ埋めされている.
    pub fn new(size: usize, block_size: BlockSize) -> Self {
        // バッファの先頭をブロック境界に合わせて十分なだけの領域を確保しておく
        let capacity =
            block_size.ceil_align(size as u64) as usize + block_size.as_u32() as usize - 1;
        let buf = vec![0; capacity];

        let offset = alignment_offset(&buf, block_size);
        AlignedBytes {
            buf,
            offset,
            len: size,
            block_size,
        }
    }

    /// `bytes`と等しい内容を持つ`AlignedBytes`インスタンスを生成する.
    pub fn from_bytes(bytes: &[u8], block_size: BlockSize) -> Self {
        let mut aligned = Self::new(bytes.len(), block_size);
        aligned.as_mut().copy_from_slice(bytes);
        aligned
    }

    /// 長さを次のブロック境界に揃える.
    ///
    /// 伸長された部分はゼロで埋められている.
    pub fn align(&mut self) {
        self.len = self.block_size.ceil_align(self.len as u64) as usize;
    }
}
impl std::ops::Deref for AlignedBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf[self.offset..][..self.len]
    }
}
impl std::ops::DerefMut for AlignedBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..][..self.len]
    }
}
impl AsRef<[u8]> for AlignedBytes {
    fn as_ref(&self) -> &[u8] {
        &*self
    }
}
impl AsMut<[u8]> for AlignedBytes {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut *self
    }
}

fn alignment_offset(buf: &[u8], block_size: BlockSize) -> usize {
    let ptr_usize = buf.as_ptr() as usize;
    let aligned_ptr_usize = block_size.ceil_align(ptr_usize as u64) as usize;
    aligned_ptr_usize - ptr_usize
}
