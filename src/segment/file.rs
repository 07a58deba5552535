use std::cmp;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::block::BlockSize;
use crate::segment::{SegmentFactory, SegmentStorage, SyncHandle};
use crate::{ErrorKind, Result};

/// `FileSegmentFactory`のビルダ.
///
/// 二つのメンバを持ち、それぞれ次の意味を表す:
/// direct_io: バッファリングなしI/Oを行うかどうか（Linux: O_DIRECT, Mac: F_NOCACHE）
/// exclusive_lock: 各セグメントファイルに対するアクセスの排他制御を行うかどうか
#[derive(Debug, Clone)]
pub struct FileSegmentFactoryBuilder {
    direct_io: bool,
    exclusive_lock: bool,
}
impl FileSegmentFactoryBuilder {
    /// デフォルト設定で`FileSegmentFactoryBuilder`インスタンスを作成する.
    ///
    /// デフォルトでは、direct_io = trueかつexclusive_lock = trueとなる.
    pub fn new() -> Self {
        FileSegmentFactoryBuilder {
            direct_io: true,
            exclusive_lock: true,
        }
    }

    /// direct_ioのon/offを設定する.
    ///
    /// 有効にした場合には、ジャーナルのアライメントに`BlockSize::SECTOR`の倍数を指定する必要がある.
    pub fn direct_io(&mut self, enabled: bool) -> &mut Self {
        self.direct_io = enabled;
        self
    }

    /// exclusive_lockのon/offを設定する.
    pub fn exclusive_lock(&mut self, enabled: bool) -> &mut Self {
        self.exclusive_lock = enabled;
        self
    }

    /// `dir`以下にセグメントを格納する`FileSegmentFactory`を生成する.
    ///
    /// ディレクトリが存在しない場合には作成される.
    pub fn build<P: AsRef<Path>>(&self, dir: P) -> Result<FileSegmentFactory> {
        track_io!(fs::create_dir_all(dir.as_ref()))?;
        Ok(FileSegmentFactory {
            dir: dir.as_ref().to_path_buf(),
            direct_io: self.direct_io,
            exclusive_lock: self.exclusive_lock,
        })
    }
}
impl Default for FileSegmentFactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ディレクトリ内のファイル群をセグメントとして扱う`SegmentFactory`の実装.
#[derive(Debug, Clone)]
pub struct FileSegmentFactory {
    dir: PathBuf,
    direct_io: bool,
    exclusive_lock: bool,
}
impl FileSegmentFactory {
    /// デフォルト設定で新しい`FileSegmentFactory`インスタンスを生成する.
    ///
    /// デフォルト設定では、O_DIRECT (MacではF_NOCACHE）でのバッファリングなしI/Oを行い
    /// ファイルアクセスに対する排他制御を行う.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        FileSegmentFactoryBuilder::new().build(dir)
    }

    /// セグメントを格納しているディレクトリを返す.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(target_os = "linux")]
    fn open_options(&self) -> fs::OpenOptions {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true).create(false);

        if self.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        options
    }
    #[cfg(not(target_os = "linux"))]
    fn open_options(&self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true).create(false);
        options
    }

    #[cfg(target_os = "macos")]
    fn set_fnocache_if_flag_is_on(&self, file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        if self.direct_io && unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } != 0 {
            track_io!(Err(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
    #[cfg(not(target_os = "macos"))]
    fn set_fnocache_if_flag_is_on(&self, _file: &File) -> Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn set_exclusive_file_lock_if_flag_is_on(&self, file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if self.exclusive_lock
            && unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0
        {
            track_io!(Err(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
    #[cfg(not(unix))]
    fn set_exclusive_file_lock_if_flag_is_on(&self, _file: &File) -> Result<()> {
        Ok(())
    }

    fn segment(&self, file: File, capacity: u64) -> Result<FileSegment> {
        track!(self.set_exclusive_file_lock_if_flag_is_on(&file))?;
        track!(self.set_fnocache_if_flag_is_on(&file))?;
        Ok(FileSegment {
            file: Arc::new(file),
            cursor_position: 0,
            capacity,
            block_size: self.block_size(),
        })
    }
}
impl SegmentFactory for FileSegmentFactory {
    type Storage = FileSegment;

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in track_io!(fs::read_dir(&self.dir))? {
            let entry = track_io!(entry)?;
            if !track_io!(entry.file_type())?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn create(&self, name: &str, capacity: u64) -> Result<FileSegment> {
        let mut options = self.open_options();
        options.create_new(true);
        let file = track_io!(options.open(self.dir.join(name)))?;
        track_io!(file.set_len(capacity))?;
        track!(self.segment(file, capacity))
    }

    fn open(&self, name: &str) -> Result<FileSegment> {
        let path = self.dir.join(name);
        let capacity = track_io!(fs::metadata(&path))?.len();
        let file = track_io!(self.open_options().open(&path))?;
        track!(self.segment(file, capacity))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        track_io!(fs::rename(self.dir.join(from), self.dir.join(to)))
    }

    fn delete(&self, name: &str) -> Result<()> {
        track_io!(fs::remove_file(self.dir.join(name)))
    }

    fn block_size(&self) -> BlockSize {
        if self.direct_io {
            BlockSize::sector()
        } else {
            BlockSize::min()
        }
    }
}

/// ファイルベースの`SegmentStorage`の実装.
///
/// # 参考
///
/// `O_DIRECT`と`O_SYNC/O_DSYNC`に関して:
///
/// - [http://stackoverflow.com/questions/5055859/](http://stackoverflow.com/questions/5055859/)
/// - [https://lwn.net/Articles/457667/](https://lwn.net/Articles/457667/)
#[derive(Debug)]
pub struct FileSegment {
    file: Arc<File>,
    cursor_position: u64,
    capacity: u64,
    block_size: BlockSize,
}
impl FileSegment {
    fn seek_impl(&mut self, position: u64) -> Result<()> {
        track_assert!(
            self.block_size.is_aligned(position),
            ErrorKind::InvalidInput
        );
        track_io!((&*self.file).seek(SeekFrom::Start(position)))?;
        self.cursor_position = position;
        Ok(())
    }
    fn read_impl(&mut self, buf: &mut [u8]) -> Result<usize> {
        track_assert!(
            self.block_size.is_aligned(buf.len() as u64),
            ErrorKind::InvalidInput
        );

        let max_len = (self.capacity - self.cursor_position) as usize;
        let len = cmp::min(max_len, buf.len());
        let new_cursor_position = self.cursor_position + len as u64;

        let read_size = track_io!((&*self.file).read(&mut buf[..len]))?;
        if read_size < len {
            // 未書き込みの末尾部分はゼロとして扱い、カーソル位置がズレないように明示的にシークを行う.
            for b in &mut buf[read_size..len] {
                *b = 0;
            }
            track!(self.seek_impl(new_cursor_position))?;
        }
        self.cursor_position = new_cursor_position;
        Ok(len)
    }
    fn write_impl(&mut self, buf: &[u8]) -> Result<usize> {
        track_assert!(
            self.block_size.is_aligned(buf.len() as u64),
            ErrorKind::InvalidInput
        );

        let max_len = (self.capacity - self.cursor_position) as usize;
        let len = cmp::min(max_len, buf.len());
        track_io!((&*self.file).write_all(&buf[..len]))?;
        self.cursor_position += len as u64;
        Ok(len)
    }

    #[cfg(test)]
    fn inner(&self) -> &File {
        &self.file
    }
}
impl SegmentStorage for FileSegment {
    fn sync(&mut self) -> Result<()> {
        track_io!(self.file.sync_data())?;
        Ok(())
    }
    fn sync_handle(&self) -> Arc<dyn SyncHandle> {
        self.file.clone()
    }
    fn position(&self) -> u64 {
        self.cursor_position
    }
    fn capacity(&self) -> u64 {
        self.capacity
    }
    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}
impl SyncHandle for File {
    fn sync(&self) -> Result<()> {
        track_io!(self.sync_data())
    }
}
impl Seek for FileSegment {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.convert_to_offset(pos)?;
        track!(self.seek_impl(position))?;
        Ok(position)
    }
}
impl Read for FileSegment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read_size = track!(self.read_impl(buf))?;
        Ok(read_size)
    }
}
impl Write for FileSegment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written_size = track!(self.write_impl(buf))?;
        Ok(written_size)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::block::AlignedBytes;

    fn factory(dir: &TempDir) -> Result<FileSegmentFactory> {
        track!(FileSegmentFactoryBuilder::new()
            .direct_io(false)
            .build(dir.path().join("segments")))
    }

    #[test]
    fn create_and_open_works() -> TestResult {
        let dir = track_io!(TempDir::new("segjournal_test"))?;
        let factory = track!(factory(&dir))?;

        // 存在しないファイルは開けない
        assert!(factory.open("foo").is_err());

        let mut segment = track!(factory.create("foo", 4096))?;
        assert_eq!(segment.capacity(), 4096);
        let bytes = AlignedBytes::from_bytes(b"bar", factory.block_size());
        track!(segment.write_aligned_at(1024, &bytes))?;
        track!(segment.sync())?;

        // 同名のセグメントは作れない
        assert!(factory.create("foo", 4096).is_err());

        // 同じファイルを同時に開くことはできない
        assert!(factory.open("foo").is_err());

        // 一度閉じれば、オープン可能
        mem::drop(segment);
        let mut segment = track!(factory.open("foo"))?;
        assert_eq!(segment.capacity(), 4096);
        let buf = track!(segment.read_aligned_at(1024, 3))?;
        assert_eq!(&buf[..], b"bar");

        // 未書き込み部分はゼロ
        let buf = track!(segment.read_aligned_at(0, 16))?;
        assert_eq!(&buf[..], &[0; 16][..]);
        Ok(())
    }

    #[test]
    fn list_rename_and_delete_works() -> TestResult {
        let dir = track_io!(TempDir::new("segjournal_test"))?;
        let factory = track!(factory(&dir))?;

        mem::drop(track!(factory.create("b.jnl", 1024))?);
        mem::drop(track!(factory.create("a.jnl", 1024))?);
        assert_eq!(track!(factory.list())?, vec!["a.jnl", "b.jnl"]);

        track!(factory.rename("a.jnl", "c.jnl"))?;
        assert_eq!(track!(factory.list())?, vec!["b.jnl", "c.jnl"]);

        track!(factory.delete("b.jnl"))?;
        assert_eq!(track!(factory.list())?, vec!["c.jnl"]);
        Ok(())
    }

    #[test]
    fn capacity_and_alignment_are_enforced() -> TestResult {
        let dir = track_io!(TempDir::new("segjournal_test"))?;
        let factory = track!(factory(&dir))?;

        let mut segment = track!(factory.create("foo", 1024))?;
        assert!(segment.seek(SeekFrom::Start(2048)).is_err());

        // 容量を超えた分は書き込まれない
        let bytes = AlignedBytes::from_bytes(&[1; 2048][..], BlockSize::min());
        assert!(segment.write_aligned_at(0, &bytes).is_err());

        let mut sector = track!(FileSegmentFactoryBuilder::new()
            .direct_io(false)
            .build(dir.path().join("segments")))?;
        sector.direct_io = true;
        assert_eq!(sector.block_size(), BlockSize::sector());
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn disabling_direct_io_works() -> TestResult {
        use std::os::unix::io::AsRawFd;
        let dir = track_io!(TempDir::new("segjournal_test"))?;
        let factory = track!(factory(&dir))?;
        let segment = track!(factory.create("foo", 1024))?;

        let file = segment.inner();
        let status = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL, 0) };
        assert_eq!(status & libc::O_DIRECT, 0);
        Ok(())
    }

    #[test]
    fn disabling_exclusive_lock_works() -> TestResult {
        let dir = track_io!(TempDir::new("segjournal_test"))?;
        let factory = track!(FileSegmentFactoryBuilder::new()
            .direct_io(false)
            .exclusive_lock(false)
            .build(dir.path()))?;

        let _first = track!(factory.create("foo", 1024))?;
        let _second = track!(factory.open("foo"))?;
        Ok(())
    }
}
