#![feature(test)]
extern crate segjournal;
extern crate tempdir;
extern crate test;
#[macro_use]
extern crate trackable;

use segjournal::segment::{FileSegmentFactoryBuilder, MemorySegmentFactory};
use segjournal::JournalBuilder;
use tempdir::TempDir;
use test::Bencher;

#[bench]
fn file_add_small(b: &mut Bencher) {
    let dir = TempDir::new("segjournal_bench").unwrap();
    let factory = track_try_unwrap!(FileSegmentFactoryBuilder::new()
        .direct_io(false)
        .build(dir.path()));
    let journal = track_try_unwrap!(JournalBuilder::new().build(factory));
    track_try_unwrap!(journal.start());
    track_try_unwrap!(journal.load());
    let mut i = 0;
    b.iter(|| {
        track_try_unwrap!(journal.append_add(i, 0, b"foo", false));
        i += 1;
    });
}

#[bench]
fn file_add_small_sync(b: &mut Bencher) {
    let dir = TempDir::new("segjournal_bench").unwrap();
    let factory = track_try_unwrap!(FileSegmentFactoryBuilder::new()
        .direct_io(false)
        .build(dir.path()));
    let journal = track_try_unwrap!(JournalBuilder::new().build(factory));
    track_try_unwrap!(journal.start());
    track_try_unwrap!(journal.load());
    let mut i = 0;
    b.iter(|| {
        track_try_unwrap!(journal.append_add(i, 0, b"foo", true));
        i += 1;
    });
}

#[bench]
fn memory_add_small(b: &mut Bencher) {
    let journal = track_try_unwrap!(JournalBuilder::new().build(MemorySegmentFactory::new()));
    track_try_unwrap!(journal.start());
    track_try_unwrap!(journal.load());
    let mut i = 0;
    b.iter(|| {
        track_try_unwrap!(journal.append_add(i, 0, b"foo", false));
        i += 1;
    });
}

#[bench]
fn memory_add_and_delete_small(b: &mut Bencher) {
    let journal = track_try_unwrap!(JournalBuilder::new()
        .file_size(1024 * 1024)
        .build(MemorySegmentFactory::new()));
    track_try_unwrap!(journal.start());
    track_try_unwrap!(journal.load());
    let mut i = 0;
    b.iter(|| {
        track_try_unwrap!(journal.append_add(i, 0, b"foo", false));
        track_try_unwrap!(journal.append_delete(i, false));
        i += 1;
    });
}

#[bench]
fn memory_transaction_commit(b: &mut Bencher) {
    let journal = track_try_unwrap!(JournalBuilder::new()
        .file_size(1024 * 1024)
        .build(MemorySegmentFactory::new()));
    track_try_unwrap!(journal.start());
    track_try_unwrap!(journal.load());
    let mut i = 0;
    b.iter(|| {
        track_try_unwrap!(journal.append_add_tx(i, i, 0, b"foo"));
        track_try_unwrap!(journal.append_prepare(i, b"xid", false));
        track_try_unwrap!(journal.append_commit(i, false));
        track_try_unwrap!(journal.append_delete(i, false));
        i += 1;
    });
}
