mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mcache::{
    AcquireOptions, Access, BlockId, Cache, Config, Error, Interruptor,
    MemorySerializer, OrderToken, PageReplacementPolicy, Recency, Serializer,
    SnapshotVersion,
};

use common::{
    BLOCK_SIZE, fresh_serializer, open, overwrite, read_block, setup_logger,
    test_config, write_new_block,
};

/// Wants every block gone except the one just accessed.
#[derive(Default)]
struct EvictEverything {
    seen: BTreeSet<BlockId>,
}

impl PageReplacementPolicy for EvictEverything {
    fn accessed(&mut self, block_id: BlockId, _size: usize) -> Vec<BlockId> {
        self.seen.insert(block_id);
        self.seen.iter().copied().filter(|id| *id != block_id).collect()
    }

    fn forget(&mut self, block_id: BlockId) {
        self.seen.remove(&block_id);
    }
}

fn open_evicting(serializer: &Arc<MemorySerializer>) -> Cache {
    Cache::open_with_policy(
        serializer.clone(),
        test_config(),
        Box::new(EvictEverything::default()),
    )
    .unwrap()
}

fn begin_read(cache: &Cache) -> mcache::Transaction {
    cache
        .begin_transaction(Access::Read, 0, Recency::INVALID, OrderToken::ignore())
        .unwrap()
}

fn begin_write(cache: &Cache, recency: Recency) -> mcache::Transaction {
    cache
        .begin_transaction(Access::Write, 1, recency, OrderToken::ignore())
        .unwrap()
}

#[test]
fn allocate_write_and_reread() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());

    let block_id = write_new_block(&cache, &[7; 10]);
    assert_ne!(block_id, mcache::SUPERBLOCK_ID);
    assert!(cache.contains_block(block_id));

    let data = read_block(&cache, block_id);
    assert_eq!(data.len(), BLOCK_SIZE);
    assert_eq!(&data[..10], &[7; 10]);
    assert!(data[10..].iter().all(|b| *b == 0));
}

#[test]
fn create_refuses_an_initialized_serializer() {
    setup_logger();
    let serializer = fresh_serializer();
    assert!(matches!(Cache::create(&*serializer), Err(Error::Unsupported(_))));

    let uninitialized = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    assert!(matches!(
        test_config().open(uninitialized),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn patches_survive_reopen() {
    setup_logger();
    let serializer = fresh_serializer();

    let block_id = {
        let cache = open(&serializer, test_config());
        let block_id = write_new_block(&cache, &[1; 10]);
        cache.flush().unwrap();

        overwrite(&cache, block_id, &[2; 4]);
        assert_eq!(cache.stats().dirty_blocks, 1);
        block_id
    };

    // the small overwrite went through the patch log only
    assert!(serializer.read_patch_log().unwrap().is_some());

    let cache = open(&serializer, test_config());
    let data = read_block(&cache, block_id);
    assert_eq!(&data[..10], &[2, 2, 2, 2, 1, 1, 1, 1, 1, 1]);
    assert!(data[10..].iter().all(|b| *b == 0));
}

#[test]
fn large_patches_fall_back_to_full_writes() {
    setup_logger();
    let serializer = fresh_serializer();
    let config = Config { max_patch_bytes_per_block: 16, ..test_config() };

    let block_id = {
        let cache = open(&serializer, config.clone());
        let block_id = write_new_block(&cache, &[1]);
        cache.flush().unwrap();

        let txn = begin_write(&cache, Recency(2));
        let mut buf = txn.acquire(block_id, Access::Write).unwrap();
        for offset in 0..8 {
            buf.set_data(offset * 4, &[offset as u8 + 10; 4]);
        }
        buf.move_data(32, 0, 8);
        buf.release();
        txn.commit().unwrap();
        cache.flush().unwrap();
        block_id
    };

    let cache = open(&serializer, config);
    let data = read_block(&cache, block_id);
    for offset in 0..8 {
        assert_eq!(&data[offset * 4..offset * 4 + 4], &[offset as u8 + 10; 4]);
    }
    assert_eq!(&data[32..40], &data[0..8]);
}

#[test]
fn snapshot_readers_see_a_fixed_version() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());

    let a = write_new_block(&cache, &[1]);
    let b = write_new_block(&cache, &[1]);

    let mut reader = begin_read(&cache);
    reader.snapshot();
    assert_eq!(reader.snapshot_version(), None);
    {
        let buf = reader.acquire(a, Access::Read).unwrap();
        assert_eq!(buf.get_data_read()[0], 1);
    }
    let pinned = reader.snapshot_version().unwrap();
    assert_eq!(cache.get_min_snapshot_version(SnapshotVersion(u64::MAX)), pinned);
    assert_eq!(cache.get_max_snapshot_version(SnapshotVersion::FAUX), pinned);

    let writer = begin_write(&cache, Recency(5));
    for block_id in [a, b] {
        let mut buf = writer.acquire(block_id, Access::Write).unwrap();
        buf.set_data(0, &[2]);
    }
    writer.commit().unwrap();
    assert!(cache.get_current_version_id() > pinned);

    // writeback must not disturb what the reader can still see
    cache.flush().unwrap();

    for block_id in [b, a] {
        let buf = reader.acquire(block_id, Access::Read).unwrap();
        assert_eq!(buf.get_data_read()[0], 1, "block {} changed under a snapshot", block_id);
    }
    assert!(cache.stats().snapshots_created >= 2);

    // an unpinned reader sees the new data
    assert_eq!(read_block(&cache, a)[0], 2);
    assert_eq!(read_block(&cache, b)[0], 2);

    reader.commit().unwrap();
    let default = SnapshotVersion(42);
    assert_eq!(cache.get_min_snapshot_version(default), default);
}

#[test]
fn shed_snapshots_are_reread_from_their_image() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open_evicting(&serializer);

    let a = write_new_block(&cache, &[1]);
    let b = write_new_block(&cache, &[1]);
    cache.flush().unwrap();

    let mut reader = begin_read(&cache);
    reader.snapshot();
    assert_eq!(reader.acquire(a, Access::Read).unwrap().get_data_read()[0], 1);

    overwrite(&cache, a, &[9]);

    // accessing b asks for a to be evicted; a is dirty, so only the
    // memory of its snapshot goes
    assert_eq!(read_block(&cache, b)[0], 1);

    let buf = reader.acquire(a, Access::Read).unwrap();
    assert_eq!(buf.get_data_read()[0], 1);
    drop(buf);
    reader.commit().unwrap();

    assert_eq!(read_block(&cache, a)[0], 9);
}

#[test]
fn deleted_blocks_are_reclaimed() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());

    let a = write_new_block(&cache, &[1]);
    cache.flush().unwrap();
    assert!(!serializer.get_delete_bit(a));

    let txn = begin_write(&cache, Recency(3));
    let mut buf = txn.acquire(a, Access::Write).unwrap();
    buf.mark_deleted();
    buf.release();
    txn.commit().unwrap();
    assert!(!cache.contains_block(a));

    cache.flush().unwrap();
    assert!(serializer.get_delete_bit(a));

    let b = write_new_block(&cache, &[2]);
    if !cfg!(feature = "monotonic-behavior") {
        assert_eq!(b, a);
    }
    assert_eq!(read_block(&cache, b)[0], 2);
    assert!(cache.contains_block(b));
}

#[test]
fn snapshots_keep_deleted_blocks_readable() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());

    let a = write_new_block(&cache, &[1]);

    let mut reader = begin_read(&cache);
    reader.snapshot();
    drop(reader.acquire(a, Access::Read).unwrap());

    let txn = begin_write(&cache, Recency(3));
    let mut buf = txn.acquire(a, Access::Write).unwrap();
    buf.mark_deleted();
    drop(buf);
    txn.commit().unwrap();
    assert!(!cache.contains_block(a));

    {
        let buf = reader.acquire(a, Access::Read).unwrap();
        assert_eq!(buf.get_data_read()[0], 1);
    }
    reader.commit().unwrap();

    // once the reader is gone the id is free again
    let b = write_new_block(&cache, &[5]);
    if !cfg!(feature = "monotonic-behavior") {
        assert_eq!(b, a);
    }
    assert_eq!(read_block(&cache, b)[0], 5);
}

#[test]
fn outdated_reads_do_not_wait_for_writers() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let a = write_new_block(&cache, &[1]);

    let writer = begin_write(&cache, Recency(2));
    let mut buf = writer.acquire(a, Access::Write).unwrap();
    buf.set_data(0, &[5]);

    thread::scope(|s| {
        let cache = &cache;
        let seen = s
            .spawn(move || {
                let txn = begin_read(cache);
                let buf = txn.acquire(a, Access::ReadOutdatedOk).unwrap();
                let seen = buf.get_data_read()[0];
                drop(buf);
                seen
            })
            .join()
            .unwrap();
        assert_eq!(seen, 1);
    });

    buf.release();
    writer.commit().unwrap();
    assert_eq!(read_block(&cache, a)[0], 5);
}

#[test]
fn load_failures_reach_every_waiter() {
    setup_logger();
    let serializer = fresh_serializer();
    let a = {
        let cache = open(&serializer, test_config());
        write_new_block(&cache, &[3])
    };

    let cache = open(&serializer, test_config());
    serializer.fail_reads_of(a);

    thread::scope(|s| {
        let cache = &cache;
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || {
                    let txn = begin_read(cache);
                    let result = txn.acquire(a, Access::Read).map(|buf| buf.get_data_read()[0]);
                    result
                })
            })
            .collect();

        for reader in readers {
            let result = reader.join().unwrap();
            assert!(matches!(result, Err(Error::Io(_))), "got {:?}", result);
        }
    });

    serializer.clear_read_failures();
    assert_eq!(read_block(&cache, a)[0], 3);
}

#[test]
fn interrupted_lock_waits_leave_nothing_behind() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let a = write_new_block(&cache, &[1]);

    let writer = begin_write(&cache, Recency(2));
    let buf = writer.acquire(a, Access::Write).unwrap();

    let interruptor = Interruptor::new();
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        let cache = &cache;
        let interruptor = &interruptor;
        let waiter = s.spawn(move || {
            let txn = begin_read(cache);
            let mut in_line = || tx.send(()).unwrap();
            let options = AcquireOptions {
                call_when_in_line: Some(&mut in_line),
                interruptor: Some(interruptor),
                ..AcquireOptions::default()
            };
            let result = txn.acquire_with(a, Access::Read, options).map(|_| ());
            result
        });

        rx.recv().unwrap();
        interruptor.pulse();
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));
    });

    drop(buf);
    writer.commit().unwrap();

    // neither the lock nor a reference leaked, so the block can be
    // rewritten and evicted
    overwrite(&cache, a, &[4]);
    assert_eq!(read_block(&cache, a)[0], 4);
    cache.flush().unwrap();
    assert_eq!(cache.stats().dirty_blocks, 0);
}

#[test]
fn skipping_the_load_reads_nothing() {
    setup_logger();
    let serializer = fresh_serializer();
    let a = {
        let cache = open(&serializer, test_config());
        write_new_block(&cache, &[1; 8])
    };

    let cache = open(&serializer, test_config());
    let reads_before = serializer.io_count(100);

    let txn = begin_write(&cache, Recency(4));
    let mut buf = txn
        .acquire_with(
            a,
            Access::Write,
            AcquireOptions { should_load: false, ..AcquireOptions::default() },
        )
        .unwrap();
    buf.get_data_major_write().fill(8);
    buf.release();
    txn.commit().unwrap();

    assert_eq!(serializer.io_count(100), reads_before);
    assert_eq!(read_block(&cache, a), vec![8; BLOCK_SIZE]);

    drop(cache);
    let cache = open(&serializer, test_config());
    assert_eq!(read_block(&cache, a), vec![8; BLOCK_SIZE]);
}

#[test]
fn skipped_loads_never_show_their_placeholder() {
    setup_logger();
    let serializer = fresh_serializer();
    let (a, b) = {
        let cache = open(&serializer, test_config());
        (write_new_block(&cache, b"abc"), write_new_block(&cache, b"b"))
    };

    let cache = open(&serializer, test_config());

    let mut reader = begin_read(&cache);
    reader.snapshot();
    drop(reader.acquire(b, Access::Read).unwrap());

    let writer = begin_write(&cache, Recency(2));
    let mut buf = writer
        .acquire_with(
            a,
            Access::Write,
            AcquireOptions { should_load: false, ..AcquireOptions::default() },
        )
        .unwrap();

    let seen = reader.acquire(a, Access::Read).unwrap().get_data_read()[..3].to_vec();
    assert_eq!(seen, b"abc");

    thread::scope(|s| {
        let cache = &cache;
        let outdated = s.spawn(move || {
            let txn = begin_read(cache);
            let buf = txn.acquire(a, Access::ReadOutdatedOk).unwrap();
            buf.get_data_read()[..3].to_vec()
        });

        buf.get_data_major_write()[..3].copy_from_slice(b"xyz");
        buf.release();
        assert_eq!(outdated.join().unwrap(), b"xyz");
    });
    writer.commit().unwrap();

    let seen = reader.acquire(a, Access::Read).unwrap().get_data_read()[..3].to_vec();
    assert_eq!(seen, b"abc");
    drop(reader);

    assert_eq!(&read_block(&cache, a)[..3], b"xyz");
}

#[test]
fn eviction_never_loses_dirty_data() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open_evicting(&serializer);

    let ids: Vec<BlockId> = (0..8u8).map(|i| write_new_block(&cache, &[i + 1])).collect();

    // every access asks for the others to go, but none of them is clean
    for (i, block_id) in ids.iter().enumerate() {
        assert_eq!(read_block(&cache, *block_id)[0], i as u8 + 1);
    }
    assert_eq!(cache.stats().evictions, 0);
    assert!(cache.stats().resident_blocks >= ids.len());

    cache.flush().unwrap();
    assert!(cache.stats().evictions > 0);

    for (i, block_id) in ids.iter().enumerate() {
        assert_eq!(read_block(&cache, *block_id)[0], i as u8 + 1);
    }
    assert!(cache.stats().resident_blocks < ids.len());
}

#[test]
fn read_ahead_fills_the_cache() {
    setup_logger();
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE).with_read_ahead_window(3));
    Cache::create(&*serializer).unwrap();

    let ids: Vec<BlockId> = {
        let cache = open(&serializer, test_config());
        (0..5u8).map(|i| write_new_block(&cache, &[i + 1])).collect()
    };

    let cache = open(&serializer, test_config());
    assert_eq!(read_block(&cache, ids[0])[0], 1);
    assert_eq!(cache.stats().read_ahead_accepted, 3);
    assert_eq!(cache.stats().resident_blocks, 4);

    let reads_before = serializer.io_count(100);
    for (i, block_id) in ids.iter().enumerate().take(4) {
        assert_eq!(read_block(&cache, *block_id)[0], i as u8 + 1);
    }
    assert_eq!(serializer.io_count(100), reads_before);

    // resident blocks are never replaced by offers
    let token = serializer.index_read(ids[1]).unwrap().token.unwrap();
    assert!(!cache.offer_read_ahead_buf(ids[1], vec![0; BLOCK_SIZE], token, Recency(0)));
}

#[test]
fn prefetch_on_open_loads_everything() {
    setup_logger();
    let serializer = fresh_serializer();
    let ids: Vec<BlockId> = {
        let cache = open(&serializer, test_config());
        (0..6u8).map(|i| write_new_block(&cache, &[i])).collect()
    };

    let cache = open(&serializer, Config { prefetch_on_open: true, ..test_config() });
    // the superblock is prefetched too
    assert_eq!(cache.stats().resident_blocks, ids.len() + 1);
    assert!(serializer.io_count(10) > 0);
}

#[test]
fn recencies_are_recorded_and_persisted() {
    setup_logger();
    let serializer = fresh_serializer();

    let (a, b) = {
        let cache = open(&serializer, test_config());
        let a = write_new_block(&cache, &[1]);
        let b = write_new_block(&cache, &[1]);

        let txn = begin_write(&cache, Recency(7));
        let mut buf = txn.acquire(a, Access::Write).unwrap();
        buf.set_data(1, &[1]);
        drop(buf);
        let mut buf = txn.acquire(b, Access::Write).unwrap();
        buf.touch_recency(Recency(9));
        assert_eq!(buf.recency(), Recency(9));
        drop(buf);

        assert_eq!(txn.get_subtree_recencies(&[a, b]), vec![Recency(7), Recency(9)]);
        txn.commit().unwrap();
        (a, b)
    };

    assert_eq!(serializer.get_recency(a), Recency(7));
    assert_eq!(serializer.get_recency(b), Recency(9));

    let cache = open(&serializer, test_config());
    let txn = begin_read(&cache);
    assert_eq!(txn.get_subtree_recencies(&[a, b]), vec![Recency(7), Recency(9)]);
}

#[test]
fn shutdown_waits_for_live_transactions() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let (tx, rx) = mpsc::channel();

    let block_id = thread::scope(|s| {
        let cache = &cache;
        let worker = s.spawn(move || {
            let txn = begin_write(cache, Recency(1));
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            let mut buf = txn.allocate().unwrap();
            buf.set_data(0, &[6]);
            let block_id = buf.block_id();
            drop(buf);
            txn.commit().unwrap();
            block_id
        });

        rx.recv().unwrap();
        cache.shutdown().unwrap();
        assert_eq!(cache.stats().live_transactions, 0);
        worker.join().unwrap()
    });

    assert!(matches!(
        cache.begin_transaction(Access::Read, 0, Recency::INVALID, OrderToken::ignore()),
        Err(Error::ShuttingDown)
    ));
    assert_eq!(cache.stats().dirty_blocks, 0);
    drop(cache);

    let cache = open(&serializer, test_config());
    assert_eq!(read_block(&cache, block_id)[0], 6);
}

#[test]
fn write_admission_is_bounded_and_interruptible() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(
        &serializer,
        Config { max_concurrent_write_transactions: 1, ..test_config() },
    );
    let a = write_new_block(&cache, &[1]);

    let holder = begin_write(&cache, Recency(2));

    // readers are not throttled
    assert_eq!(read_block(&cache, a)[0], 1);

    let interruptor = Interruptor::new();
    thread::scope(|s| {
        let cache = &cache;
        let interruptor = &interruptor;
        let waiter = s.spawn(move || {
            cache
                .begin_transaction_interruptible(
                    Access::Write,
                    1,
                    Recency(3),
                    OrderToken::ignore(),
                    interruptor,
                )
                .map(|_| ())
        });
        thread::sleep(Duration::from_millis(20));
        interruptor.pulse();
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));
    });

    holder.commit().unwrap();
    overwrite(&cache, a, &[2]);
    assert_eq!(read_block(&cache, a)[0], 2);
}

#[test]
fn failed_writeback_keeps_blocks_dirty() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let a = write_new_block(&cache, &[1]);

    serializer.fail_writes(true);
    assert!(matches!(cache.flush(), Err(Error::Io(_))));
    assert_eq!(cache.stats().dirty_blocks, 1);

    serializer.fail_writes(false);
    cache.flush().unwrap();
    assert_eq!(cache.stats().dirty_blocks, 0);
    drop(cache);

    let cache = open(&serializer, test_config());
    assert_eq!(read_block(&cache, a)[0], 1);
}

#[test]
fn committing_past_the_dirty_limit_flushes() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, Config { max_dirty_blocks: 4, ..test_config() });

    for i in 0..10u8 {
        write_new_block(&cache, &[i]);
        assert!(cache.stats().dirty_blocks < 4);
    }
    assert!(cache.stats().flushes > 0);
}

#[test]
fn background_flusher_cleans_blocks() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, Config { flush_every_ms: Some(5), ..test_config() });
    write_new_block(&cache, &[1]);

    for _ in 0..1000 {
        if cache.stats().dirty_blocks == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(cache.stats().dirty_blocks, 0);
    cache.check_error().unwrap();
}

#[test]
fn allocation_fails_when_ids_run_out() {
    setup_logger();
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE).with_block_id_limit(3));
    Cache::create(&*serializer).unwrap();
    let cache = open(&serializer, test_config());

    write_new_block(&cache, &[1]);
    write_new_block(&cache, &[2]);

    let txn = begin_write(&cache, Recency(1));
    assert!(matches!(txn.allocate(), Err(Error::AllocationFailed(_))));
    txn.commit().unwrap();
}

#[test]
fn reads_are_charged_to_the_transaction_account() {
    setup_logger();
    let serializer = fresh_serializer();
    let a = {
        let cache = open(&serializer, test_config());
        write_new_block(&cache, &[1])
    };

    let cache = open(&serializer, test_config());
    let mut txn = begin_read(&cache);
    txn.set_account(cache.create_account(7));
    assert_eq!(txn.acquire(a, Access::Read).unwrap().get_data_read()[0], 1);
    txn.commit().unwrap();

    assert_eq!(serializer.io_count(7), 1);
}
