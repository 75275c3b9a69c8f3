mod common;

use mcache::{Access, OrderSource, OrderToken, Recency};

use common::{fresh_serializer, open, setup_logger, test_config, write_new_block};

#[test]
fn tokens_from_one_source_pass_in_order() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let block_id = write_new_block(&cache, &[0]);

    let mut source = OrderSource::new();
    for i in 1..=3u8 {
        let token = source.check_in("write");
        let txn = cache.begin_transaction(Access::Write, 1, Recency(1), token).unwrap();
        assert_ne!(txn.order_token().bucket(), source.bucket());
        let mut buf = txn.acquire(block_id, Access::Write).unwrap();
        buf.set_data(0, &[i]);
        drop(buf);
        txn.commit().unwrap();
    }
}

#[test]
fn reads_between_writes_may_overtake_each_other() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let block_id = write_new_block(&cache, &[0]);

    let mut source = OrderSource::new();
    let w1 = source.check_in("w1");
    let r2 = source.check_in("r2").with_read_mode();
    let r3 = source.check_in("r3").with_read_mode();

    let txn = cache.begin_transaction(Access::Write, 1, Recency(1), w1).unwrap();
    drop(txn.acquire(block_id, Access::Write).unwrap());
    txn.commit().unwrap();

    for token in [r3, r2] {
        let txn = cache
            .begin_transaction(Access::Read, 0, Recency::INVALID, token)
            .unwrap();
        drop(txn.acquire(block_id, Access::Read).unwrap());
        txn.commit().unwrap();
    }
}

#[test]
fn streams_from_different_sources_are_checked_independently() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let block_id = write_new_block(&cache, &[0]);

    let mut source_a = OrderSource::new();
    let mut source_b = OrderSource::new();

    let reader = cache
        .begin_transaction(
            Access::Read,
            0,
            Recency::INVALID,
            source_a.check_in("a-read").with_read_mode(),
        )
        .unwrap();
    let writer = cache
        .begin_transaction(Access::Write, 1, Recency(1), source_b.check_in("b-write"))
        .unwrap();

    let mut buf = writer.acquire(block_id, Access::Write).unwrap();
    buf.set_data(0, &[1]);
    drop(buf);
    writer.commit().unwrap();

    let buf = reader.acquire(block_id, Access::Read).unwrap();
    assert_eq!(buf.get_data_read()[0], 1);
    drop(buf);
    reader.commit().unwrap();

    // each stream keeps going in its own order afterwards
    for i in 2..=3u8 {
        for source in [&mut source_a, &mut source_b] {
            let txn = cache
                .begin_transaction(Access::Write, 1, Recency(1), source.check_in("write"))
                .unwrap();
            let mut buf = txn.acquire(block_id, Access::Write).unwrap();
            buf.set_data(0, &[i]);
            drop(buf);
            txn.commit().unwrap();
        }
    }
}

#[test]
#[should_panic(expected = "order violation")]
fn a_write_behind_a_newer_token_is_caught_at_admission() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());

    let mut source = OrderSource::new();
    let t1 = source.check_in("t1");
    let t2 = source.check_in("t2");

    drop(cache.begin_transaction(Access::Write, 0, Recency(1), t2).unwrap());
    drop(cache.begin_transaction(Access::Write, 0, Recency(1), t1).unwrap());
}

#[test]
#[should_panic(expected = "order violation")]
fn a_transaction_overtaken_at_a_block_is_caught() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let block_id = write_new_block(&cache, &[0]);

    let mut source = OrderSource::new();
    let first = cache
        .begin_transaction(Access::Write, 1, Recency(1), source.check_in("first"))
        .unwrap();
    let second = cache
        .begin_transaction(Access::Write, 1, Recency(1), source.check_in("second"))
        .unwrap();

    drop(second.acquire(block_id, Access::Write).unwrap());
    drop(first.acquire(block_id, Access::Write));
}

#[test]
fn ignored_tokens_are_never_checked() {
    setup_logger();
    let serializer = fresh_serializer();
    let cache = open(&serializer, test_config());
    let block_id = write_new_block(&cache, &[0]);

    let first = cache
        .begin_transaction(Access::Write, 1, Recency(1), OrderToken::ignore())
        .unwrap();
    let second = cache
        .begin_transaction(Access::Write, 1, Recency(1), OrderToken::ignore())
        .unwrap();
    assert!(first.order_token().is_ignore());

    drop(second.acquire(block_id, Access::Write).unwrap());
    drop(first.acquire(block_id, Access::Write).unwrap());
    second.commit().unwrap();
    first.commit().unwrap();
}
