use std::sync::Arc;

use mcache::{
    Access, BlockId, Cache, Config, MemorySerializer, OrderToken, Recency,
};

pub const BLOCK_SIZE: usize = 64;

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// No background flusher, so tests decide when writeback happens.
#[allow(dead_code)]
pub fn test_config() -> Config {
    Config {
        flush_every_ms: None,
        enable_ordering_checks: true,
        ..Config::default()
    }
}

#[allow(dead_code)]
pub fn fresh_serializer() -> Arc<MemorySerializer> {
    let serializer = Arc::new(MemorySerializer::new(BLOCK_SIZE));
    Cache::create(&*serializer).unwrap();
    serializer
}

#[allow(dead_code)]
pub fn open(serializer: &Arc<MemorySerializer>, config: Config) -> Cache {
    config.open(serializer.clone()).unwrap()
}

/// Allocate a block holding `bytes` at offset 0 and commit.
#[allow(dead_code)]
pub fn write_new_block(cache: &Cache, bytes: &[u8]) -> BlockId {
    let txn = cache
        .begin_transaction(Access::Write, 1, Recency(1), OrderToken::ignore())
        .unwrap();
    let mut buf = txn.allocate().unwrap();
    let block_id = buf.block_id();
    buf.set_data(0, bytes);
    buf.release();
    txn.commit().unwrap();
    block_id
}

/// Overwrite the start of `block_id` with `bytes` and commit.
#[allow(dead_code)]
pub fn overwrite(cache: &Cache, block_id: BlockId, bytes: &[u8]) {
    let txn = cache
        .begin_transaction(Access::Write, 1, Recency(2), OrderToken::ignore())
        .unwrap();
    let mut buf = txn.acquire(block_id, Access::Write).unwrap();
    buf.set_data(0, bytes);
    buf.release();
    txn.commit().unwrap();
}

#[allow(dead_code)]
pub fn read_block(cache: &Cache, block_id: BlockId) -> Vec<u8> {
    let txn = cache
        .begin_transaction(Access::Read, 0, Recency::INVALID, OrderToken::ignore())
        .unwrap();
    let buf = txn.acquire(block_id, Access::Read).unwrap();
    let data = buf.get_data_read().to_vec();
    buf.release();
    txn.commit().unwrap();
    data
}
