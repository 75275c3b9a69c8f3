//! Order tokens verify that operations from one logical stream are observed
//! in the order they were issued.
//!
//! An [`OrderSource`] stamps operations with increasing values in its
//! bucket. An [`OrderSink`] sits wherever the order must still hold and
//! checks every token that reaches it:
//!
//! * a write token must not be older than anything already seen in its
//!   bucket;
//! * a read token must not be older than the last write seen in its bucket,
//!   but reads may overtake each other.
//!
//! Re-delivering the same token is tolerated. Violations are bugs in the
//! calling code, so `check_out` panics; `verify` reports them as a value for
//! callers that want to inspect them. Sinks built with `enabled = false`
//! accept everything.
//!
//! ```
//! use mcache::order::{OrderSink, OrderSource};
//!
//! let mut source = OrderSource::new();
//! let mut sink = OrderSink::new(true);
//!
//! let t1 = source.check_in("t1");
//! let t2 = source.check_in("t2");
//! let t3 = t2.with_read_mode();
//!
//! sink.check_out(t1);
//! sink.check_out(t3);
//! sink.check_out(t2);
//! assert!(sink.verify(t1).is_err());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;

static NEXT_BUCKET: AtomicU64 = AtomicU64::new(1);

const INVALID_BUCKET: u64 = 0;
const IGNORE_BUCKET: u64 = u64::MAX;

/// Identifies one logical stream of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderBucket(u64);

impl OrderBucket {
    /// A fresh bucket, distinct from every other bucket ever created in
    /// this process.
    pub fn create() -> OrderBucket {
        let id = NEXT_BUCKET.fetch_add(1, Ordering::Relaxed);
        assert!(id < IGNORE_BUCKET, "order bucket space exhausted");
        OrderBucket(id)
    }

    /// The sentinel bucket of uninitialized tokens. Never equal to a bucket
    /// returned by `create`.
    pub const fn invalid() -> OrderBucket {
        OrderBucket(INVALID_BUCKET)
    }

    /// Whether this bucket came from `create`.
    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_BUCKET && self.0 != IGNORE_BUCKET
    }
}

/// A stamp carried by one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderToken {
    bucket: OrderBucket,
    value: u64,
    read_mode: bool,
    tag: &'static str,
}

impl Default for OrderToken {
    fn default() -> OrderToken {
        OrderToken::invalid()
    }
}

impl OrderToken {
    /// The uninitialized token. Checking it out is a bug.
    pub const fn invalid() -> OrderToken {
        OrderToken {
            bucket: OrderBucket::invalid(),
            value: 0,
            read_mode: false,
            tag: "invalid",
        }
    }

    /// A token that every sink accepts without recording anything, for
    /// operations whose order deliberately does not matter.
    pub const fn ignore() -> OrderToken {
        OrderToken {
            bucket: OrderBucket(IGNORE_BUCKET),
            value: 0,
            read_mode: false,
            tag: "ignore",
        }
    }

    /// The same token flagged as a read.
    #[must_use]
    pub const fn with_read_mode(self) -> OrderToken {
        OrderToken { read_mode: true, ..self }
    }

    /// Whether this is the `ignore` token.
    pub const fn is_ignore(&self) -> bool {
        self.bucket.0 == IGNORE_BUCKET
    }

    /// Whether this is the `invalid` token.
    pub const fn is_invalid(&self) -> bool {
        self.bucket.0 == INVALID_BUCKET
    }

    /// Whether this token was flagged with `with_read_mode`.
    pub const fn is_read_mode(&self) -> bool {
        self.read_mode
    }

    /// The bucket this token was issued in.
    pub const fn bucket(&self) -> OrderBucket {
        self.bucket
    }

    /// The sequence value within the bucket.
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// The diagnostic tag given to `check_in`.
    pub const fn tag(&self) -> &'static str {
        self.tag
    }
}

/// Issues write tokens with increasing values in its own bucket.
///
/// `check_in` takes `&mut self`: a source belongs to exactly one owner, which
/// is what keeps its values totally ordered.
#[derive(Debug)]
pub struct OrderSource {
    bucket: OrderBucket,
    counter: u64,
}

impl Default for OrderSource {
    fn default() -> OrderSource {
        OrderSource::new()
    }
}

impl OrderSource {
    /// A source with a fresh bucket.
    pub fn new() -> OrderSource {
        OrderSource { bucket: OrderBucket::create(), counter: 0 }
    }

    /// This source's bucket.
    pub fn bucket(&self) -> OrderBucket {
        self.bucket
    }

    /// Stamp the next operation.
    pub fn check_in(&mut self, tag: &'static str) -> OrderToken {
        self.counter += 1;
        OrderToken {
            bucket: self.bucket,
            value: self.counter,
            read_mode: false,
            tag,
        }
    }
}

/// A token reached a sink out of order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderViolation {
    /// The offending token.
    pub token: OrderToken,
    /// The last write value the sink had seen in the token's bucket.
    pub last_write: u64,
    /// The last read-or-write value the sink had seen in the bucket.
    pub last_read_or_write: u64,
}

impl fmt::Display for OrderViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "order violation: {} token {} ({}) in bucket {:?} arrived after \
             last write {} / last read-or-write {}",
            if self.token.read_mode { "read" } else { "write" },
            self.token.value,
            self.token.tag,
            self.token.bucket,
            self.last_write,
            self.last_read_or_write,
        )
    }
}

impl std::error::Error for OrderViolation {}

#[derive(Debug, Default, Clone, Copy)]
struct BucketState {
    last_write: u64,
    last_read_or_write: u64,
}

impl BucketState {
    fn verify(&self, token: OrderToken) -> Result<(), OrderViolation> {
        let floor =
            if token.read_mode { self.last_write } else { self.last_read_or_write };

        if token.value < floor {
            return Err(OrderViolation {
                token,
                last_write: self.last_write,
                last_read_or_write: self.last_read_or_write,
            });
        }

        Ok(())
    }

    fn record(&mut self, token: OrderToken) {
        if token.read_mode {
            self.last_read_or_write = self.last_read_or_write.max(token.value);
        } else {
            self.last_write = token.value;
            self.last_read_or_write = token.value;
        }
    }
}

fn assert_checkable(token: &OrderToken) {
    assert!(
        !token.is_invalid(),
        "an uninitialized order token was checked out (tag: {})",
        token.tag
    );
}

/// Checks tokens from any number of buckets.
#[derive(Debug)]
pub struct OrderSink {
    enabled: bool,
    buckets: FnvHashMap<OrderBucket, BucketState>,
}

impl OrderSink {
    /// A sink that checks tokens when `enabled`, and ignores them otherwise.
    pub fn new(enabled: bool) -> OrderSink {
        OrderSink { enabled, buckets: FnvHashMap::default() }
    }

    /// Check and record `token`, reporting a violation instead of
    /// panicking. A violating token is not recorded.
    pub fn verify(&mut self, token: OrderToken) -> Result<(), OrderViolation> {
        if !self.enabled || token.is_ignore() {
            return Ok(());
        }
        assert_checkable(&token);

        let state = self.buckets.entry(token.bucket).or_default();
        state.verify(token)?;
        state.record(token);
        Ok(())
    }

    /// Check and record `token`.
    ///
    /// # Panics
    ///
    /// Panics if `token` is out of order or is the invalid token.
    #[track_caller]
    pub fn check_out(&mut self, token: OrderToken) {
        if let Err(violation) = self.verify(token) {
            panic!("{}", violation);
        }
    }
}

/// A sink for exactly one bucket. Cheaper than `OrderSink` because it keeps
/// no map; a token from a second bucket is a bug.
#[derive(Debug)]
pub struct PlainSink {
    enabled: bool,
    bucket: Option<OrderBucket>,
    state: BucketState,
}

impl PlainSink {
    /// A sink that checks tokens when `enabled`, and ignores them otherwise.
    pub fn new(enabled: bool) -> PlainSink {
        PlainSink { enabled, bucket: None, state: BucketState::default() }
    }

    /// Check and record `token`, reporting a violation instead of
    /// panicking.
    ///
    /// # Panics
    ///
    /// Panics if `token` belongs to a different bucket than the tokens seen
    /// before it.
    pub fn verify(&mut self, token: OrderToken) -> Result<(), OrderViolation> {
        if !self.enabled || token.is_ignore() {
            return Ok(());
        }
        assert_checkable(&token);

        let bucket = *self.bucket.get_or_insert(token.bucket);
        assert_eq!(
            bucket, token.bucket,
            "PlainSink saw a second bucket (token tag: {})",
            token.tag
        );

        self.state.verify(token)?;
        self.state.record(token);
        Ok(())
    }

    /// Check and record `token`.
    ///
    /// # Panics
    ///
    /// Panics if `token` is out of order, is the invalid token, or belongs
    /// to a second bucket.
    #[track_caller]
    pub fn check_out(&mut self, token: OrderToken) {
        if let Err(violation) = self.verify(token) {
            panic!("{}", violation);
        }
    }
}

/// Checks tokens entering a new ordering domain and re-stamps them in the
/// checkpoint's own bucket.
#[derive(Debug)]
pub struct OrderCheckpoint {
    sink: OrderSink,
    source: OrderSource,
}

impl OrderCheckpoint {
    /// A checkpoint whose incoming checks are on when `enabled`.
    pub fn new(enabled: bool) -> OrderCheckpoint {
        OrderCheckpoint { sink: OrderSink::new(enabled), source: OrderSource::new() }
    }

    /// The bucket that re-stamped tokens belong to.
    pub fn bucket(&self) -> OrderBucket {
        self.source.bucket()
    }

    /// Check `token` and return a fresh token with the same mode and tag.
    /// The ignore token passes through unchanged.
    #[track_caller]
    pub fn check_through(&mut self, token: OrderToken) -> OrderToken {
        if token.is_ignore() {
            return token;
        }

        self.sink.check_out(token);

        let restamped = self.source.check_in(token.tag);
        if token.read_mode { restamped.with_read_mode() } else { restamped }
    }
}
