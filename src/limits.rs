use std::time::Duration;

/// Maximum byte length of a user id.
pub const MAX_USER_ID_LEN: usize = 128;

/// Maximum number of slots the ledger will hold.
pub const MAX_SLOTS: usize = 100_000;

/// Maximum capacity of a single slot.
pub const MAX_SLOT_CAPACITY: u32 = 1_000_000;

/// Maximum byte length of one wire request line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Maximum length of a dead-letter failure reason kept in the queue log.
pub const MAX_REASON_LEN: usize = 512;

/// Jobs waiting or in flight before the queue refuses new work.
pub const MAX_QUEUED_JOBS: usize = 1_000_000;

/// Default time a compensated dead letter is kept for inspection.
pub const DEAD_LETTER_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Buffered capacity updates per subscriber before it starts lagging.
pub const CAPACITY_CHANNEL_SIZE: usize = 256;
