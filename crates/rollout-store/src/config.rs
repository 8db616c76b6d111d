/// How hard each append is pushed to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// WAL commit per append; fsync at checkpoints and on close. An unclean
    /// shutdown can lose the newest commits but never leaves a torn record.
    #[default]
    Normal,
    /// Fsync on every append.
    Full,
}

impl Durability {
    pub(crate) fn synchronous_pragma(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

/// Event log tuning.
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub durability: Durability,
    /// Read-only connections available to concurrent queries.
    pub reader_pool_size: u32,
    pub busy_timeout_ms: u32,
    /// Live-tail channel capacity. Subscribers that fall further behind
    /// catch up from storage.
    pub subscriber_buffer: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            durability: Durability::Normal,
            reader_pool_size: 4,
            busy_timeout_ms: 5000,
            subscriber_buffer: 1024,
        }
    }
}
