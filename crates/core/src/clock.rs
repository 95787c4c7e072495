use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, used for persisted timestamps
/// (`last_seen`, `announced_at`) where a wall-clock value needs to survive
/// a process restart. In-process deadlines and sweeps use
/// `tokio::time::Instant` instead; this is only for what gets written to
/// disk.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
