//! Pure trigger evaluation: which cron occurrence and run-at time are due,
//! and which block range and addresses a log scan covers.

use crate::models::job::parse_schedule;
use crate::models::{Initiator, InitiatorKind, JobSpec, LogFilter};
use chrono::{DateTime, Duration, Utc};

/// Cron catch-up never looks further back than this.
const MAX_CRON_LOOKBACK_HOURS: i64 = 24;

/// Latest occurrence of `schedule` in `(after, now]`. Missed occurrences
/// collapse into the latest one.
pub fn due_cron_occurrence(
    schedule: &str,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if now <= after {
        return None;
    }
    let schedule = parse_schedule(schedule).ok()?;
    let floor = now - Duration::hours(MAX_CRON_LOOKBACK_HOURS);
    let start = after.max(floor);
    schedule
        .after(&start)
        .take_while(|occurrence| *occurrence <= now)
        .last()
}

/// The time a run-at initiator fires at, once `now` has reached it and it has
/// not fired before.
pub fn run_at_due(initiator: &Initiator, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match initiator.kind {
        InitiatorKind::RunAt { time } if !initiator.ran && time <= now => Some(time),
        _ => None,
    }
}

/// Inclusive block range to scan for logs at `head`, starting at `cursor` and
/// limited to the newest `max_blocks`. `None` when the head has not moved
/// past the cursor. Blocks dropped by the limit are never scanned.
pub fn scan_range(cursor: u64, head: u64, max_blocks: u64) -> Option<(u64, u64)> {
    if head < cursor {
        return None;
    }
    let span = max_blocks.max(1);
    let from = cursor.max(head.saturating_sub(span - 1));
    if from > cursor {
        tracing::warn!(
            skipped_from = cursor,
            skipped_to = from - 1,
            max_blocks = span,
            "log scan fell too far behind; requests in skipped blocks are lost"
        );
    }
    Some((from, head))
}

/// Filter covering every log initiator of `jobs`. An initiator without an
/// address watches all contracts, which widens the filter to everything.
pub fn log_filter<'a>(
    jobs: impl IntoIterator<Item = &'a JobSpec>,
    from_block: u64,
    to_block: u64,
) -> Option<LogFilter> {
    let mut addresses = Vec::new();
    let mut watch_all = false;
    let mut any = false;

    for job in jobs {
        for initiator in job.initiators_of(InitiatorKind::is_log) {
            any = true;
            match initiator.kind.watched_address() {
                Some(address) if !addresses.contains(&address) => addresses.push(address),
                Some(_) => {}
                None => watch_all = true,
            }
        }
    }

    if !any {
        return None;
    }
    if watch_all {
        addresses.clear();
    }
    Some(LogFilter {
        from_block,
        to_block,
        addresses,
    })
}
