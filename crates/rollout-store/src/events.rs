use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::types::FromSql;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use rollout_core::{CorrelationId, EventBody, EventName, NewEvent, Record};

use crate::config::LogConfig;
use crate::database::Database;
use crate::error::LogError;
use crate::query::{QueryOptions, SeqRange};
use crate::subscription::Subscription;

/// Rows fetched per round trip by [`Records`] and subscription catch-up.
pub(crate) const PAGE_SIZE: usize = 256;

/// Append-only, totally ordered event log.
///
/// Appends are serialized through the database's writer connection; each
/// committed record is published to live subscribers while the writer lock
/// is still held, so subscribers observe records in sequence order.
pub struct EventLog {
    db: Database,
    live: RwLock<Option<broadcast::Sender<Record>>>,
    config: LogConfig,
}

impl EventLog {
    /// Open (or create) the log at `path`. Sequence numbering resumes after
    /// the last stored record.
    pub fn open(path: impl AsRef<Path>, config: LogConfig) -> Result<Self, LogError> {
        let db = Database::open(path.as_ref(), &config)?;
        let (live, _) = broadcast::channel(config.subscriber_buffer.max(1));
        Ok(Self {
            db,
            live: RwLock::new(Some(live)),
            config,
        })
    }

    /// Durably append an event, assigning the next sequence number and a
    /// timestamp no earlier than the previous record's.
    #[instrument(skip_all, fields(name = %event.name(), id = %event.id))]
    pub fn append(&self, event: NewEvent) -> Result<Record, LogError> {
        self.db.with_writer(|conn| self.append_locked(conn, event))
    }

    /// [`append`](Self::append) that gives up when the writer cannot be
    /// acquired within `timeout`. Used from crash paths where another thread
    /// may hold the writer indefinitely.
    pub fn try_append(&self, event: NewEvent, timeout: Duration) -> Result<Record, LogError> {
        self.db
            .with_writer_timeout(timeout, |conn| self.append_locked(conn, event))
    }

    fn append_locked(&self, conn: &mut Connection, event: NewEvent) -> Result<Record, LogError> {
        let data = event
            .body
            .data()?
            .map(|value| serde_json::to_string(&value))
            .transpose()?;

        let tx = conn.transaction()?;
        let last: Option<(i64, i64)> = tx
            .query_row(
                "SELECT seq, time FROM events ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let seq = last.map_or(1, |(seq, _)| seq + 1);
        let now = Utc::now().timestamp_millis();
        let time = last.map_or(now, |(_, prev)| now.max(prev));

        tx.execute(
            "INSERT INTO events (seq, id, time, name, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![seq, event.id.as_str(), time, event.name().as_str(), data],
        )?;
        tx.commit()?;

        let record = Record {
            seq: seq as u64,
            id: event.id,
            time: millis_to_time(time)?,
            body: event.body,
        };
        debug!(seq = record.seq, "event appended");

        if let Some(live) = self.live.read().as_ref() {
            // No receivers is not an error.
            let _ = live.send(record.clone());
        }
        Ok(record)
    }

    /// Records in the requested range, ordered by sequence (descending when
    /// `reverse`), at most `limit` of them. The range is fixed to the records
    /// committed when the call is made; later appends are not included.
    pub fn query(&self, opts: &QueryOptions) -> Result<Records, LogError> {
        opts.validate()?;
        let mut range = opts.seq_range();

        let Some(head) = self.head()? else {
            return Ok(Records::empty(self.db.clone()));
        };
        range.end = range.end.min(head as i64);

        Ok(Records {
            db: self.db.clone(),
            range,
            reverse: opts.reverse,
            remaining: opts.effective_limit(),
            buffered: VecDeque::new(),
            done: range.is_empty(),
        })
    }

    /// Live tail: replays every stored record, then streams new appends until
    /// the log closes or the subscription is dropped. Must be called inside a
    /// Tokio runtime.
    pub fn subscribe(&self) -> Result<Subscription, LogError> {
        let live = self
            .live
            .read()
            .as_ref()
            .ok_or(LogError::Closed)?
            .subscribe();
        Subscription::spawn(self.db.clone(), live, self.config.subscriber_buffer)
    }

    /// Flush and close. Safe to call more than once; later calls are no-ops.
    /// Live subscriptions end after draining what was already published.
    pub fn close(&self) -> Result<(), LogError> {
        let closed = self.db.close()?;
        self.end_live();
        if closed {
            debug!("event log closed");
        }
        Ok(())
    }

    /// [`close`](Self::close) bounded by `timeout` on the writer lock.
    pub fn try_close(&self, timeout: Duration) -> Result<(), LogError> {
        self.db.close_timeout(timeout)?;
        self.end_live();
        Ok(())
    }

    fn end_live(&self) {
        let _ = self.live.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }

    /// Sequence number of the newest record, if any.
    pub fn head(&self) -> Result<Option<u64>, LogError> {
        self.db.with_reader(|conn| {
            let head: Option<i64> =
                conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?;
            Ok(head.map(|seq| seq as u64))
        })
    }

    pub fn count(&self) -> Result<u64, LogError> {
        self.db.with_reader(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }
}

/// Lazily paged query result. Yields at most the query's limit; stops after
/// the first error.
pub struct Records {
    db: Database,
    range: SeqRange,
    reverse: bool,
    remaining: usize,
    buffered: VecDeque<Record>,
    done: bool,
}

impl Records {
    fn empty(db: Database) -> Self {
        Self {
            db,
            range: SeqRange::ALL,
            reverse: false,
            remaining: 0,
            buffered: VecDeque::new(),
            done: true,
        }
    }
}

impl Iterator for Records {
    type Item = Result<Record, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                self.remaining -= 1;
                return Some(Ok(record));
            }
            if self.done || self.remaining == 0 {
                return None;
            }

            let want = self.remaining.min(PAGE_SIZE);
            let (range, reverse) = (self.range, self.reverse);
            let page = match self
                .db
                .with_reader(|conn| read_page(conn, range, reverse, want))
            {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            match page.last() {
                Some(last) if page.len() == want => {
                    let seq = last.seq as i64;
                    if reverse {
                        self.range.end = seq.saturating_sub(1);
                    } else {
                        self.range.start = seq.saturating_add(1);
                    }
                    self.done = self.range.is_empty();
                }
                _ => self.done = true,
            }
            self.buffered.extend(page);
        }
    }
}

/// One page of records within `range`.
pub(crate) fn read_page(
    conn: &Connection,
    range: SeqRange,
    reverse: bool,
    limit: usize,
) -> Result<Vec<Record>, LogError> {
    if range.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let sql = if reverse {
        "SELECT seq, id, time, name, data FROM events
         WHERE seq BETWEEN ?1 AND ?2 ORDER BY seq DESC LIMIT ?3"
    } else {
        "SELECT seq, id, time, name, data FROM events
         WHERE seq BETWEEN ?1 AND ?2 ORDER BY seq ASC LIMIT ?3"
    };
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(rusqlite::params![range.start, range.end, limit as i64])?;
    let mut records = Vec::with_capacity(limit.min(PAGE_SIZE));
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row)?);
    }
    Ok(records)
}

/// Columns of `SELECT seq, id, time, name, data FROM events`, in order.
#[derive(Clone, Copy)]
enum Column {
    Seq,
    Id,
    Time,
    Name,
    Data,
}

impl Column {
    fn label(self) -> &'static str {
        match self {
            Self::Seq => "seq",
            Self::Id => "id",
            Self::Time => "time",
            Self::Name => "name",
            Self::Data => "data",
        }
    }

    fn read<T: FromSql>(self, row: &rusqlite::Row<'_>) -> Result<T, LogError> {
        row.get(self as usize).map_err(|e| self.corrupt(e))
    }

    fn corrupt(self, detail: impl std::fmt::Display) -> LogError {
        LogError::CorruptRow {
            column: self.label(),
            detail: detail.to_string(),
        }
    }
}

pub(crate) fn row_to_record(row: &rusqlite::Row<'_>) -> Result<Record, LogError> {
    let seq: i64 = Column::Seq.read(row)?;
    let seq = u64::try_from(seq)
        .map_err(|_| Column::Seq.corrupt(format!("negative sequence {seq}")))?;

    let id: String = Column::Id.read(row)?;

    let millis: i64 = Column::Time.read(row)?;
    let time = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Column::Time.corrupt(format!("timestamp out of range: {millis}")))?;

    let name: String = Column::Name.read(row)?;
    let name: EventName = name
        .parse()
        .map_err(|_| Column::Name.corrupt(format!("unknown event name {name:?}")))?;

    let data = Column::Data
        .read::<Option<String>>(row)?
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .map_err(|e| Column::Data.corrupt(format!("invalid JSON: {e}")))?;
    let body = EventBody::from_parts(name, data).map_err(|e| Column::Data.corrupt(e))?;

    Ok(Record {
        seq,
        id: CorrelationId::from_raw(id),
        time,
        body,
    })
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>, LogError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| LogError::Serialization(format!("timestamp out of range: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures::StreamExt;
    use rollout_core::{CrashedData, ErroredData, TriggeredData};

    fn open_temp() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events.db"), LogConfig::default()).unwrap();
        (dir, log)
    }

    fn event(body: EventBody) -> NewEvent {
        NewEvent::new(CorrelationId::process(), body)
    }

    fn triggered(service: &str) -> EventBody {
        EventBody::DeploymentTriggered(TriggeredData {
            service: service.into(),
            image: format!("acme/{service}"),
            tag: "2024-05-01-abcdef123456".into(),
        })
    }

    fn collect(log: &EventLog, opts: &QueryOptions) -> Vec<Record> {
        log.query(opts).unwrap().collect::<Result<_, _>>().unwrap()
    }

    fn seqs(records: &[Record]) -> Vec<u64> {
        records.iter().map(|r| r.seq).collect()
    }

    fn all() -> QueryOptions {
        QueryOptions {
            limit: crate::MAX_LIMIT,
            ..Default::default()
        }
    }

    #[test]
    fn sequences_start_at_one_and_are_gapless() {
        let (_dir, log) = open_temp();
        for expected in 1..=5 {
            let record = log.append(event(EventBody::Booted)).unwrap();
            assert_eq!(record.seq, expected);
        }
        assert_eq!(log.head().unwrap(), Some(5));
        assert_eq!(log.count().unwrap(), 5);
    }

    #[test]
    fn empty_log_has_no_head() {
        let (_dir, log) = open_temp();
        assert_eq!(log.head().unwrap(), None);
        assert!(collect(&log, &QueryOptions::default()).is_empty());
    }

    #[test]
    fn stored_records_match_appended() {
        let (_dir, log) = open_temp();
        let id = CorrelationId::new();
        let bodies = vec![
            triggered("api"),
            EventBody::DeploymentSucceeded,
            EventBody::DeploymentErrored(ErroredData {
                message: "exit status 1".into(),
                stack: "boom".into(),
            }),
            EventBody::Crashed(CrashedData {
                message: "panic".into(),
                stack: "trace".into(),
                code: Some("PANIC".into()),
            }),
        ];
        let appended: Vec<Record> = bodies
            .into_iter()
            .map(|body| log.append(NewEvent::new(id.clone(), body)).unwrap())
            .collect();

        assert_eq!(collect(&log, &all()), appended);
    }

    #[test]
    fn times_never_decrease() {
        let (_dir, log) = open_temp();
        // Push a future timestamp in directly; the next append must not go back.
        log.db
            .with_writer(|conn| {
                let future = Utc::now().timestamp_millis() + 60_000;
                conn.execute(
                    "INSERT INTO events (seq, id, time, name) VALUES (1, 'proc_x', ?1, 'Booted')",
                    [future],
                )?;
                Ok(())
            })
            .unwrap();
        let first = collect(&log, &all()).remove(0);
        let next = log.append(event(EventBody::Stopped)).unwrap();
        assert_eq!(next.seq, 2);
        assert!(next.time >= first.time);
    }

    #[test]
    fn reverse_returns_newest_first() {
        let (_dir, log) = open_temp();
        log.append(event(EventBody::Booted)).unwrap();
        log.append(event(EventBody::Stopped)).unwrap();

        let records = collect(
            &log,
            &QueryOptions {
                reverse: true,
                limit: 2,
                ..Default::default()
            },
        );
        let names: Vec<EventName> = records.iter().map(Record::name).collect();
        assert_eq!(names, vec![EventName::Stopped, EventName::Booted]);
    }

    #[test]
    fn default_limit_is_ten() {
        let (_dir, log) = open_temp();
        for _ in 0..25 {
            log.append(event(EventBody::Booted)).unwrap();
        }
        let records = collect(&log, &QueryOptions::default());
        assert_eq!(seqs(&records), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn limit_spans_multiple_pages() {
        let (_dir, log) = open_temp();
        for _ in 0..(PAGE_SIZE + 50) {
            log.append(event(EventBody::Booted)).unwrap();
        }
        let records = collect(&log, &all());
        assert_eq!(records.len(), PAGE_SIZE + 50);
        assert_eq!(records.last().unwrap().seq, (PAGE_SIZE + 50) as u64);

        let reversed = collect(
            &log,
            &QueryOptions {
                reverse: true,
                limit: PAGE_SIZE + 10,
                ..Default::default()
            },
        );
        assert_eq!(reversed.len(), PAGE_SIZE + 10);
        assert_eq!(reversed[0].seq, (PAGE_SIZE + 50) as u64);
        assert_eq!(reversed.last().unwrap().seq, 41);
    }

    #[test]
    fn invalid_limit_rejected() {
        let (_dir, log) = open_temp();
        let opts = QueryOptions {
            limit: 0,
            ..Default::default()
        };
        assert!(matches!(log.query(&opts), Err(LogError::InvalidRange(_))));
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let (_dir, log) = open_temp();
        for _ in 0..(crate::MAX_LIMIT + 5) {
            log.append(event(EventBody::Booted)).unwrap();
        }
        let opts = QueryOptions {
            limit: 5000,
            ..Default::default()
        };
        assert_eq!(collect(&log, &opts).len(), crate::MAX_LIMIT);
    }

    #[test]
    fn bounds_select_inclusive_and_exclusive() {
        let (_dir, log) = open_temp();
        for _ in 0..10 {
            log.append(event(EventBody::Booted)).unwrap();
        }

        let opts = QueryOptions {
            gt: Some(3),
            lte: Some(6),
            ..Default::default()
        };
        assert_eq!(seqs(&collect(&log, &opts)), vec![4, 5, 6]);

        let opts = QueryOptions {
            gte: Some(3),
            lt: Some(6),
            reverse: true,
            ..Default::default()
        };
        assert_eq!(seqs(&collect(&log, &opts)), vec![5, 4, 3]);

        let crossed = QueryOptions {
            gte: Some(8),
            lte: Some(2),
            ..Default::default()
        };
        assert!(collect(&log, &crossed).is_empty());

        let past_head = QueryOptions {
            gt: Some(10),
            ..Default::default()
        };
        assert!(collect(&log, &past_head).is_empty());
    }

    #[test]
    fn query_excludes_later_appends() {
        let (_dir, log) = open_temp();
        log.append(event(EventBody::Booted)).unwrap();
        let records = log.query(&all()).unwrap();
        log.append(event(EventBody::Stopped)).unwrap();
        assert_eq!(records.count(), 1);
    }

    #[test]
    fn numbering_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");

        let log = EventLog::open(&path, LogConfig::default()).unwrap();
        log.append(event(EventBody::Booted)).unwrap();
        log.append(event(EventBody::Stopped)).unwrap();
        log.close().unwrap();

        let log = EventLog::open(&path, LogConfig::default()).unwrap();
        assert_eq!(log.append(event(EventBody::Booted)).unwrap().seq, 3);
        assert_eq!(log.count().unwrap(), 3);
    }

    #[test]
    fn concurrent_appends_are_serialized() {
        let (_dir, log) = open_temp();
        let log = Arc::new(log);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(event(triggered("api"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = collect(&log, &all());
        assert_eq!(seqs(&records), (1..=200).collect::<Vec<_>>());
        assert!(records.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, log) = open_temp();
        log.append(event(EventBody::Stopped)).unwrap();
        log.close().unwrap();
        log.close().unwrap();
        assert!(log.is_closed());
    }

    #[test]
    fn append_after_close_fails() {
        let (_dir, log) = open_temp();
        log.close().unwrap();
        assert!(matches!(
            log.append(event(EventBody::Booted)),
            Err(LogError::Closed)
        ));
        assert!(matches!(log.query(&QueryOptions::default()), Err(LogError::Closed)));
    }

    #[test]
    fn try_append_times_out_while_writer_held() {
        let (_dir, log) = open_temp();
        let result = log.db.with_writer(|_| {
            Ok(log.try_append(event(EventBody::Crashed(CrashedData {
                message: "m".into(),
                stack: "s".into(),
                code: None,
            })), Duration::from_millis(20)))
        });
        assert!(matches!(result.unwrap(), Err(LogError::WriterBusy(_))));
    }

    #[test]
    fn corrupt_row_surfaces_as_error() {
        let (_dir, log) = open_temp();
        log.append(event(EventBody::Booted)).unwrap();
        log.db
            .with_writer(|conn| {
                conn.execute(
                    "INSERT INTO events (seq, id, time, name) VALUES (2, 'x', 0, 'Rebooted')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let results: Vec<_> = log.query(&all()).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(LogError::CorruptRow { column: "name", .. })
        ));
    }

    #[test]
    fn missing_payload_is_corrupt() {
        let (_dir, log) = open_temp();
        log.db
            .with_writer(|conn| {
                conn.execute(
                    "INSERT INTO events (seq, id, time, name) VALUES (1, 'x', 0, 'DeploymentTriggered')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let first = log.query(&all()).unwrap().next().unwrap();
        assert!(matches!(first, Err(LogError::CorruptRow { column: "data", .. })));
    }

    #[test]
    fn out_of_range_time_is_corrupt() {
        let (_dir, log) = open_temp();
        log.db
            .with_writer(|conn| {
                conn.execute(
                    "INSERT INTO events (seq, id, time, name) VALUES (1, 'x', ?1, 'Booted')",
                    [i64::MAX],
                )?;
                Ok(())
            })
            .unwrap();
        let first = log.query(&all()).unwrap().next().unwrap();
        let err = first.unwrap_err();
        assert!(matches!(err, LogError::CorruptRow { column: "time", .. }));
        assert!(err.to_string().starts_with("corrupt event row at events.time"));
    }

    #[tokio::test]
    async fn subscribe_replays_then_follows() {
        let (_dir, log) = open_temp();
        log.append(event(EventBody::Booted)).unwrap();

        let mut sub = log.subscribe().unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.name(), EventName::Booted);

        log.append(event(triggered("api"))).unwrap();
        log.append(event(EventBody::Stopped)).unwrap();

        for expected in [2, 3] {
            let record = tokio::time::timeout(Duration::from_secs(5), sub.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(record.seq, expected);
        }
    }

    #[tokio::test]
    async fn subscription_ends_on_close() {
        let (_dir, log) = open_temp();
        let mut sub = log.subscribe().unwrap();
        log.append(event(EventBody::Booted)).unwrap();
        log.close().unwrap();

        let mut seen = Vec::new();
        while let Some(item) = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
        {
            seen.push(item.unwrap().seq);
        }
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn subscribe_after_close_fails() {
        let (_dir, log) = open_temp();
        log.close().unwrap();
        assert!(matches!(log.subscribe(), Err(LogError::Closed)));
    }
}
