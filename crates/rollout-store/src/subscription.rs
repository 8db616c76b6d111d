use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use rollout_core::Record;

use crate::database::Database;
use crate::error::LogError;
use crate::events::{read_page, PAGE_SIZE};
use crate::query::SeqRange;

/// Live tail of the event log.
///
/// Emits every stored record in sequence order, then each new append. A
/// subscriber that falls behind the live channel is caught up from storage,
/// so it sees no gaps and no duplicates. The stream ends when the log is
/// closed; dropping it stops the background task.
pub struct Subscription {
    inner: ReceiverStream<Result<Record, LogError>>,
}

impl Subscription {
    pub(crate) fn spawn(
        db: Database,
        live: broadcast::Receiver<Record>,
        buffer: usize,
    ) -> Result<Self, LogError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LogError::Io(format!("subscribe outside a Tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        runtime.spawn(Tail::new(db, tx).run(live));
        Ok(Self {
            inner: ReceiverStream::new(rx),
        })
    }
}

impl Stream for Subscription {
    type Item = Result<Record, LogError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Background side of a [`Subscription`].
struct Tail {
    db: Database,
    tx: mpsc::Sender<Result<Record, LogError>>,
    next_seq: u64,
    storage_closed: bool,
}

impl Tail {
    fn new(db: Database, tx: mpsc::Sender<Result<Record, LogError>>) -> Self {
        Self {
            db,
            tx,
            next_seq: 1,
            storage_closed: false,
        }
    }

    async fn run(mut self, mut live: broadcast::Receiver<Record>) {
        if let Flow::Stop = self.catch_up().await {
            return;
        }

        loop {
            let received = tokio::select! {
                _ = self.tx.closed() => {
                    debug!("subscriber dropped");
                    return;
                }
                received = live.recv() => received,
            };

            match received {
                Ok(record) => {
                    if record.seq < self.next_seq {
                        continue;
                    }
                    if record.seq > self.next_seq {
                        if let Flow::Stop = self.catch_up().await {
                            return;
                        }
                        if record.seq < self.next_seq {
                            continue;
                        }
                    }
                    if let Flow::Stop = self.deliver(record).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, catching up from storage");
                    if let Flow::Stop = self.catch_up().await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn deliver(&mut self, record: Record) -> Flow {
        self.next_seq = record.seq + 1;
        match self.tx.send(Ok(record)).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        }
    }

    /// Read forward from `next_seq` until storage has nothing newer.
    async fn catch_up(&mut self) -> Flow {
        loop {
            if self.storage_closed {
                return Flow::Continue;
            }

            let db = self.db.clone();
            let range = SeqRange {
                start: self.next_seq as i64,
                end: i64::MAX,
            };
            let page = tokio::task::spawn_blocking(move || {
                db.with_reader(|conn| read_page(conn, range, false, PAGE_SIZE))
            })
            .await
            .map_err(|e| LogError::Io(format!("catch-up task: {e}")))
            .and_then(|page| page);

            let page = match page {
                Ok(page) => page,
                // Anything already published is still drained from the live channel.
                Err(LogError::Closed) => {
                    self.storage_closed = true;
                    return Flow::Continue;
                }
                Err(e) => {
                    warn!(error = %e, "subscription catch-up failed");
                    let _ = self.tx.send(Err(e)).await;
                    return Flow::Stop;
                }
            };

            let full = page.len() == PAGE_SIZE;
            for record in page {
                if let Flow::Stop = self.deliver(record).await {
                    return Flow::Stop;
                }
            }
            if !full {
                return Flow::Continue;
            }
        }
    }
}
