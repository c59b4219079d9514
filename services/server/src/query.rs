// Named queries and their credit-gated executions.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use millrace_wire::{Document, encode_frame};
use tokio::sync::{Notify, mpsc, watch};

use crate::connection::ConnEvent;
use crate::protocol::{fields, frames};

/// Filter deciding whether a binder document belongs in a query's results,
/// given the client's parameters.
pub type QueryFilter = Arc<dyn Fn(&Document, &Document) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct QueryInfo {
    pub binder: String,
    pub filter: QueryFilter,
}

impl QueryInfo {
    /// A query returning every document of the binder.
    pub fn all_of(binder: impl Into<String>) -> Self {
        Self {
            binder: binder.into(),
            filter: Arc::new(|_, _| true),
        }
    }

    pub fn filtered(
        binder: impl Into<String>,
        filter: impl Fn(&Document, &Document) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            binder: binder.into(),
            filter: Arc::new(filter),
        }
    }
}

/// Registry of server-defined queries.
#[derive(Default)]
pub struct QueryManager {
    queries: std::sync::RwLock<HashMap<String, QueryInfo>>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, info: QueryInfo) {
        self.queries
            .write()
            .expect("query registry lock")
            .insert(name.into(), info);
    }

    pub fn get(&self, name: &str) -> Option<QueryInfo> {
        self.queries
            .read()
            .expect("query registry lock")
            .get(name)
            .cloned()
    }
}

/// Handle the connection keeps for a live query execution.
pub(crate) struct QueryExecution {
    credit: Arc<AtomicI64>,
    wakeup: Arc<Notify>,
    stop: watch::Sender<bool>,
}

impl QueryExecution {
    /// Spawn the delivery task for a named query over a document stream.
    /// Results bypass the ordered-response path; the final result is marked
    /// `last`, after which the execution retires itself via the connection's
    /// mailbox.
    pub(crate) fn start(
        query_id: i32,
        mut docs: BoxStream<'static, Document>,
        params: Document,
        filter: QueryFilter,
        outbound: mpsc::Sender<Bytes>,
        events: mpsc::Sender<ConnEvent>,
        initial_credit: i64,
    ) -> QueryExecution {
        let credit = Arc::new(AtomicI64::new(initial_credit));
        let wakeup = Arc::new(Notify::new());
        let (stop, mut stop_rx) = watch::channel(false);

        let task_credit = Arc::clone(&credit);
        let task_wakeup = Arc::clone(&wakeup);
        tokio::spawn(async move {
            // Hold one result back so the final one can be flagged `last`.
            let mut held: Option<Document> = None;
            loop {
                if *stop_rx.borrow() {
                    return;
                }
                let next = tokio::select! {
                    _ = stop_rx.changed() => return,
                    next = docs.next() => next,
                };
                match next {
                    Some(doc) => {
                        if !filter(&params, &doc) {
                            continue;
                        }
                        if let Some(previous) = held.replace(doc)
                            && !send_result(
                                query_id,
                                previous,
                                false,
                                &task_credit,
                                &task_wakeup,
                                &mut stop_rx,
                                &outbound,
                            )
                            .await
                        {
                            return;
                        }
                    }
                    None => break,
                }
            }
            // An empty result set still terminates the query on the wire.
            let last = held.unwrap_or_default();
            let _ = send_result(
                query_id,
                last,
                true,
                &task_credit,
                &task_wakeup,
                &mut stop_rx,
                &outbound,
            )
            .await;
            let _ = events.send(ConnEvent::QueryFinished(query_id)).await;
        });

        QueryExecution {
            credit,
            wakeup,
            stop,
        }
    }

    /// QUERYACK: replenish the client's byte credit.
    pub(crate) fn ack(&self, bytes: i32) {
        self.credit.fetch_add(i64::from(bytes), Ordering::AcqRel);
        self.wakeup.notify_one();
    }

    pub(crate) fn close(&self) {
        let _ = self.stop.send(true);
        self.wakeup.notify_one();
    }
}

async fn send_result(
    query_id: i32,
    result: Document,
    last: bool,
    credit: &AtomicI64,
    wakeup: &Notify,
    stop_rx: &mut watch::Receiver<bool>,
    outbound: &mpsc::Sender<Bytes>,
) -> bool {
    let frame = encode_frame(
        frames::QUERYRESULT,
        &Document::new()
            .put(fields::QUERYID, query_id)
            .put(fields::RESULT, result)
            .put(fields::LAST, last),
    );
    let cost = frame.len() as i64;
    // Never push more unacknowledged bytes than the outstanding credit.
    while credit.load(Ordering::Acquire) < cost {
        tokio::select! {
            _ = stop_rx.changed() => return false,
            _ = wakeup.notified() => {}
        }
        if *stop_rx.borrow() {
            return false;
        }
    }
    credit.fetch_sub(cost, Ordering::AcqRel);
    outbound.send(frame).await.is_ok()
}
