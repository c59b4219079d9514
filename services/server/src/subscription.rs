// Subscriptions: per-subscription delivery tasks streaming records off a
// channel log under credit-based flow control.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use bytes::Bytes;
use millrace_log::{Log, LogCursor, LogRecord};
use millrace_wire::{Document, encode_frame};
use tokio::sync::{Notify, mpsc, watch};

use crate::protocol::{fields, frames};

/// Everything a SUBSCRIBE frame says about the wanted stream.
#[derive(Debug, Clone)]
pub struct SubDescriptor {
    pub channel: String,
    /// Record number to start from; -1 means "from the next unseen record".
    pub start_pos: i64,
    pub start_timestamp: Option<i64>,
    pub matcher: Option<Document>,
    pub durable_id: Option<String>,
}

/// Server-wide cursors for durable subscriptions: last acknowledged position
/// per durable id. Retained on subscription close, discarded on unsubscribe.
#[derive(Default)]
pub struct DurableCursors {
    cursors: std::sync::Mutex<HashMap<String, i64>>,
}

impl DurableCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, durable_id: &str) -> Option<i64> {
        self.cursors
            .lock()
            .expect("durable cursor lock")
            .get(durable_id)
            .copied()
    }

    pub fn record_ack(&self, durable_id: &str, pos: i64) {
        self.cursors
            .lock()
            .expect("durable cursor lock")
            .insert(durable_id.to_string(), pos);
    }

    pub fn remove(&self, durable_id: &str) {
        self.cursors
            .lock()
            .expect("durable cursor lock")
            .remove(durable_id);
    }
}

/// Handle the connection keeps for a live subscription.
pub(crate) struct Subscription {
    credit: Arc<AtomicI64>,
    wakeup: Arc<Notify>,
    stop: watch::Sender<bool>,
    durable_id: Option<String>,
    durable: Arc<DurableCursors>,
}

impl Subscription {
    /// Resolve the start position and spawn the delivery task.
    pub(crate) async fn start(
        log: Arc<Log>,
        descriptor: SubDescriptor,
        sub_id: i32,
        outbound: mpsc::Sender<Bytes>,
        initial_credit: i64,
        durable: Arc<DurableCursors>,
    ) -> Result<Subscription> {
        let start = if descriptor.start_pos >= 0 {
            descriptor.start_pos
        } else if let Some(acked) = descriptor
            .durable_id
            .as_deref()
            .and_then(|id| durable.get(id))
        {
            acked + 1
        } else {
            log.tail()
        };
        let cursor = log.cursor_at(start).await?;

        let credit = Arc::new(AtomicI64::new(initial_credit));
        let wakeup = Arc::new(Notify::new());
        let (stop, stop_rx) = watch::channel(false);
        let delivery = Delivery {
            sub_id,
            cursor,
            matcher: descriptor.matcher.clone(),
            start_timestamp: descriptor.start_timestamp,
            credit: Arc::clone(&credit),
            wakeup: Arc::clone(&wakeup),
            stop_rx,
            outbound,
        };
        tokio::spawn(async move {
            if let Err(err) = delivery.run().await {
                tracing::warn!(sub_id, error = %err, "subscription delivery failed");
            }
        });

        Ok(Subscription {
            credit,
            wakeup,
            stop,
            durable_id: descriptor.durable_id,
            durable,
        })
    }

    /// ACKEV: replenish credit up to `pos` and advance the durable cursor.
    pub(crate) fn ack(&self, pos: i64, bytes: i32) {
        self.credit.fetch_add(i64::from(bytes), Ordering::AcqRel);
        if let Some(durable_id) = &self.durable_id {
            self.durable.record_ack(durable_id, pos);
        }
        self.wakeup.notify_one();
    }

    /// Stop delivery; a durable cursor survives for the next subscribe.
    pub(crate) fn close(&self) {
        let _ = self.stop.send(true);
        self.wakeup.notify_one();
    }

    /// Stop delivery and forget the durable cursor.
    pub(crate) fn unsubscribe(&self) {
        self.close();
        if let Some(durable_id) = &self.durable_id {
            self.durable.remove(durable_id);
        }
    }
}

struct Delivery {
    sub_id: i32,
    cursor: LogCursor,
    matcher: Option<Document>,
    start_timestamp: Option<i64>,
    credit: Arc<AtomicI64>,
    wakeup: Arc<Notify>,
    stop_rx: watch::Receiver<bool>,
    outbound: mpsc::Sender<Bytes>,
}

impl Delivery {
    async fn run(mut self) -> Result<()> {
        loop {
            if *self.stop_rx.borrow() {
                return Ok(());
            }
            let record = match self.cursor.next()? {
                Some(record) => record,
                None => {
                    tokio::select! {
                        _ = self.stop_rx.changed() => return Ok(()),
                        waited = self.cursor.wait_for_record() => {
                            waited?;
                            continue;
                        }
                    }
                }
            };
            if !self.wants(&record) {
                continue;
            }
            let cost = record.document.to_bytes().len() as i64;
            // Never push more unacknowledged bytes than the window allows.
            while self.credit.load(Ordering::Acquire) < cost {
                tokio::select! {
                    _ = self.stop_rx.changed() => return Ok(()),
                    _ = self.wakeup.notified() => {}
                }
                if *self.stop_rx.borrow() {
                    return Ok(());
                }
            }
            self.credit.fetch_sub(cost, Ordering::AcqRel);

            let timestamp = record.document.get_i64(fields::TIMESTAMP).unwrap_or(0);
            let event = record
                .document
                .get_doc(fields::EVENT)
                .cloned()
                .unwrap_or_default();
            let frame = encode_frame(
                frames::RECEV,
                &Document::new()
                    .put(fields::SUBID, self.sub_id)
                    .put(fields::POS, record.number)
                    .put(fields::TIMESTAMP, timestamp)
                    .put(fields::EVENT, event),
            );
            if self.outbound.send(frame).await.is_err() {
                // Connection gone; delivery ends with it.
                return Ok(());
            }
            metrics::counter!("millrace_sub_records_delivered_total").increment(1);
        }
    }

    /// Matcher and start-timestamp filtering; failures skip silently.
    fn wants(&self, record: &LogRecord) -> bool {
        if let Some(start_timestamp) = self.start_timestamp {
            let timestamp = record.document.get_i64(fields::TIMESTAMP).unwrap_or(0);
            if timestamp < start_timestamp {
                return false;
            }
        }
        match (&self.matcher, record.document.get_doc(fields::EVENT)) {
            (Some(matcher), Some(event)) => matcher.subset_of(event),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}
