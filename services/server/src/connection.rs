// Per-connection protocol engine.
//
// Each connection is one task owning all of its protocol state. A reader
// task parses frames off the socket and posts them to the connection's
// mailbox; asynchronous completions (log appends, document lookups) are
// posted to the same mailbox instead of touching state from foreign tasks;
// a dedicated writer task owns the socket's write half and is the only code
// that writes to it. Plain maps are safe here because ownership makes
// off-context access unrepresentable.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use millrace_wire::{Document, FrameParser, decode_frame, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::protocol::{fields, frames};
use crate::query::QueryExecution;
use crate::serializer::ResponseSerializer;
use crate::server::ServerState;
use crate::subscription::{SubDescriptor, Subscription};

/// Everything that can land on a connection's mailbox.
pub(crate) enum ConnEvent {
    /// A parsed inbound record payload.
    Frame(Bytes),
    /// A completed response carrying its issue ordinal.
    Response { order: i64, buf: Bytes },
    /// A query execution delivered its last result.
    QueryFinished(i32),
    /// Peer closed the read side cleanly.
    ReadClosed,
    /// Reader failed: malformed frame or socket error.
    ReadError(anyhow::Error),
}

enum Flow {
    Continue,
    Close,
}

/// Accept-side entry point: wire up reader, writer, and the connection task.
pub(crate) async fn run_connection(
    server: Arc<ServerState>,
    stream: TcpStream,
    conn_id: u64,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let queue_depth = server.config.outbound_queue_depth;
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(queue_depth);
    let mut writer = tokio::spawn(run_writer_loop(write_half, outbound_rx));
    let (events_tx, mut events_rx) = mpsc::channel::<ConnEvent>(queue_depth);
    let reader = tokio::spawn(run_reader_loop(
        read_half,
        events_tx.clone(),
        server.config.max_frame_bytes,
    ));

    let drain_timeout = std::time::Duration::from_millis(server.config.writer_drain_timeout_ms);
    let mut connection = Connection {
        server,
        conn_id,
        outbound: outbound_tx,
        events: events_tx,
        authorised: false,
        sub_seq: 0,
        write_seq: 0,
        serializer: ResponseSerializer::new(),
        subscriptions: HashMap::new(),
        queries: HashMap::new(),
    };
    let result = connection.run(&mut events_rx).await;
    connection.teardown();
    reader.abort();
    drop(connection);
    // Give the writer a bounded window to flush what is already queued; a
    // peer that stopped reading must not pin the connection task forever.
    if tokio::time::timeout(drain_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    result
}

/// Read raw bytes, feed the frame parser, post complete frames.
async fn run_reader_loop(
    mut read: OwnedReadHalf,
    events: mpsc::Sender<ConnEvent>,
    max_frame_bytes: usize,
) {
    let mut parser = FrameParser::new(max_frame_bytes);
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        buf.clear();
        match read.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(ConnEvent::ReadClosed).await;
                return;
            }
            Ok(_) => {
                parser.extend(&buf);
                loop {
                    match parser.next_frame() {
                        Ok(Some(payload)) => {
                            metrics::counter!("millrace_frames_in_total").increment(1);
                            if events.send(ConnEvent::Frame(payload)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = events.send(ConnEvent::ReadError(err.into())).await;
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                let _ = events.send(ConnEvent::ReadError(err.into())).await;
                return;
            }
        }
    }
}

/// Single writer: drains outbound buffers onto the socket.
async fn run_writer_loop(mut write: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(buf) = outbound.recv().await {
        if let Err(err) = write.write_all(&buf).await {
            tracing::info!(error = %err, "connection write side closed");
            break;
        }
        metrics::counter!("millrace_frames_out_total").increment(1);
    }
    let _ = write.shutdown().await;
}

struct Connection {
    server: Arc<ServerState>,
    conn_id: u64,
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::Sender<ConnEvent>,
    authorised: bool,
    sub_seq: i32,
    write_seq: i64,
    serializer: ResponseSerializer,
    subscriptions: HashMap<i32, Subscription>,
    queries: HashMap<i32, QueryExecution>,
}

impl Connection {
    async fn run(&mut self, events: &mut mpsc::Receiver<ConnEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            match event {
                ConnEvent::Frame(payload) => {
                    let (kind, body) = match decode_frame(payload) {
                        Ok(frame) => frame,
                        Err(err) => {
                            self.fatal(&format!("undecodable frame: {err}"));
                            break;
                        }
                    };
                    match self.dispatch(&kind, body).await? {
                        Flow::Continue => {}
                        Flow::Close => break,
                    }
                }
                ConnEvent::Response { order, buf } => match self.submit_ordered(order, buf).await?
                {
                    Flow::Continue => {}
                    Flow::Close => break,
                },
                ConnEvent::QueryFinished(query_id) => {
                    self.queries.remove(&query_id);
                }
                ConnEvent::ReadClosed => break,
                ConnEvent::ReadError(err) => {
                    self.fatal(&format!("read failed: {err}"));
                    break;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, kind: &str, frame: Document) -> Result<Flow> {
        // Only CONNECT is valid before authorisation; anything else is a
        // protocol violation that closes the connection.
        if kind != frames::CONNECT && !self.authorised {
            tracing::error!(conn_id = self.conn_id, "attempt to use unauthorised connection");
            return Ok(Flow::Close);
        }
        match kind {
            frames::CONNECT => self.handle_connect().await,
            frames::PUBLISH => self.handle_publish(frame).await,
            frames::SUBSCRIBE => self.handle_subscribe(frame).await,
            frames::SUBCLOSE => self.handle_close_unsubscribe(frame, false).await,
            frames::UNSUBSCRIBE => self.handle_close_unsubscribe(frame, true).await,
            frames::ACKEV => self.handle_ack_ev(frame),
            frames::QUERY => self.handle_query(frame).await,
            frames::QUERYACK => self.handle_query_ack(frame),
            frames::PING => Ok(Flow::Continue),
            frames::STARTTX | frames::COMMITTX | frames::ABORTTX => {
                // Reserved: accepted but not implemented.
                Ok(Flow::Continue)
            }
            other => Ok(self.fatal(&format!("unknown frame kind {other}"))),
        }
    }

    async fn handle_connect(&mut self) -> Result<Flow> {
        // TODO auth: all CONNECTs are accepted until the auth provider lands.
        self.authorised = true;
        let order = self.next_write_seq()?;
        self.write_response(
            frames::RESPONSE,
            Document::new().put(fields::OK, true),
            order,
        )
        .await
    }

    async fn handle_publish(&mut self, frame: Document) -> Result<Flow> {
        let Some(channel) = frame.get_str(fields::CHANNEL) else {
            return Ok(self.fatal("no channel in PUBLISH"));
        };
        let Some(event) = frame.get_doc(fields::EVENT) else {
            return Ok(self.fatal("no event in PUBLISH"));
        };
        let order = self.next_write_seq()?;
        let record = Document::new()
            .put(fields::TIMESTAMP, now_millis())
            .put(fields::EVENT, event.clone());
        let channel = channel.to_string();
        let server = Arc::clone(&self.server);
        let events = self.events.clone();
        // Completion returns to this connection's mailbox at the ordinal
        // assigned above, whatever order persistence finishes in.
        tokio::spawn(async move {
            let appended = async { server.logs.open(&channel).await?.append(&record).await };
            let response = match appended.await {
                Ok(_) => Document::new().put(fields::OK, true),
                Err(err) => {
                    tracing::error!(channel = %channel, error = %err, "append failed");
                    Document::new()
                        .put(fields::OK, false)
                        .put(fields::ERRMSG, "Failed to persist")
                }
            };
            let buf = encode_frame(frames::RESPONSE, &response);
            let _ = events.send(ConnEvent::Response { order, buf }).await;
        });
        Ok(Flow::Continue)
    }

    async fn handle_subscribe(&mut self, frame: Document) -> Result<Flow> {
        let Some(channel) = frame.get_str(fields::CHANNEL) else {
            return Ok(self.fatal("no channel in SUBSCRIBE"));
        };
        let descriptor = SubDescriptor {
            channel: channel.to_string(),
            start_pos: frame.get_i64(fields::STARTPOS).unwrap_or(-1),
            start_timestamp: frame.get_i64(fields::STARTTIMESTAMP),
            matcher: frame.get_doc(fields::MATCHER).cloned(),
            durable_id: frame.get_str(fields::DURABLEID).map(str::to_string),
        };
        let sub_id = self.next_sub_seq()?;
        let Some(log) = self.server.logs.get(channel).await else {
            return Ok(self.fatal(&format!("no such channel {channel}")));
        };
        let subscription = Subscription::start(
            log,
            descriptor,
            sub_id,
            self.outbound.clone(),
            self.server.config.sub_initial_credit,
            Arc::clone(&self.server.durable),
        )
        .await?;
        self.subscriptions.insert(sub_id, subscription);
        tracing::trace!(conn_id = self.conn_id, channel = %channel, sub_id, "subscribed");
        let order = self.next_write_seq()?;
        self.write_response(
            frames::SUBRESPONSE,
            Document::new().put(fields::OK, true).put(fields::SUBID, sub_id),
            order,
        )
        .await
    }

    async fn handle_close_unsubscribe(
        &mut self,
        frame: Document,
        unsubscribe: bool,
    ) -> Result<Flow> {
        let Some(sub_id) = frame.get_i32(fields::SUBID) else {
            return Ok(self.fatal("no subID in UNSUBSCRIBE"));
        };
        let Some(subscription) = self.subscriptions.remove(&sub_id) else {
            return Ok(self.fatal("invalid subID in UNSUBSCRIBE"));
        };
        if unsubscribe {
            subscription.unsubscribe();
        } else {
            subscription.close();
        }
        let order = self.next_write_seq()?;
        self.write_response(
            frames::RESPONSE,
            Document::new().put(fields::OK, true),
            order,
        )
        .await
    }

    fn handle_ack_ev(&mut self, frame: Document) -> Result<Flow> {
        let Some(sub_id) = frame.get_i32(fields::SUBID) else {
            return Ok(self.fatal("no subID in ACKEV"));
        };
        let Some(bytes) = frame.get_i32(fields::BYTES) else {
            return Ok(self.fatal("no bytes in ACKEV"));
        };
        let Some(pos) = frame.get_i64(fields::POS) else {
            return Ok(self.fatal("no pos in ACKEV"));
        };
        let Some(subscription) = self.subscriptions.get(&sub_id) else {
            return Ok(self.fatal("invalid subID in ACKEV"));
        };
        subscription.ack(pos, bytes);
        Ok(Flow::Continue)
    }

    async fn handle_query(&mut self, frame: Document) -> Result<Flow> {
        let Some(query_id) = frame.get_i32(fields::QUERYID) else {
            return Ok(self.fatal("no queryID in QUERY"));
        };
        if let Some(doc_id) = frame.get_str(fields::DOCID) {
            // Query by id: a single result, flagged last.
            let Some(binder) = frame.get_str(fields::BINDER) else {
                return Ok(self.fatal("no binder in QUERY"));
            };
            let binder = binder.to_string();
            let doc_id = doc_id.to_string();
            let server = Arc::clone(&self.server);
            let outbound = self.outbound.clone();
            tokio::spawn(async move {
                let result = server.docs.get(&binder, &doc_id).await.unwrap_or_default();
                let frame = encode_frame(
                    frames::QUERYRESULT,
                    &Document::new()
                        .put(fields::QUERYID, query_id)
                        .put(fields::RESULT, result)
                        .put(fields::LAST, true),
                );
                let _ = outbound.send(frame).await;
            });
            return Ok(Flow::Continue);
        }
        let Some(name) = frame.get_str(fields::NAME) else {
            return Ok(self.fatal("no docID or name in QUERY"));
        };
        let Some(info) = self.server.queries.get(name) else {
            return Ok(self.fatal(&format!("no such query {name}")));
        };
        let params = frame.get_doc(fields::PARAMS).cloned().unwrap_or_default();
        let stream = self.server.docs.open_stream(&info.binder).await;
        let execution = QueryExecution::start(
            query_id,
            stream,
            params,
            info.filter,
            self.outbound.clone(),
            self.events.clone(),
            self.server.config.query_initial_credit,
        );
        self.queries.insert(query_id, execution);
        Ok(Flow::Continue)
    }

    fn handle_query_ack(&mut self, frame: Document) -> Result<Flow> {
        let Some(query_id) = frame.get_i32(fields::QUERYID) else {
            return Ok(self.fatal("no queryID in QUERYACK"));
        };
        let Some(bytes) = frame.get_i32(fields::BYTES) else {
            return Ok(self.fatal("no bytes in QUERYACK"));
        };
        // The execution may already have delivered its last result.
        if let Some(execution) = self.queries.get(&query_id) {
            execution.ack(bytes);
        }
        Ok(Flow::Continue)
    }

    async fn write_response(&mut self, kind: &str, body: Document, order: i64) -> Result<Flow> {
        let buf = encode_frame(kind, &body);
        self.submit_ordered(order, buf).await
    }

    async fn submit_ordered(&mut self, order: i64, buf: Bytes) -> Result<Flow> {
        for ready in self.serializer.submit(order, buf)? {
            if self.outbound.send(ready).await.is_err() {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    fn next_write_seq(&mut self) -> Result<i64> {
        bump_write_seq(&mut self.write_seq)
    }

    fn next_sub_seq(&mut self) -> Result<i32> {
        bump_sub_seq(&mut self.sub_seq)
    }

    fn fatal(&self, reason: &str) -> Flow {
        tracing::warn!(conn_id = self.conn_id, "{reason}. connection will be closed");
        metrics::counter!("millrace_conn_fatal_total").increment(1);
        Flow::Close
    }

    fn teardown(&mut self) {
        self.authorised = false;
        // Subscriptions stop delivering; durable cursors survive.
        for (_, subscription) in self.subscriptions.drain() {
            subscription.close();
        }
        for (_, execution) in self.queries.drain() {
            execution.close();
        }
        self.server.remove_connection(self.conn_id);
    }
}

// Sanity checks: wrap around won't happen in practice, but closing the
// connection beats silently reusing ordinals.
fn bump_write_seq(seq: &mut i64) -> Result<i64> {
    let value = *seq;
    *seq = seq.wrapping_add(1);
    if *seq == i64::MIN {
        return Err(anyhow!("long wrapped!"));
    }
    Ok(value)
}

fn bump_sub_seq(seq: &mut i32) -> Result<i32> {
    let value = *seq;
    *seq = seq.wrapping_add(1);
    if *seq == i32::MIN {
        return Err(anyhow!("int wrapped!"));
    }
    Ok(value)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
