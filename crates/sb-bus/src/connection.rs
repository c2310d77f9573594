//! A single framed TCP link to the broker.
//!
//! The link tracks an epoch so a read task that outlives its socket cannot
//! clobber the state of a newer connection.  Commands sent while the socket
//! is down are queued FIFO; the owner decides when to flush (after
//! subscription replay on the channels link).

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sb_proto::{Frame, WireCodec};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::BusError;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Which of the two broker links an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Subscription link; receives pushed channel messages.
    Channels,
    /// Command link; replies are correlated FIFO with sends.
    Main,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Channels => f.write_str("channels"),
            Link::Main => f.write_str("main"),
        }
    }
}

/// Internal events a connection reports to the client supervisor.
pub(crate) enum ConnEvent {
    Made(Link),
    Lost(Link),
    Push { channel: String, payload: String },
}

pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Frame, BusError>>;
type ReplySlot = oneshot::Sender<Result<Frame, BusError>>;
type FrameSink = SplitSink<Framed<TcpStream, WireCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, WireCodec>>;

pub(crate) struct Connection {
    link: Link,
    /// Whether every send on this link enqueues a reply slot.
    correlate_replies: bool,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<ConnEvent>,
}

struct Inner {
    sink: Option<FrameSink>,
    epoch: u64,
    replies: VecDeque<ReplySlot>,
    queue: VecDeque<(Vec<String>, Option<ReplySlot>)>,
}

impl Connection {
    pub(crate) fn new(
        link: Link,
        correlate_replies: bool,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Connection {
        Connection {
            link,
            correlate_replies,
            inner: Arc::new(Mutex::new(Inner {
                sink: None,
                epoch: 0,
                replies: VecDeque::new(),
                queue: VecDeque::new(),
            })),
            events,
        }
    }

    /// Establish the TCP link and spawn its read task.
    ///
    /// Does not flush the offline queue; the owner sequences that against
    /// subscription replay.
    pub(crate) async fn connect(&self, addr: &str) -> Result<(), BusError> {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(BusError::ConnectTimeout {
                    addr: addr.to_owned(),
                    timeout: CONNECT_TIMEOUT,
                })
            }
            Ok(connected) => connected?,
        };
        let (sink, read) = Framed::new(stream, WireCodec).split();

        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.sink = Some(sink);
            inner.epoch
        };
        tokio::spawn(read_loop(
            read,
            self.link,
            self.correlate_replies,
            epoch,
            Arc::clone(&self.inner),
            self.events.clone(),
        ));
        let _ = self.events.send(ConnEvent::Made(self.link));
        Ok(())
    }

    /// Send a command, queueing it if the link is down.
    ///
    /// On a correlated link the returned receiver resolves with the reply
    /// matching this command's position in the send order.
    pub(crate) async fn send(&self, argv: Vec<String>) -> Result<Option<ReplyReceiver>, BusError> {
        let (slot, receiver) = if self.correlate_replies {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut inner = self.inner.lock().await;
        if inner.sink.is_some() {
            inner.write(argv, slot).await?;
        } else {
            inner.queue.push_back((argv, slot));
        }
        Ok(receiver)
    }

    /// Send a command only if the link is currently up; never queues.
    pub(crate) async fn send_if_open(&self, argv: Vec<String>) -> Result<(), BusError> {
        let mut inner = self.inner.lock().await;
        if inner.sink.is_some() {
            inner.write(argv, None).await?;
        }
        Ok(())
    }

    /// Flush every command queued while the link was down, in order.
    pub(crate) async fn flush_queue(&self) -> Result<(), BusError> {
        let mut inner = self.inner.lock().await;
        while let Some((argv, slot)) = inner.queue.pop_front() {
            inner.write(argv, slot).await?;
        }
        Ok(())
    }
}

impl Inner {
    async fn write(&mut self, argv: Vec<String>, slot: Option<ReplySlot>) -> Result<(), BusError> {
        if let Some(slot) = slot {
            self.replies.push_back(slot);
        }
        if let Some(sink) = self.sink.as_mut() {
            // A write failure leaves the slot in the FIFO; the read task
            // fails it with ConnectionLost when the link drops.
            sink.send(Frame::command(argv)).await?;
        }
        Ok(())
    }
}

async fn read_loop(
    mut read: FrameStream,
    link: Link,
    correlate_replies: bool,
    epoch: u64,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    loop {
        match read.next().await {
            Some(Ok(frame)) => {
                if correlate_replies {
                    let slot = inner.lock().await.replies.pop_front();
                    match slot {
                        Some(slot) => {
                            let _ = slot.send(Ok(frame));
                        }
                        None => warn!(%link, ?frame, "unsolicited broker reply"),
                    }
                } else if let Some((channel, payload)) = frame.as_channel_message() {
                    let _ = events.send(ConnEvent::Push {
                        channel: channel.to_owned(),
                        payload: payload.to_owned(),
                    });
                } else {
                    // Subscription confirmations and the like.
                    debug!(%link, ?frame, "ignoring non-push frame");
                }
            }
            Some(Err(err)) => {
                warn!(%link, error = %err, "broker link read error");
                break;
            }
            None => break,
        }
    }

    let mut guard = inner.lock().await;
    if guard.epoch != epoch {
        // A newer connection took over; nothing to clean up.
        return;
    }
    guard.sink = None;
    for slot in guard.replies.drain(..) {
        let _ = slot.send(Err(BusError::ConnectionLost));
    }
    drop(guard);
    let _ = events.send(ConnEvent::Lost(link));
}
