//! In-process mock broker.
//!
//! Speaks the wire protocol over real TCP: per-connection subscription
//! sets, `publish` fan-out as `["message", channel, payload]` pushes, and
//! one reply per command.  `drop_connections` severs every socket so
//! reconnect behavior can be exercised.

use futures_util::{SinkExt, StreamExt};
use sb_proto::{Frame, WireCodec};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

#[derive(Default)]
struct BrokerState {
    next_conn: AtomicU64,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    published: Mutex<Vec<(String, String)>>,
}

struct ConnHandle {
    outbound: mpsc::UnboundedSender<Frame>,
    subscriptions: HashSet<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockBroker {
    /// Bind on an ephemeral port and start accepting connections.
    pub async fn start() -> std::io::Result<MockBroker> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(BrokerState::default());

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                debug!(%peer, "mock broker connection");
                accept_conn(&accept_state, stream);
            }
        });

        Ok(MockBroker {
            addr,
            state,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form for client configs.
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn connection_count(&self) -> usize {
        self.state.conns.lock().expect("broker state lock").len()
    }

    /// How many live connections are subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .conns
            .lock()
            .expect("broker state lock")
            .values()
            .filter(|conn| conn.subscriptions.contains(channel))
            .count()
    }

    /// Every `(channel, payload)` publish observed, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .published
            .lock()
            .expect("broker state lock")
            .clone()
    }

    /// Sever every live connection; subscriptions die with them.
    pub fn drop_connections(&self) {
        let handles: Vec<ConnHandle> = self
            .state
            .conns
            .lock()
            .expect("broker state lock")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            for task in handle.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

fn accept_conn(state: &Arc<BrokerState>, stream: TcpStream) {
    let id = state.next_conn.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut read) = tokio_util::codec::Framed::new(stream, WireCodec).split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(frame).await.is_err() {
                return;
            }
        }
    });

    let reader_state = Arc::clone(state);
    let reader = tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(frame) => handle_command(&reader_state, id, frame),
                Err(_) => break,
            }
        }
        reader_state
            .conns
            .lock()
            .expect("broker state lock")
            .remove(&id);
    });

    state.conns.lock().expect("broker state lock").insert(
        id,
        ConnHandle {
            outbound,
            subscriptions: HashSet::new(),
            tasks: vec![writer, reader],
        },
    );
}

fn handle_command(state: &Arc<BrokerState>, id: u64, frame: Frame) {
    let Some(argv) = as_argv(&frame) else {
        reply(state, id, Frame::Error("ERR expected command array".to_owned()));
        return;
    };
    let Some((command, args)) = argv.split_first() else {
        reply(state, id, Frame::Error("ERR empty command".to_owned()));
        return;
    };

    match command.to_lowercase().as_str() {
        "subscribe" => {
            for channel in args {
                let mut conns = state.conns.lock().expect("broker state lock");
                let Some(conn) = conns.get_mut(&id) else {
                    return;
                };
                conn.subscriptions.insert(channel.clone());
                let count = conn.subscriptions.len() as i64;
                let _ = conn.outbound.send(Frame::Array(Some(vec![
                    Frame::Bulk(Some("subscribe".to_owned())),
                    Frame::Bulk(Some(channel.clone())),
                    Frame::Integer(count),
                ])));
            }
        }
        "unsubscribe" => {
            for channel in args {
                let mut conns = state.conns.lock().expect("broker state lock");
                let Some(conn) = conns.get_mut(&id) else {
                    return;
                };
                conn.subscriptions.remove(channel);
                let count = conn.subscriptions.len() as i64;
                let _ = conn.outbound.send(Frame::Array(Some(vec![
                    Frame::Bulk(Some("unsubscribe".to_owned())),
                    Frame::Bulk(Some(channel.clone())),
                    Frame::Integer(count),
                ])));
            }
        }
        "publish" => {
            let (channel, payload) = match args {
                [channel, payload] => (channel.clone(), payload.clone()),
                _ => {
                    reply(
                        state,
                        id,
                        Frame::Error("ERR publish takes channel and payload".to_owned()),
                    );
                    return;
                }
            };
            state
                .published
                .lock()
                .expect("broker state lock")
                .push((channel.clone(), payload.clone()));

            let mut receivers = 0;
            {
                let conns = state.conns.lock().expect("broker state lock");
                for conn in conns.values() {
                    if conn.subscriptions.contains(&channel) {
                        let push = Frame::command(["message", channel.as_str(), payload.as_str()]);
                        if conn.outbound.send(push).is_ok() {
                            receivers += 1;
                        }
                    }
                }
            }
            reply(state, id, Frame::Integer(receivers));
        }
        "ping" => reply(state, id, Frame::Simple("PONG".to_owned())),
        _ => reply(state, id, Frame::Simple("OK".to_owned())),
    }
}

fn reply(state: &Arc<BrokerState>, id: u64, frame: Frame) {
    let conns = state.conns.lock().expect("broker state lock");
    if let Some(conn) = conns.get(&id) {
        let _ = conn.outbound.send(frame);
    }
}

fn as_argv(frame: &Frame) -> Option<Vec<String>> {
    let Frame::Array(Some(items)) = frame else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            Frame::Bulk(Some(text)) | Frame::Simple(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}
