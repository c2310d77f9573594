//! The public bus client: subscribe, publish, reconnect, event dispatch.

use sb_proto::Frame;
use std::collections::BTreeSet;
use std::env;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::connection::{ConnEvent, Connection, Link};
use crate::error::BusError;

/// Broker endpoint and retry policy.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// `host:port` of the broker.
    pub addr: String,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl BusConfig {
    pub fn new(addr: impl Into<String>) -> BusConfig {
        BusConfig {
            addr: addr.into(),
            reconnect_delay: Duration::from_secs(10),
        }
    }

    /// Read the broker endpoint from the environment.
    ///
    /// `INFRA_ADDR` wins; otherwise `INFRA_HOST` + `INFRA_PORT`; the
    /// default is `redis:6379`.  `INFRA_RECONNECT` is seconds.
    pub fn from_env() -> BusConfig {
        let addr = env::var("INFRA_ADDR").unwrap_or_else(|_| {
            let host = env::var("INFRA_HOST").unwrap_or_else(|_| "redis".to_owned());
            let port = env::var("INFRA_PORT").unwrap_or_else(|_| "6379".to_owned());
            format!("{host}:{port}")
        });
        let reconnect_delay = env::var("INFRA_RECONNECT")
            .ok()
            .and_then(|raw| raw.parse::<f64>().ok())
            .map_or(Duration::from_secs(10), Duration::from_secs_f64);
        BusConfig {
            addr,
            reconnect_delay,
        }
    }
}

/// Events delivered to the client owner.
#[derive(Debug)]
pub enum BusEvent {
    ConnectionMade { link: Link },
    ConnectionLost { link: Link },
    /// A pushed message on a subscribed channel; the payload is already a
    /// decoded string.
    ChannelMessage { channel: String, payload: String },
}

/// A connected bus client.
///
/// Cheap to clone; all clones share the two broker links.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: BusConfig,
    channels: Connection,
    main: Connection,
    subscribed: Mutex<BTreeSet<String>>,
}

impl BusClient {
    /// Create a client and its event receiver.  No connection is attempted
    /// until [`BusClient::start`].
    pub fn new(config: BusConfig) -> (BusClient, mpsc::UnboundedReceiver<BusEvent>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            channels: Connection::new(Link::Channels, false, conn_tx.clone()),
            main: Connection::new(Link::Main, true, conn_tx),
            subscribed: Mutex::new(BTreeSet::new()),
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), conn_rx, event_tx));
        (BusClient { inner }, event_rx)
    }

    /// Connect both links, retrying until they are up.
    pub async fn start(&self) -> Result<(), BusError> {
        for link in [Link::Channels, Link::Main] {
            loop {
                match self.connect_link(link).await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(%link, error = %err, "broker connect failed, retrying");
                        sleep(self.inner.config.reconnect_delay).await;
                    }
                }
            }
        }
        info!(addr = %self.inner.config.addr, "bus client connected");
        Ok(())
    }

    async fn connect_link(&self, link: Link) -> Result<(), BusError> {
        match link {
            Link::Channels => self.inner.channels.connect(&self.inner.config.addr).await,
            Link::Main => self.inner.main.connect(&self.inner.config.addr).await,
        }
    }

    /// Add `channel` to the desired set and subscribe if the link is up.
    ///
    /// Idempotent; the desired set is replayed after every reconnect.
    pub async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let inserted = self
            .inner
            .subscribed
            .lock()
            .expect("subscription set lock")
            .insert(channel.to_owned());
        if inserted {
            self.inner
                .channels
                .send_if_open(vec!["subscribe".to_owned(), channel.to_owned()])
                .await?;
        }
        Ok(())
    }

    /// Remove `channel` from the desired set and unsubscribe if the link
    /// is up.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let removed = self
            .inner
            .subscribed
            .lock()
            .expect("subscription set lock")
            .remove(channel);
        if removed {
            self.inner
                .channels
                .send_if_open(vec!["unsubscribe".to_owned(), channel.to_owned()])
                .await?;
        }
        Ok(())
    }

    /// Publish a payload to a channel.
    ///
    /// Queued FIFO while the command link is down; never silently dropped.
    /// The broker's receiver-count reply is consumed for correlation but
    /// not surfaced.
    pub async fn publish(
        &self,
        channel: &str,
        payload: impl Into<String>,
    ) -> Result<(), BusError> {
        let _reply = self
            .inner
            .main
            .send(vec![
                "publish".to_owned(),
                channel.to_owned(),
                payload.into(),
            ])
            .await?;
        Ok(())
    }

    /// Send a raw command on the main link and await its reply.
    pub async fn command<I, S>(&self, argv: I) -> Result<Frame, BusError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match self.inner.main.send(argv).await? {
            Some(reply) => reply.await.map_err(|_| BusError::ConnectionLost)?,
            None => Err(BusError::ConnectionLost),
        }
    }
}

/// Supervisor task: forwards events to the owner and restores lost links.
///
/// The channels link is always restored (and its subscriptions replayed)
/// before the main link flushes queued commands, so a queued publish can
/// never be observed ahead of a resubscription.
async fn supervise(
    inner: Weak<ClientInner>,
    mut conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    events: mpsc::UnboundedSender<BusEvent>,
) {
    let mut channels_down = false;
    let mut main_down = false;

    while let Some(event) = conn_rx.recv().await {
        let Some(client) = inner.upgrade() else {
            return;
        };

        match event {
            ConnEvent::Made(link) => {
                let _ = events.send(BusEvent::ConnectionMade { link });
            }
            ConnEvent::Push { channel, payload } => {
                let _ = events.send(BusEvent::ChannelMessage { channel, payload });
            }
            ConnEvent::Lost(link) => {
                warn!(%link, "broker link lost");
                let _ = events.send(BusEvent::ConnectionLost { link });
                match link {
                    Link::Channels => channels_down = true,
                    Link::Main => main_down = true,
                }
            }
        }

        while channels_down || main_down {
            sleep(client.config.reconnect_delay).await;
            if channels_down {
                match restore_channels(&client).await {
                    Ok(()) => channels_down = false,
                    Err(err) => {
                        warn!(error = %err, "channels link restore failed");
                        continue;
                    }
                }
            }
            if main_down {
                match restore_main(&client).await {
                    Ok(()) => main_down = false,
                    Err(err) => {
                        warn!(error = %err, "main link restore failed");
                        continue;
                    }
                }
            }
        }
    }
}

async fn restore_channels(client: &ClientInner) -> Result<(), BusError> {
    client.channels.connect(&client.config.addr).await?;

    let desired: Vec<String> = client
        .subscribed
        .lock()
        .expect("subscription set lock")
        .iter()
        .cloned()
        .collect();
    for channel in &desired {
        client
            .channels
            .send_if_open(vec!["subscribe".to_owned(), channel.clone()])
            .await?;
    }
    client.channels.flush_queue().await?;
    info!(channels = desired.len(), "channels link restored");
    Ok(())
}

async fn restore_main(client: &ClientInner) -> Result<(), BusError> {
    client.main.connect(&client.config.addr).await?;
    client.main.flush_queue().await?;
    info!("main link restored");
    Ok(())
}
