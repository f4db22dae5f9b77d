use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Delivery, Transport};
use crate::error::{EventBusError, Result};
use crate::event::Event;
use crate::pattern::{channel_name, is_wildcard};

const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

enum LoopExit {
    Stopped,
    Disconnected,
}

/// Redis pub/sub transport.
///
/// Events are published to `<prefix>.<type>`. Every subscription key owns a
/// dedicated pub/sub connection: exact keys use `SUBSCRIBE`, wildcard keys
/// `PSUBSCRIBE`. Received messages are decoded and dispatched to the
/// handlers registered under that key only. A listener whose connection
/// drops marks the transport disconnected and resubscribes with backoff.
pub struct RedisTransport {
    client: redis::Client,
    channel_prefix: String,
    publisher: Mutex<Option<ConnectionManager>>,
    connected: Arc<AtomicBool>,
    delivery: RwLock<Option<Delivery>>,
    listeners: tokio::sync::Mutex<HashMap<String, Listener>>,
}

impl RedisTransport {
    pub fn new(url: &str, channel_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EventBusError::Configuration(format!("invalid redis url {url}: {e}")))?;

        Ok(Self {
            client,
            channel_prefix: channel_prefix.to_string(),
            publisher: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            delivery: RwLock::new(None),
            listeners: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn channel_for(&self, key: &str) -> String {
        channel_name(&self.channel_prefix, key)
    }

    pub async fn active_listeners(&self) -> Vec<String> {
        self.listeners.lock().await.keys().cloned().collect()
    }

    /// Whether a live listener covers `key`. Entries whose task has ended
    /// are dropped so the key can be listened on again.
    pub async fn is_listening(&self, key: &str) -> bool {
        Self::covered(&mut *self.listeners.lock().await, key)
    }

    fn covered(listeners: &mut HashMap<String, Listener>, key: &str) -> bool {
        match listeners.get(key) {
            Some(listener) if !listener.task.is_finished() => true,
            Some(_) => {
                warn!(key = %key, "Replacing listener that exited unexpectedly");
                listeners.remove(key);
                false
            }
            None => false,
        }
    }

    async fn stop(key: &str, listener: Listener) -> Result<()> {
        // the receiver only disappears once the loop has already exited
        let _ = listener.stop.send(());
        listener
            .task
            .await
            .map_err(|e| EventBusError::Subscribe(format!("listener for {key} failed: {e}")))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn bind(&self, delivery: Delivery) {
        *self.delivery.write() = Some(delivery);
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        info!("Connecting to redis pub/sub");

        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| EventBusError::Connection(e.to_string()))?;
        *self.publisher.lock() = Some(manager);
        self.connected.store(true, Ordering::SeqCst);

        info!("Connected to redis pub/sub");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, event: &Event, payload: &[u8]) -> Result<usize> {
        let mut conn = self
            .publisher
            .lock()
            .clone()
            .ok_or_else(|| EventBusError::Publish("redis transport is not connected".into()))?;
        let channel = self.channel_for(event.event_type());

        let published: redis::RedisResult<i64> = conn.publish(&channel, payload).await;
        match published {
            Ok(receivers) => {
                self.connected.store(true, Ordering::SeqCst);
                debug!(channel = %channel, receivers, "Published to redis");
                Ok(usize::try_from(receivers).unwrap_or(0))
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                error!(channel = %channel, error = %e, "Redis publish failed");
                Err(EventBusError::Publish(e.to_string()))
            }
        }
    }

    async fn listen(&self, key: &str) -> Result<()> {
        let delivery = self
            .delivery
            .read()
            .clone()
            .ok_or_else(|| EventBusError::Subscribe("redis transport is not bound to a bus".into()))?;

        let mut listeners = self.listeners.lock().await;
        if Self::covered(&mut listeners, key) {
            return Ok(());
        }

        let channel = self.channel_for(key);
        let pubsub = open_pubsub(&self.client, key, &channel)
            .await
            .map_err(|e| EventBusError::Subscribe(format!("cannot subscribe to {channel}: {e}")))?;

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(listen_loop(
            ListenerContext {
                key: key.to_string(),
                channel: channel.clone(),
                client: self.client.clone(),
                delivery,
                connected: self.connected.clone(),
            },
            pubsub,
            stopped,
        ));
        listeners.insert(key.to_string(), Listener { stop, task });

        info!(key = %key, channel = %channel, "Listener started");
        Ok(())
    }

    async fn stop_listening(&self, key: &str) -> Result<()> {
        let listener = self.listeners.lock().await.remove(key);
        match listener {
            Some(listener) => Self::stop(key, listener).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(String, Listener)> = self.listeners.lock().await.drain().collect();
        let mut first_error = None;
        for (key, listener) in drained {
            if let Err(e) = Self::stop(&key, listener).await {
                warn!(key = %key, error = %e, "Listener did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }

        *self.publisher.lock() = None;
        self.connected.store(false, Ordering::SeqCst);
        info!("Redis transport shut down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn abort(&self) {
        if let Ok(mut listeners) = self.listeners.try_lock() {
            for (key, listener) in listeners.drain() {
                warn!(key = %key, "Aborting listener");
                listener.task.abort();
            }
        }
        *self.publisher.lock() = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

async fn open_pubsub(client: &redis::Client, key: &str, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    if is_wildcard(key) {
        pubsub.psubscribe(channel).await?;
    } else {
        pubsub.subscribe(channel).await?;
    }
    Ok(pubsub)
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(RECONNECT_MAX)
}

struct ListenerContext {
    key: String,
    channel: String,
    client: redis::Client,
    delivery: Delivery,
    connected: Arc<AtomicBool>,
}

async fn listen_loop(ctx: ListenerContext, mut pubsub: PubSub, mut stopped: oneshot::Receiver<()>) {
    loop {
        match pump(&ctx, &mut pubsub, &mut stopped).await {
            LoopExit::Stopped => break,
            LoopExit::Disconnected => {
                ctx.connected.store(false, Ordering::SeqCst);
                warn!(key = %ctx.key, channel = %ctx.channel, "Redis listener connection closed, resubscribing");
                match resubscribe(&ctx, &mut stopped).await {
                    Some(fresh) => pubsub = fresh,
                    None => {
                        info!(key = %ctx.key, channel = %ctx.channel, "Listener stopped while reconnecting");
                        return;
                    }
                }
            }
        }
    }

    let released = if is_wildcard(&ctx.key) {
        pubsub.punsubscribe(&ctx.channel).await
    } else {
        pubsub.unsubscribe(&ctx.channel).await
    };
    if let Err(e) = released {
        debug!(key = %ctx.key, error = %e, "Unsubscribe failed, dropping connection");
    }
    info!(key = %ctx.key, channel = %ctx.channel, "Listener stopped");
}

async fn pump(ctx: &ListenerContext, pubsub: &mut PubSub, stopped: &mut oneshot::Receiver<()>) -> LoopExit {
    let mut messages = Box::pin(pubsub.on_message());
    loop {
        tokio::select! {
            _ = &mut *stopped => return LoopExit::Stopped,
            message = messages.next() => {
                let Some(message) = message else {
                    return LoopExit::Disconnected;
                };
                match Event::from_bytes(message.get_payload_bytes()) {
                    Ok(event) => {
                        ctx.delivery.deliver_to_key(&ctx.key, &event).await;
                    }
                    Err(e) => {
                        warn!(key = %ctx.key, channel = %message.get_channel_name(), error = %e, "Dropping undecodable message");
                    }
                }
            }
        }
    }
}

/// Retry the subscription until it succeeds or the listener is stopped.
async fn resubscribe(ctx: &ListenerContext, stopped: &mut oneshot::Receiver<()>) -> Option<PubSub> {
    let mut backoff = RECONNECT_BASE;
    loop {
        tokio::select! {
            _ = &mut *stopped => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        match open_pubsub(&ctx.client, &ctx.key, &ctx.channel).await {
            Ok(pubsub) => {
                ctx.connected.store(true, Ordering::SeqCst);
                info!(key = %ctx.key, channel = %ctx.channel, "Listener resubscribed");
                return Some(pubsub);
            }
            Err(e) => {
                backoff = next_backoff(backoff);
                warn!(
                    key = %ctx.key,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Listener resubscribe failed"
                );
            }
        }
    }
}
