use futures_util::StreamExt;
use redis::aio::PubSub;

use crate::error::StoreError;

/// A live subscription to a single store channel (spec.md §4.1: "subscribe(channel)
/// -> stream of bytes", used by C2 to broadcast ownership events and by C5 to
/// relay them to control-plane clients).
pub struct Subscription {
    pubsub: PubSub,
}

impl Subscription {
    pub(crate) fn new(pubsub: PubSub) -> Self {
        Self { pubsub }
    }

    /// Wait for the next published message on this channel. Returns `None`
    /// if the underlying connection is closed.
    pub async fn next_message(&mut self) -> Option<Vec<u8>> {
        self.pubsub.on_message().next().await.map(|msg| msg.get_payload_bytes().to_vec())
    }
}

pub async fn subscribe(redis_url: &str, channel: &str) -> Result<Subscription, StoreError> {
    let client = redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| StoreError::Command(e.to_string()))?;

    Ok(Subscription::new(pubsub))
}
