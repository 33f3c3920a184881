use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use chrono::Utc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

use valve_common::{CommandPublisher, DispatchConfig, InboundMessage, MessageRouter, ValveStore};

/// Fans inbound messages out to shard workers keyed by valve id. One valve
/// always lands on the same shard, so its messages apply in arrival order;
/// different shards run in parallel.
pub struct Dispatcher {
    shards: Vec<mpsc::Sender<InboundMessage>>,
}

impl Dispatcher {
    pub fn spawn<S, P>(
        router: MessageRouter<S, P>,
        config: &DispatchConfig,
    ) -> (Self, Vec<JoinHandle<()>>)
    where
        S: ValveStore + 'static,
        P: CommandPublisher + 'static,
    {
        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);

        for index in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            shards.push(tx);
            handles.push(tokio::spawn(run_shard(index, router.clone(), rx)));
        }

        (Self { shards }, handles)
    }

    pub fn shard_for(&self, valve_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        valve_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Never waits. A full shard queue drops the message so the transport
    /// loop keeps polling; returns false when the message was dropped.
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        let shard = self.shard_for(message.valve_id());
        match self.shards[shard].try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(shard, valve_id = message.valve_id(), "shard queue full, message dropped");
                false
            }
            Err(TrySendError::Closed(message)) => {
                warn!(shard, valve_id = message.valve_id(), "shard stopped, message dropped");
                false
            }
        }
    }
}

async fn run_shard<S, P>(
    index: usize,
    router: MessageRouter<S, P>,
    mut rx: mpsc::Receiver<InboundMessage>,
) where
    S: ValveStore + 'static,
    P: CommandPublisher + 'static,
{
    while let Some(message) = rx.recv().await {
        let router = router.clone();
        // Store calls block on file I/O.
        let applied = tokio::task::spawn_blocking(move || router.apply(message, Utc::now())).await;
        if let Err(err) = applied {
            warn!(shard = index, "message handler panicked: {err}");
        }
    }
    debug!(shard = index, "dispatch shard stopped");
}
