use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::shard::{sleep_until_opt, ShardCommand, ShardConnection, ShardHandle};
use super::socket::Connector;
use super::{GatewayConfig, GatewayEvent};

#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    Register { shard_id: u32, handle: ShardHandle },
    /// Append a shard to the back of the connect queue.
    Enqueue(u32),
    Shutdown,
}

/// Owns every shard of the process and paces their connects.
///
/// The connect queue and the concurrency map live on a single coordinator
/// task; shards talk to it only through messages.
pub struct ConnectionSupervisor {
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    coordinator: mpsc::UnboundedSender<SupervisorMessage>,
    shards: BTreeMap<u32, ShardHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    /// Build a supervisor and the receiving end of its event stream.
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (coordinator, coordinator_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let task = tokio::spawn(
            Coordinator {
                config: config.clone(),
                pending: VecDeque::new(),
                last_admitted: HashMap::new(),
                last_connect: None,
                shards: HashMap::new(),
            }
            .run(coordinator_rx),
        );
        let supervisor = Self {
            config,
            connector,
            events,
            coordinator,
            shards: BTreeMap::new(),
            tasks: vec![task],
        };
        (supervisor, events_rx)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Create shard `shard_id` and queue its first connect. Spawning a shard
    /// twice returns the existing handle.
    pub fn spawn(&mut self, shard_id: u32) -> ShardHandle {
        if let Some(handle) = self.shards.get(&shard_id) {
            return handle.clone();
        }
        if shard_id >= self.config.shard_count {
            tracing::warn!(
                shard_id,
                shard_count = self.config.shard_count,
                "shard id outside shard count, server will reject it"
            );
        }
        let (shard, handle) = ShardConnection::new(
            shard_id,
            self.config.clone(),
            self.connector.clone(),
            self.coordinator.clone(),
            self.events.clone(),
        );
        let _ = self.coordinator.send(SupervisorMessage::Register {
            shard_id,
            handle: handle.clone(),
        });
        let _ = self.coordinator.send(SupervisorMessage::Enqueue(shard_id));
        self.tasks.push(tokio::spawn(shard.run()));
        self.shards.insert(shard_id, handle.clone());
        handle
    }

    /// Spawn every shard in `range`, in order.
    pub fn spawn_range(&mut self, range: std::ops::RangeInclusive<u32>) -> Vec<ShardHandle> {
        range.map(|id| self.spawn(id)).collect()
    }

    pub fn shard(&self, shard_id: u32) -> Option<&ShardHandle> {
        self.shards.get(&shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardHandle> {
        self.shards.values()
    }

    /// Handle of the shard that receives events for `guild_id`, if this
    /// process runs it.
    pub fn shard_for_guild(&self, guild_id: &str) -> Option<&ShardHandle> {
        self.config
            .shard_for_guild(guild_id)
            .and_then(|id| self.shards.get(&id))
    }

    /// Cancel the connect queue, stop every shard and wait for their tasks.
    pub async fn shutdown(self) {
        let _ = self.coordinator.send(SupervisorMessage::Shutdown);
        for handle in self.shards.values() {
            let _ = handle.command(ShardCommand::Shutdown);
        }
        drop(self.coordinator);
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("gateway supervisor stopped");
    }
}

struct Coordinator {
    config: Arc<GatewayConfig>,
    pending: VecDeque<u32>,
    /// Concurrency bucket to the instant of its last admitted connect.
    last_admitted: HashMap<u32, Instant>,
    last_connect: Option<Instant>,
    shards: HashMap<u32, ShardHandle>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorMessage>) {
        let mut wake: Option<Instant> = None;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(SupervisorMessage::Register { shard_id, handle }) => {
                        self.shards.insert(shard_id, handle);
                    }
                    Some(SupervisorMessage::Enqueue(shard_id)) => {
                        if !self.pending.contains(&shard_id) {
                            self.pending.push_back(shard_id);
                            tracing::debug!(shard_id, queued = self.pending.len(), "shard queued for connect");
                        }
                    }
                    Some(SupervisorMessage::Shutdown) => {
                        self.pending.clear();
                        break;
                    }
                    // every shard and the supervisor are gone
                    None => break,
                },
                _ = sleep_until_opt(wake) => {}
            }
            wake = self.try_connect(Instant::now());
        }
        tracing::debug!("connect coordinator stopped");
    }

    /// Admit every queued shard whose concurrency bucket is open, in queue
    /// order. Returns when the next blocked shard could be admitted.
    fn try_connect(&mut self, now: Instant) -> Option<Instant> {
        let max_concurrency = self.config.max_concurrency.max(1);
        let spacing = self.config.identify_spacing;
        let mut wake: Option<Instant> = None;
        let mut blocked_buckets = Vec::new();
        let mut i = 0;

        while i < self.pending.len() {
            let shard_id = self.pending[i];
            let bucket = shard_id % max_concurrency;
            if blocked_buckets.contains(&bucket) {
                i += 1;
                continue;
            }

            let bucket_open = self.last_admitted.get(&bucket).map(|t| *t + spacing);
            let global_open = self.last_connect.map(|t| t + self.config.min_connect_delay);
            let open_at = match (bucket_open, global_open) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if let Some(at) = open_at.filter(|at| *at > now) {
                wake = Some(wake.map_or(at, |w| w.min(at)));
                blocked_buckets.push(bucket);
                i += 1;
                continue;
            }

            self.pending.remove(i);
            let Some(handle) = self.shards.get(&shard_id) else {
                tracing::warn!(shard_id, "dropping unknown shard from connect queue");
                continue;
            };
            if handle.command(ShardCommand::Connect).is_err() {
                tracing::debug!(shard_id, "shard gone before admission");
                self.shards.remove(&shard_id);
                continue;
            }
            tracing::info!(
                shard_id,
                bucket,
                remaining = self.pending.len(),
                "admitting shard connect"
            );
            self.last_admitted.insert(bucket, now);
            self.last_connect = Some(now);
        }

        wake
    }
}
