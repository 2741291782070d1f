//! The synchronous producer client.
//!
//! Blocking on the outside, asynchronous inside: the client owns a small
//! tokio runtime that drives one connection actor per broker, and each
//! public call parks the calling OS thread on a oneshot completion with a
//! deadline. Any number of caller threads can produce concurrently; calls
//! targeting partitions led by the same broker share that broker's single
//! connection.
//!
//! Public methods must not be called from inside an async context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::codec::Encoder;
use crate::config::{ProducerConfig, ProducerConfigBuilder};
use crate::error::{BrokerErrorCode, ClientError};
use crate::message_set::MessageSet;
use crate::metadata::MetadataCache;
use crate::metrics;
use crate::protocol::{
    api_key, BrokerIdentity, MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse,
};
use crate::Result;

/// Synchronous producer for a 0.8 wire-protocol broker cluster.
///
/// ```no_run
/// use kafsink::ProducerClient;
///
/// # fn main() -> kafsink::Result<()> {
/// let client = ProducerClient::connect("kafka-1:9092,kafka-2:9092")?;
/// let mut batch = client.message_set();
/// batch.push("payload", None)?;
/// let offset = client.produce("events", 0, &batch)?;
/// println!("batch landed at offset {offset}");
/// # Ok(())
/// # }
/// ```
pub struct ProducerClient {
    core: Arc<ClientCore>,
    runtime: parking_lot::Mutex<Option<tokio::runtime::Runtime>>,
}

impl ProducerClient {
    /// Connects a client to the given comma-separated `host[:port]` list
    /// with default configuration.
    pub fn connect(brokers: &str) -> Result<Self> {
        Self::builder().broker_list(brokers).build()
    }

    pub fn builder() -> ProducerClientBuilder {
        ProducerClientBuilder::default()
    }

    /// A fresh [`MessageSet`] with the configured compression kind and byte
    /// budget.
    pub fn message_set(&self) -> MessageSet {
        MessageSet::new(
            self.core.config.compression,
            self.core.config.max_message_size,
        )
    }

    /// Checks that a leader is known for the partition and reachable:
    /// refreshes metadata if needed, connects to the leader under the
    /// connect timeout.
    pub fn check_topic_partition_leader_available(
        &self,
        topic: &str,
        partition_id: i32,
    ) -> Result<()> {
        self.check_partition_leader(topic, partition_id).map(|_| ())
    }

    /// Like [`check_topic_partition_leader_available`] but reports the
    /// leader's node id. Exposed mostly so tests can observe leadership
    /// moves.
    ///
    /// [`check_topic_partition_leader_available`]:
    /// Self::check_topic_partition_leader_available
    pub fn check_partition_leader(&self, topic: &str, partition_id: i32) -> Result<i32> {
        self.block_on(self.core.check_leader(topic, partition_id))
    }

    /// Synchronously produces one batch to one partition and returns the
    /// base offset the broker assigned (-1 with `required_acks == 0`, where
    /// the broker sends no response and the call returns once the request
    /// is written).
    ///
    /// Blocks up to `produce_timeout + produce_timeout_rtt_allowance`. On
    /// timeout the request is abandoned but not revoked: the connection
    /// stays open and the late response is discarded. Leadership errors
    /// invalidate the cached leader before being returned; retrying is the
    /// caller's decision.
    pub fn produce(&self, topic: &str, partition_id: i32, messages: &MessageSet) -> Result<i64> {
        self.block_on(self.core.produce(topic, partition_id, messages))
    }

    /// Snapshot of the process-wide client counters.
    pub fn metrics(&self) -> metrics::MetricsSnapshot {
        metrics::global_metrics().snapshot()
    }

    /// Stops the client: closes every broker connection and shuts the
    /// runtime down. Idempotent. Calls made afterwards return
    /// [`ClientError::ClientStopping`].
    pub fn close(&self) {
        if self.core.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.core.brokers.iter() {
            entry.value().close();
        }
        self.core.brokers.clear();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(std::time::Duration::from_secs(1));
        }
        info!("producer client closed");
    }

    fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let handle = {
            let runtime = self.runtime.lock();
            match runtime.as_ref() {
                Some(runtime) => runtime.handle().clone(),
                None => return Err(ClientError::ClientStopping),
            }
        };
        handle.block_on(future)
    }
}

impl Drop for ProducerClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder for [`ProducerClient`]. Mirrors [`ProducerConfigBuilder`], then
/// spawns the runtime.
#[derive(Debug, Default)]
pub struct ProducerClientBuilder {
    config: ProducerConfigBuilder,
}

impl ProducerClientBuilder {
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.brokers(brokers);
        self
    }

    pub fn broker_list(mut self, brokers: &str) -> Self {
        self.config = self.config.broker_list(brokers);
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config = self.config.client_id(client_id);
        self
    }

    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config = self.config.connect_timeout(timeout);
        self
    }

    pub fn produce_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config = self.config.produce_timeout(timeout);
        self
    }

    pub fn produce_timeout_rtt_allowance(mut self, allowance: std::time::Duration) -> Self {
        self.config = self.config.produce_timeout_rtt_allowance(allowance);
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config = self.config.retry_attempts(attempts);
        self
    }

    pub fn required_acks(mut self, acks: i16) -> Self {
        self.config = self.config.required_acks(acks);
        self
    }

    pub fn compression(mut self, compression: crate::compression::CompressionType) -> Self {
        self.config = self.config.compression(compression);
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config = self.config.max_message_size(size);
        self
    }

    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config = self.config.io_threads(threads);
        self
    }

    pub fn build(self) -> Result<ProducerClient> {
        let config = self.config.build();

        let mut bootstrap = parse_broker_list(&config.brokers)?;
        // Spread metadata load across the configured brokers.
        bootstrap.shuffle(&mut rand::thread_rng());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("kafsink-io")
            .enable_all()
            .build()
            .map_err(|e| ClientError::bad_config(format!("failed to start runtime: {}", e)))?;

        Ok(ProducerClient {
            core: Arc::new(ClientCore {
                config,
                bootstrap,
                cache: MetadataCache::new(),
                brokers: DashMap::new(),
                meta_fetch: tokio::sync::Mutex::new(()),
                stopping: AtomicBool::new(false),
            }),
            runtime: parking_lot::Mutex::new(Some(runtime)),
        })
    }
}

struct ClientCore {
    config: ProducerConfig,
    /// Shuffled once at startup; node id 0, identities only.
    bootstrap: Vec<BrokerIdentity>,
    cache: MetadataCache,
    /// Live connections by node id.
    brokers: DashMap<i32, Arc<Broker>>,
    /// Serialises metadata fetches so concurrent callers share one.
    meta_fetch: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
}

impl ClientCore {
    async fn check_leader(&self, topic: &str, partition_id: i32) -> Result<i32> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ClientError::ClientStopping);
        }
        let (node_id, broker) = self.broker_for_partition(topic, partition_id).await?;
        match broker.wait_for_connect(self.config.connect_timeout).await {
            Ok(()) => Ok(node_id),
            Err(err) => {
                warn!(
                    "leader {} for {}[{}] unreachable: {}",
                    broker.identity(),
                    topic,
                    partition_id,
                    err
                );
                self.drop_broker(node_id, &broker);
                self.cache.invalidate_node(node_id);
                Err(err)
            }
        }
    }

    async fn produce(&self, topic: &str, partition_id: i32, messages: &MessageSet) -> Result<i64> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ClientError::ClientStopping);
        }
        if messages.is_empty() {
            return Err(ClientError::bad_config("message set is empty"));
        }

        let (node_id, broker) = self.broker_for_partition(topic, partition_id).await?;
        if let Err(err) = broker.wait_for_connect(self.config.connect_timeout).await {
            self.drop_broker(node_id, &broker);
            self.cache.invalidate_node(node_id);
            return Err(err);
        }

        let request = ProduceRequest {
            required_acks: self.config.required_acks,
            timeout_ms: self.config.produce_timeout.as_millis() as i32,
            topic,
            partition_id,
            messages,
        };
        let mut enc = Encoder::with_capacity(messages.encoded_size() + 64);
        request.encode(&mut enc)?;

        let expects_response = self.config.required_acks != 0;
        let completion = broker.call(api_key::PRODUCE, enc.into_bytes(), expects_response);

        let deadline = self.config.produce_timeout + self.config.produce_timeout_rtt_allowance;
        let mut decoder = match tokio::time::timeout(deadline, completion).await {
            Err(_) => {
                warn!(
                    "produce to {}[{}] timed out after {:?}; abandoning request",
                    topic, partition_id, deadline
                );
                metrics::global_metrics().record_send_error();
                return Err(ClientError::NetworkTimeout);
            }
            Ok(Err(_)) => {
                metrics::global_metrics().record_send_error();
                return Err(ClientError::network_fail("broker connection dropped"));
            }
            Ok(Ok(Err(err))) => {
                metrics::global_metrics().record_send_error();
                return Err(err);
            }
            Ok(Ok(Ok(decoder))) => decoder,
        };

        if !expects_response {
            // Fire and forget: acknowledged by the write completing.
            metrics::global_metrics().record_send(
                messages.len() as u64,
                messages.encoded_size() as u64,
            );
            return Ok(-1);
        }

        let response = ProduceResponse::decode(&mut decoder)?;
        let partition = response.partition(topic, partition_id).ok_or_else(|| {
            ClientError::encoding(format!(
                "produce response is missing {}[{}]",
                topic, partition_id
            ))
        })?;

        match BrokerErrorCode::from_code(partition.error_code) {
            None => {
                debug!(
                    "produced {} records to {}[{}] at offset {}",
                    messages.len(),
                    topic,
                    partition_id,
                    partition.offset
                );
                metrics::global_metrics().record_send(
                    messages.len() as u64,
                    messages.encoded_size() as u64,
                );
                Ok(partition.offset)
            }
            Some(code) => {
                if code.invalidates_metadata() {
                    warn!(
                        "produce to {}[{}] rejected by {} with {}; invalidating cached leader",
                        topic,
                        partition_id,
                        broker.identity(),
                        code
                    );
                    self.cache.invalidate(topic, partition_id);
                }
                metrics::global_metrics().record_send_error();
                Err(ClientError::Broker(code))
            }
        }
    }

    /// Resolves the partition's leader to a live broker handle, refreshing
    /// metadata once if the partition is unknown.
    async fn broker_for_partition(
        &self,
        topic: &str,
        partition_id: i32,
    ) -> Result<(i32, Arc<Broker>)> {
        let mut refreshed = false;
        loop {
            if let Some((node_id, identity)) = self.cache.leader_identity(topic, partition_id) {
                let broker = match self.brokers.entry(node_id) {
                    Entry::Occupied(mut entry) => {
                        if entry.get().is_closed() {
                            let fresh =
                                Arc::new(Broker::new(identity, self.config.client_id.clone()));
                            entry.insert(fresh.clone());
                            fresh
                        } else {
                            entry.get().clone()
                        }
                    }
                    Entry::Vacant(entry) => {
                        let fresh = Arc::new(Broker::new(identity, self.config.client_id.clone()));
                        entry.insert(fresh.clone());
                        fresh
                    }
                };
                return Ok((node_id, broker));
            }

            if refreshed {
                return Err(ClientError::Broker(BrokerErrorCode::UnknownTopicOrPartition));
            }
            self.refresh_metadata().await?;
            refreshed = true;
        }
    }

    /// Refreshes the metadata cache. Concurrent callers share one fetch: a
    /// caller that waited for the lock and finds the cache was refreshed
    /// after it started waiting reuses that result.
    async fn refresh_metadata(&self) -> Result<()> {
        let started = Instant::now();
        let _fetch = self.meta_fetch.lock().await;
        if let Some(at) = self.cache.last_refresh() {
            if at >= started {
                return Ok(());
            }
        }

        let mut last_err = ClientError::network_fail("no brokers reachable for metadata");
        for attempt in 0..=self.config.retry_attempts {
            match self.fetch_metadata_once().await {
                Ok(response) => {
                    let stale = self.cache.apply(&response);
                    for node_id in stale {
                        if let Some((_, broker)) = self.brokers.remove(&node_id) {
                            debug!("closing reconfigured broker node {}", node_id);
                            broker.close();
                        }
                    }
                    metrics::global_metrics().record_metadata_refresh();
                    return Ok(());
                }
                Err(err) => {
                    warn!("metadata fetch attempt {} failed: {}", attempt + 1, err);
                    last_err = err;
                }
            }
        }
        error!(
            "metadata refresh failed after {} attempts: {}",
            self.config.retry_attempts + 1,
            last_err
        );
        Err(last_err)
    }

    async fn fetch_metadata_once(&self) -> Result<MetadataResponse> {
        let (broker, node_id) = match self.any_live_broker() {
            Some((node_id, broker)) => (broker, Some(node_id)),
            None => (self.bootstrap_broker().await?, None),
        };

        let mut enc = Encoder::with_capacity(16);
        MetadataRequest::default().encode(&mut enc)?;
        let completion = broker.call(api_key::METADATA, enc.into_bytes(), true);

        // The connect timeout doubles as the metadata deadline: fetching
        // metadata is part of getting connected to the right node.
        let result = tokio::time::timeout(self.config.connect_timeout, completion).await;
        let outcome = match result {
            Err(_) => Err(ClientError::NetworkTimeout),
            Ok(Err(_)) => Err(ClientError::network_fail("broker connection dropped")),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Ok(Ok(mut decoder))) => Ok(MetadataResponse::decode(&mut decoder)?),
        };

        if outcome.is_err() {
            // Whatever went wrong, this connection is not worth keeping.
            match node_id {
                Some(node_id) => self.drop_broker(node_id, &broker),
                None => broker.close(),
            }
        }
        outcome
    }

    fn any_live_broker(&self) -> Option<(i32, Arc<Broker>)> {
        self.brokers
            .iter()
            .find(|entry| !entry.value().is_closed())
            .map(|entry| (*entry.key(), entry.value().clone()))
    }

    /// Walks the shuffled bootstrap list until one broker accepts a
    /// connection. The returned handle is temporary; it is dropped (and the
    /// connection with it) once the metadata fetch completes.
    async fn bootstrap_broker(&self) -> Result<Arc<Broker>> {
        for identity in &self.bootstrap {
            let broker = Arc::new(Broker::new(
                identity.clone(),
                self.config.client_id.clone(),
            ));
            match broker.wait_for_connect(self.config.connect_timeout).await {
                Ok(()) => return Ok(broker),
                Err(err) => {
                    warn!("bootstrap broker {} unavailable: {}", identity, err);
                    broker.close();
                }
            }
        }
        Err(ClientError::network_fail(
            "none of the configured brokers are reachable",
        ))
    }

    fn drop_broker(&self, node_id: i32, broker: &Arc<Broker>) {
        broker.close();
        self.brokers
            .remove_if(&node_id, |_, current| Arc::ptr_eq(current, broker));
    }
}

/// Parses `host[:port]` entries; the port defaults to 9092. Bootstrap
/// brokers get node id 0 until metadata names them.
fn parse_broker_list(brokers: &[String]) -> Result<Vec<BrokerIdentity>> {
    if brokers.is_empty() || brokers.iter().all(|b| b.trim().is_empty()) {
        return Err(ClientError::bad_config("broker list is empty"));
    }
    let mut out = Vec::with_capacity(brokers.len());
    for entry in brokers {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    ClientError::bad_config(format!("invalid port in broker address {:?}", entry))
                })?;
                (host, port as i32)
            }
            None => (entry, 9092),
        };
        if host.is_empty() {
            return Err(ClientError::bad_config(format!(
                "invalid broker address {:?}",
                entry
            )));
        }
        out.push(BrokerIdentity {
            node_id: 0,
            host: host.to_string(),
            port,
        });
    }
    Ok(out)
}
