// Copyright (c) 2024 Botho Foundation

//! Assembly of one relay from its configuration.
//!
//! Which components run depends on the relay's position:
//!
//! | component | first | middle | last |
//! |---|---|---|---|
//! | [`ClientListener`] | yes | | |
//! | [`DownstreamLink`] | | yes | yes |
//! | [`UpstreamLink`] | yes | yes | |
//! | [`BatchMixer`] | yes | yes | yes |
//! | [`ReplySizer`] and [`ExitRunner`] | | | yes |
//!
//! A single relay cascade is both first and last.

use std::{io, net::SocketAddr, sync::Arc, thread::JoinHandle};
use thiserror::Error;
use tracing::{error, info};

use crate::{
    channel::ChannelRegistry,
    config::{Config, ConfigError},
    crypto::KeyExchange,
    metrics::{
        LinkMetricsSnapshot, ListenerMetricsSnapshot, SizingMetrics, SizingMetricsSnapshot,
    },
    mixing::{BatchMixer, Destination, ExitRunner, LoopbackDestination, ReplySizer},
    network::{ClientListener, DownstreamLink, LinkError, ListenerError, UpstreamLink},
    queue::{MixQueues, Shutdown},
};

/// Errors starting a relay.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration failed validation.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Client listener could not start.
    #[error("client listener: {0}")]
    Listener(#[from] ListenerError),

    /// Link to a neighbouring relay could not start.
    #[error("relay link: {0}")]
    Link(#[from] LinkError),

    /// A component thread could not be spawned.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Point-in-time view of a running relay.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// Live channels.
    pub channels: usize,
    /// Current request round.
    pub request_round: u64,
    /// Current reply round.
    pub reply_round: u64,
    /// Unprocessed requests, processed requests, unprocessed replies,
    /// processed replies.
    pub queue_depths: [usize; 4],
    /// Client listener counters (first relay only).
    pub listener: Option<ListenerMetricsSnapshot>,
    /// Counters of the edge to the next relay.
    pub upstream: Option<LinkMetricsSnapshot>,
    /// Counters of the edge from the previous relay.
    pub downstream: Option<LinkMetricsSnapshot>,
    /// Reply sizing counters (last relay only).
    pub sizing: Option<SizingMetricsSnapshot>,
    /// Edge to the next relay is up (`None` on the last relay).
    pub upstream_connected: Option<bool>,
    /// Edge from the previous relay is up (`None` on the first relay).
    pub downstream_connected: Option<bool>,
}

/// One running relay.
pub struct RelayNode {
    registry: Arc<ChannelRegistry>,
    queues: MixQueues,
    shutdown: Shutdown,
    listener: Option<ClientListener>,
    downstream: Option<DownstreamLink>,
    upstream: Option<UpstreamLink>,
    mixer: Option<BatchMixer>,
    sizer: Option<JoinHandle<()>>,
    sizing_metrics: Option<Arc<SizingMetrics>>,
    exit: Option<ExitRunner>,
}

impl RelayNode {
    /// Start a relay whose destination side echoes requests back.
    pub fn start(config: &Config, key_exchange: Arc<dyn KeyExchange>) -> Result<Self, NodeError> {
        Self::start_with_destination(config, key_exchange, Box::new(LoopbackDestination))
    }

    /// Start a relay, handing processed requests to `destination` when it
    /// is the last of the cascade.
    ///
    /// The edge from the previous relay is published before the edge to the
    /// next relay is fetched, so relays sharing one [`KeyExchange`] in a
    /// process may be started from the last to the first. Components that
    /// already run are stopped again when a later one fails.
    pub fn start_with_destination(
        config: &Config,
        key_exchange: Arc<dyn KeyExchange>,
        destination: Box<dyn Destination>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let mut node = Self {
            registry: Arc::new(ChannelRegistry::with_proxy_capacity(
                config.mixing.proxy_capacity,
            )),
            queues: MixQueues::new(config.mixing.queue_capacity, shutdown.clone()),
            shutdown,
            listener: None,
            downstream: None,
            upstream: None,
            mixer: None,
            sizer: None,
            sizing_metrics: None,
            exit: None,
        };

        if let Err(e) = node.spawn_components(config, key_exchange.as_ref(), destination) {
            error!(error = %e, "Relay failed to start");
            node.shutdown();
            return Err(e);
        }

        info!(
            previous_hops = config.cascade.previous_hops,
            further_hops = config.cascade.further_hops,
            "Relay started"
        );
        Ok(node)
    }

    fn spawn_components(
        &mut self,
        config: &Config,
        key_exchange: &dyn KeyExchange,
        destination: Box<dyn Destination>,
    ) -> Result<(), NodeError> {
        if !config.is_first() {
            self.downstream = Some(DownstreamLink::start(
                config.downstream_config()?,
                key_exchange,
                Arc::clone(&self.registry),
                self.queues.clone(),
                self.shutdown.clone(),
            )?);
        }

        self.mixer = Some(BatchMixer::start(
            config.mixer_config(),
            Arc::clone(&self.registry),
            self.queues.clone(),
        )?);

        if config.is_last() {
            let metrics = Arc::new(SizingMetrics::new());
            let sizer = ReplySizer::new(
                config.reply_sizing_config(),
                Arc::clone(&self.registry),
                self.queues.clone(),
                Arc::clone(&metrics),
            );
            self.sizer = Some(sizer.spawn(self.shutdown.clone())?);
            self.sizing_metrics = Some(metrics);
            self.exit = Some(ExitRunner::spawn(
                Arc::clone(&self.registry),
                self.queues.clone(),
                destination,
            )?);
        }

        if config.is_first() {
            self.listener = Some(ClientListener::start(
                config.listener_config()?,
                Arc::clone(&self.registry),
                self.queues.clone(),
                self.shutdown.clone(),
            )?);
        }

        if !config.is_last() {
            self.upstream = Some(UpstreamLink::start(
                config.upstream_config()?,
                key_exchange,
                Arc::clone(&self.registry),
                self.queues.clone(),
                self.shutdown.clone(),
            )?);
        }
        Ok(())
    }

    /// Address clients connect to (first relay only).
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ClientListener::local_addr)
    }

    /// Address the previous relay connects to (all but the first relay).
    pub fn downstream_addr(&self) -> Option<SocketAddr> {
        self.downstream.as_ref().map(DownstreamLink::local_addr)
    }

    /// Channel registry of this relay.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Shutdown signal shared by every component.
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Current counters and round state.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            channels: self.registry.len(),
            request_round: self.registry.request_round(),
            reply_round: self.registry.reply_round(),
            queue_depths: self.queues.depths(),
            listener: self.listener.as_ref().map(|l| l.metrics().snapshot()),
            upstream: self.upstream.as_ref().map(|u| u.metrics().snapshot()),
            downstream: self.downstream.as_ref().map(|d| d.metrics().snapshot()),
            sizing: self.sizing_metrics.as_ref().map(|m| m.snapshot()),
            upstream_connected: self.upstream.as_ref().map(UpstreamLink::is_connected),
            downstream_connected: self.downstream.as_ref().map(DownstreamLink::is_connected),
        }
    }

    /// Stop every component and join its threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.trigger();
        let running = self.mixer.is_some();

        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(upstream) = self.upstream.take() {
            upstream.stop();
        }
        if let Some(downstream) = self.downstream.take() {
            downstream.stop();
        }
        if let Some(mixer) = self.mixer.take() {
            mixer.stop();
        }
        if let Some(sizer) = self.sizer.take() {
            if sizer.join().is_err() {
                error!("Reply sizing thread panicked");
            }
        }
        if let Some(exit) = self.exit.take() {
            exit.stop();
        }
        if running {
            info!("Relay stopped");
        }
    }
}

impl Drop for RelayNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyExchange;

    fn local_config(previous_hops: u32, further_hops: u32) -> Config {
        let mut config = Config::new(previous_hops, further_hops, None);
        config.listener.bind_address = "127.0.0.1".to_string();
        config.listener.port = 0;
        config.downstream.listen = "127.0.0.1:0".to_string();
        config
    }

    #[test]
    fn test_single_relay_components() {
        let mut node =
            RelayNode::start(&local_config(0, 0), Arc::new(LocalKeyExchange::new())).unwrap();

        assert!(node.listener_addr().is_some());
        assert!(node.downstream_addr().is_none());

        let status = node.status();
        assert_eq!(status.channels, 0);
        assert!(status.listener.is_some());
        assert!(status.sizing.is_some());
        assert_eq!(status.upstream_connected, None);
        assert_eq!(status.downstream_connected, None);

        node.shutdown();
        assert!(node.shutdown_signal().is_triggered());
    }

    #[test]
    fn test_last_relay_has_no_listener() {
        let node =
            RelayNode::start(&local_config(1, 0), Arc::new(LocalKeyExchange::new())).unwrap();

        assert!(node.listener_addr().is_none());
        assert!(node.downstream_addr().is_some());
        assert_eq!(node.status().downstream_connected, Some(false));
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = local_config(0, 0);
        config.reply.weight = 2.0;
        assert!(matches!(
            RelayNode::start(&config, Arc::new(LocalKeyExchange::new())),
            Err(NodeError::Config(_))
        ));
    }
}
