// Copyright (c) 2024 Botho Foundation

//! Consumer of mixed requests on the last relay.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

use crate::{
    channel::{Channel, ChannelId, ChannelRegistry},
    message::MixMessage,
    queue::MixQueues,
};

/// Destination-facing side of the last relay.
///
/// Implementations read client data from the channel's proxy request buffer
/// and write destination data into its proxy reply buffer; the reply sizing
/// decision returns the latter to the client.
pub trait Destination: Send {
    /// A mixed request payload arrived for `channel`.
    fn deliver(&mut self, channel: &Channel, payload: &[u8]);

    /// The channel was released.
    fn release(&mut self, _channel: ChannelId) {}
}

/// Destination that echoes every request back to its channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackDestination;

impl Destination for LoopbackDestination {
    fn deliver(&mut self, channel: &Channel, payload: &[u8]) {
        let accepted = channel.push_request_data(payload);
        let data = channel.drain_request_data();
        let echoed = channel.push_reply_data(&data);
        if accepted < payload.len() || echoed < data.len() {
            warn!(channel = %channel.id(), "Proxy buffer full, data truncated");
        }
    }
}

/// Thread draining processed requests into a [`Destination`].
#[derive(Debug)]
pub struct ExitRunner {
    handle: JoinHandle<()>,
}

impl ExitRunner {
    /// Spawn the exit thread.
    pub fn spawn(
        registry: Arc<ChannelRegistry>,
        queues: MixQueues,
        mut destination: Box<dyn Destination>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("exit".to_string())
            .spawn(move || {
                while let Ok(msg) = queues.next_processed_request() {
                    match msg {
                        MixMessage::ChannelEstablish { channel, payload }
                        | MixMessage::ChannelMessage { channel, payload } => {
                            match registry.lookup(channel) {
                                Ok(ch) => destination.deliver(&ch, &payload),
                                Err(e) => debug!(error = %e, "Request for released channel dropped"),
                            }
                        }
                        MixMessage::ChannelRelease { channel } => destination.release(channel),
                        MixMessage::BatchSize { .. } => {}
                        MixMessage::Reply { channel, .. } => {
                            warn!(%channel, "Reply in the request queue, dropped")
                        }
                    }
                }
                debug!("Exit runner stopped");
            })?;
        Ok(Self { handle })
    }

    /// Join the thread once the shutdown signal has fired.
    pub fn stop(self) {
        if self.handle.join().is_err() {
            warn!("Exit thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Shutdown;
    use std::time::{Duration, Instant};

    #[test]
    fn test_loopback_echoes_into_reply_buffer() {
        let channel = Channel::new(ChannelId::new(1));
        let mut dest = LoopbackDestination;
        dest.deliver(&channel, b"hello");
        assert_eq!(channel.buffered_reply_bytes(), 5);
        assert_eq!(channel.take_reply_chunk(5), (b"hello".to_vec(), 5));
    }

    #[test]
    fn test_exit_runner_delivers() {
        let registry = Arc::new(ChannelRegistry::new());
        let queues = MixQueues::new(8, Shutdown::new());
        let channel = registry.create(ChannelId::new(9)).unwrap();
        let runner = ExitRunner::spawn(
            Arc::clone(&registry),
            queues.clone(),
            Box::new(LoopbackDestination),
        )
        .unwrap();

        queues
            .submit_request(MixMessage::ChannelMessage {
                channel: ChannelId::new(9),
                payload: vec![7; 32],
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while channel.buffered_reply_bytes() < 32 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(channel.buffered_reply_bytes(), 32);

        queues.shutdown().trigger();
        runner.stop();
    }
}
