//! Outbound transport for cue and telemetry messages.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};

use crate::{BeatCueError, Result};

/// OSC timetag meaning "execute immediately".
const IMMEDIATELY: (u32, u32) = (0, 1);

/// Messages produced during one tick, delivered together as one OSC bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundBatch {
    messages: Vec<OscMessage>,
}

impl OutboundBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, addr: impl Into<String>, args: Vec<OscType>) {
        self.messages.push(OscMessage {
            addr: addr.into(),
            args,
        });
    }

    pub fn push_message(&mut self, message: OscMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, other: OutboundBatch) {
        self.messages.extend(other.messages);
    }

    pub fn messages(&self) -> &[OscMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn to_packet(&self) -> OscPacket {
        OscPacket::Bundle(OscBundle {
            timetag: OscTime::from(IMMEDIATELY),
            content: self
                .messages
                .iter()
                .cloned()
                .map(OscPacket::Message)
                .collect(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encoder::encode(&self.to_packet()).map_err(|err| BeatCueError::Transmit(err.to_string()))
    }
}

/// Destination for outbound batches. Delivery is best effort: a failed send
/// is reported once and never retried.
pub trait Sink {
    fn send(&mut self, batch: &OutboundBatch) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&mut self, batch: &OutboundBatch) -> Result<()> {
        (**self).send(batch)
    }
}

/// Fire-and-forget OSC over UDP.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    /// Binds `source_addr` and targets `target_addr`, both `host:port`. The
    /// target is resolved here, once; sends never touch the resolver.
    pub fn new(source_addr: &str, target_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(source_addr)
            .map_err(|err| BeatCueError::Config(format!("cannot bind {source_addr}: {err}")))?;
        socket.set_nonblocking(true)?;
        let target = resolve_target(target_addr, socket.local_addr()?)?;
        tracing::info!(source = source_addr, target = %target, "OSC output enabled");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// Picks the first address of the socket's family, else the first one.
fn resolve_target(target_addr: &str, local: SocketAddr) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = target_addr
        .to_socket_addrs()
        .map_err(|err| {
            BeatCueError::Config(format!("cannot resolve OSC target {target_addr}: {err}"))
        })?
        .collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| BeatCueError::Config(format!("OSC target {target_addr} has no addresses")))
}

impl Sink for UdpSink {
    fn send(&mut self, batch: &OutboundBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let bytes = batch.encode()?;
        self.socket
            .send_to(&bytes, self.target)
            .map_err(|err| BeatCueError::Transmit(format!("{}: {err}", self.target)))?;
        Ok(())
    }
}

/// Drops every batch. Used when transmission is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn send(&mut self, batch: &OutboundBatch) -> Result<()> {
        if !batch.is_empty() {
            tracing::trace!(messages = batch.len(), "output disabled, dropping batch");
        }
        Ok(())
    }
}
