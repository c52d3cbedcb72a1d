//! # Message Pipeline
//!
//! Pluggable per-message processing that runs inside a transport.
//!
//! On send each stage may prepend bytes to the message *prefix*; the prefix is
//! written between the wire header and the payload and counted in the header's
//! `size`. On receive the stages run in reverse and strip what they prepended
//! from the front of the payload. On a per-message send error the stages run
//! in reverse over the retained prefix.
//!
//! ```text
//! send:    stage[0].route -> stage[1].route -> ... -> [hdr][prefix_n..prefix_0][payload]
//! receive: stage[n].deliver -> ... -> stage[0].deliver -> handler
//! ```

use bytes::{Buf, BufMut};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::core::address::NodeAddress;
use crate::core::header::HandlerId;
use crate::error::{Result, TransportError};

/// One processing stage.
pub trait PipelineStage: Send + Sync {
    /// Outbound: may prepend to `prefix` or rewrite `payload`. An emptied
    /// payload drops the message.
    fn route(&self, dest: &NodeAddress, prefix: &mut Vec<u8>, payload: &mut Vec<u8>, id: HandlerId);

    /// Inbound: strip this stage's prefix from the front of `payload`.
    fn deliver(&self, src: &NodeAddress, payload: &mut Vec<u8>, id: HandlerId) -> Result<()>;

    /// A routed message could not be sent; strip this stage's prefix.
    fn message_error(
        &self,
        dest: &NodeAddress,
        prefix: &mut Vec<u8>,
        payload: &mut Vec<u8>,
        id: HandlerId,
    ) -> Result<()>;
}

/// Ordered stages, itself usable as a single stage.
#[derive(Default)]
pub struct MessagePipeline {
    stages: VecDeque<Box<dyn PipelineStage>>,
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push_back(stage);
    }

    pub fn push_front(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push_front(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl PipelineStage for MessagePipeline {
    fn route(&self, dest: &NodeAddress, prefix: &mut Vec<u8>, payload: &mut Vec<u8>, id: HandlerId) {
        for stage in &self.stages {
            stage.route(dest, prefix, payload, id);
        }
    }

    fn deliver(&self, src: &NodeAddress, payload: &mut Vec<u8>, id: HandlerId) -> Result<()> {
        for stage in self.stages.iter().rev() {
            stage.deliver(src, payload, id)?;
        }
        Ok(())
    }

    fn message_error(
        &self,
        dest: &NodeAddress,
        prefix: &mut Vec<u8>,
        payload: &mut Vec<u8>,
        id: HandlerId,
    ) -> Result<()> {
        for stage in self.stages.iter().rev() {
            stage.message_error(dest, prefix, payload, id)?;
        }
        Ok(())
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Prepend `hdr` in front of whatever the later stages will add.
fn prepend(prefix: &mut Vec<u8>, hdr: &[u8]) {
    prefix.splice(0..0, hdr.iter().copied());
}

/// Split `len` bytes off the front of `buf`.
fn strip_front(buf: &mut Vec<u8>, len: usize, stage: &str) -> Result<Vec<u8>> {
    if buf.len() < len {
        return Err(TransportError::Custom(format!(
            "{stage}: prefix needs {len} bytes, {} available",
            buf.len()
        )));
    }
    let rest = buf.split_off(len);
    Ok(std::mem::replace(buf, rest))
}

static PIPELINE_COUNT: AtomicU8 = AtomicU8::new(0);

const FLOW_PREFIX_LEN: usize = 1 + 8;

/// Logs a flow record for every message sent, received or failed.
pub struct FlowStage {
    pipeline: u8,
    local: NodeAddress,
}

impl FlowStage {
    pub fn new(local: NodeAddress) -> Self {
        Self {
            pipeline: PIPELINE_COUNT.fetch_add(1, Ordering::Relaxed),
            local,
        }
    }

    pub fn pipeline_id(&self) -> u8 {
        self.pipeline
    }
}

impl PipelineStage for FlowStage {
    fn route(&self, dest: &NodeAddress, prefix: &mut Vec<u8>, payload: &mut Vec<u8>, _id: HandlerId) {
        let time = now_micros();
        info!(
            target: "network_transport::flow",
            pipeline = self.pipeline,
            source = %self.local,
            dest = %dest,
            time,
            size = prefix.len() + payload.len(),
            "flow send"
        );
        let mut hdr = Vec::with_capacity(FLOW_PREFIX_LEN);
        hdr.put_u8(self.pipeline);
        hdr.put_u64(time);
        prepend(prefix, &hdr);
    }

    fn deliver(&self, src: &NodeAddress, payload: &mut Vec<u8>, _id: HandlerId) -> Result<()> {
        let hdr = strip_front(payload, FLOW_PREFIX_LEN, "flow stage")?;
        let mut hdr = &hdr[..];
        let pipeline = hdr.get_u8();
        let time = hdr.get_u64();
        info!(
            target: "network_transport::flow",
            pipeline,
            source = %src,
            time,
            size = payload.len(),
            "flow receive"
        );
        Ok(())
    }

    fn message_error(
        &self,
        dest: &NodeAddress,
        prefix: &mut Vec<u8>,
        payload: &mut Vec<u8>,
        _id: HandlerId,
    ) -> Result<()> {
        let hdr = strip_front(prefix, FLOW_PREFIX_LEN, "flow stage")?;
        let mut hdr = &hdr[..];
        let pipeline = hdr.get_u8();
        let time = hdr.get_u64();
        info!(
            target: "network_transport::flow",
            pipeline,
            source = %self.local,
            dest = %dest,
            time,
            size = prefix.len() + payload.len(),
            "flow error"
        );
        Ok(())
    }
}

const CLOCK_PREFIX_LEN: usize = 8 + 8;

/// Lamport logical clock carried on every message.
///
/// The message id packs the send time in microseconds into the high bits and
/// the local IPv4 address into the low 32 bits, bumped when needed so ids are
/// strictly increasing.
pub struct LogicalClockStage {
    local_ip: u32,
    clock: AtomicU64,
    max_id: AtomicU64,
}

impl LogicalClockStage {
    pub fn new(local_ip: Ipv4Addr) -> Self {
        Self {
            local_ip: u32::from(local_ip),
            clock: AtomicU64::new(0),
            max_id: AtomicU64::new(0),
        }
    }

    /// Current clock value.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Advance for a local send.
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a remote clock on receive.
    fn merge(&self, remote: u64) -> u64 {
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(remote) + 1)
            })
            .unwrap_or(remote);
        prev.max(remote) + 1
    }

    fn next_id(&self) -> u64 {
        let candidate = (now_micros() << 32) | u64::from(self.local_ip);
        let prev = self
            .max_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |max| {
                Some(if candidate <= max { max + 1 } else { candidate })
            })
            .unwrap_or(0);
        if candidate <= prev {
            prev + 1
        } else {
            candidate
        }
    }
}

impl PipelineStage for LogicalClockStage {
    fn route(&self, _dest: &NodeAddress, prefix: &mut Vec<u8>, _payload: &mut Vec<u8>, _id: HandlerId) {
        let mut hdr = Vec::with_capacity(CLOCK_PREFIX_LEN);
        hdr.put_u64(self.tick());
        hdr.put_u64(self.next_id());
        prepend(prefix, &hdr);
    }

    fn deliver(&self, _src: &NodeAddress, payload: &mut Vec<u8>, _id: HandlerId) -> Result<()> {
        let hdr = strip_front(payload, CLOCK_PREFIX_LEN, "logical clock stage")?;
        let mut hdr = &hdr[..];
        let remote = hdr.get_u64();
        self.merge(remote);
        Ok(())
    }

    fn message_error(
        &self,
        _dest: &NodeAddress,
        prefix: &mut Vec<u8>,
        _payload: &mut Vec<u8>,
        _id: HandlerId,
    ) -> Result<()> {
        strip_front(prefix, CLOCK_PREFIX_LEN, "logical clock stage")?;
        Ok(())
    }
}

/// Build the transport's pipeline from its flags: none, a single stage, or a
/// `MessagePipeline` wrapping several.
pub fn build_pipeline(
    local: NodeAddress,
    flow: bool,
    logical_clock: bool,
) -> Option<Box<dyn PipelineStage>> {
    let mut stages: Vec<Box<dyn PipelineStage>> = Vec::new();
    if flow {
        stages.push(Box::new(FlowStage::new(local)));
    }
    if logical_clock {
        stages.push(Box::new(LogicalClockStage::new(local.local.addr)));
    }
    match stages.len() {
        0 => None,
        1 => stages.pop(),
        _ => {
            let mut pipeline = MessagePipeline::new();
            for stage in stages {
                pipeline.push_back(stage);
            }
            Some(Box::new(pipeline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::SockAddr;

    fn local() -> NodeAddress {
        NodeAddress::direct(SockAddr::new(Ipv4Addr::new(10, 0, 0, 1), 5377))
    }

    /// Sender side then receiver side of the same stage stack.
    fn through(stage: &dyn PipelineStage, body: &[u8]) -> Vec<u8> {
        let mut prefix = Vec::new();
        let mut payload = body.to_vec();
        stage.route(&NodeAddress::NULL, &mut prefix, &mut payload, 1);
        prefix.extend_from_slice(&payload);
        let mut wire = prefix;
        assert!(stage.deliver(&local(), &mut wire, 1).is_ok());
        wire
    }

    #[test]
    fn stacked_stages_strip_in_reverse() {
        let stage = build_pipeline(local(), true, true);
        let Some(stage) = stage else {
            panic!("two flags must build a pipeline");
        };
        assert_eq!(through(stage.as_ref(), b"payload"), b"payload");
    }

    #[test]
    fn logical_clock_merges_remote_time() {
        let a = LogicalClockStage::new(Ipv4Addr::new(10, 0, 0, 1));
        let b = LogicalClockStage::new(Ipv4Addr::new(10, 0, 0, 2));
        for _ in 0..5 {
            a.tick();
        }

        let mut prefix = Vec::new();
        let mut payload = b"x".to_vec();
        a.route(&NodeAddress::NULL, &mut prefix, &mut payload, 0);
        prefix.extend_from_slice(&payload);
        assert!(b.deliver(&local(), &mut prefix, 0).is_ok());

        assert_eq!(prefix, b"x");
        assert_eq!(a.clock(), 6);
        assert_eq!(b.clock(), 7);
    }

    #[test]
    fn message_ids_strictly_increase() {
        let stage = LogicalClockStage::new(Ipv4Addr::new(192, 168, 0, 9));
        let mut last = 0;
        for _ in 0..1000 {
            let id = stage.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn short_payload_is_an_error() {
        let stage = FlowStage::new(local());
        let mut payload = vec![1, 2, 3];
        assert!(stage.deliver(&local(), &mut payload, 0).is_err());
    }

    #[test]
    fn message_error_strips_prefix_only() {
        let stage = FlowStage::new(local());
        let mut prefix = Vec::new();
        let mut payload = b"body".to_vec();
        stage.route(&NodeAddress::NULL, &mut prefix, &mut payload, 3);
        assert_eq!(prefix.len(), FLOW_PREFIX_LEN);
        assert!(stage
            .message_error(&NodeAddress::NULL, &mut prefix, &mut payload, 3)
            .is_ok());
        assert!(prefix.is_empty());
        assert_eq!(payload, b"body");
    }
}
