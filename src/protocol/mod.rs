//! # Protocol Layer
//!
//! What sits between the wire and the application: the handler contract and
//! the per-message processing pipeline.
//!
//! ## Components
//! - **Handlers**: upcall traits and the id-keyed registry with queued
//!   unregistration
//! - **Pipeline**: ordered stages that prefix outbound messages and strip the
//!   prefix on receive

pub mod handler;
pub mod pipeline;

pub use handler::{
    next_handler_id, ConnectionAcceptanceHandler, ConnectionStatusHandler, HandlerId,
    HandlerLease, HandlerRegistry, NetworkErrorHandler, ReceiveDataHandler,
};
pub use pipeline::{build_pipeline, FlowStage, LogicalClockStage, MessagePipeline, PipelineStage};
