//! Tower layers composing the publish pipeline.
//!
//! Layers transform typed payloads into wire-ready [`TransportMessage`]s
//! before the terminal [`PublishService`](crate::transport::PublishService)
//! hands them to the broker binding.

pub mod json;

pub use json::{JsonLayer, JsonService, Typed};
