#![deny(missing_docs)]
//! Anthropic Messages API implementation of the [`optic_protocol::ModelClient`] port.
//!
//! Maps single-turn and conversation-continuation calls onto the
//! Messages API, carries base64 images as inline content blocks, and
//! classifies every failure with the workflow's substring rules so
//! callers can drive retries straight off the returned error.

mod client;
mod error;
mod mapping;

pub use client::AnthropicModel;
