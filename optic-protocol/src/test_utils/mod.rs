//! Test doubles for the ports.
//!
//! Available behind the `test-utils` feature flag. These are minimal
//! implementations that prove the port APIs are usable without network
//! access.

mod scripted_model;

pub use scripted_model::{RecordedModelCall, ScriptedModelClient};
