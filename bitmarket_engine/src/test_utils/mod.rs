//! Helpers for tests, in this crate and downstream. Enabled with the `test_utils` feature.
mod mock_gateway;
pub mod prepare_env;
mod recording_notifier;

pub use mock_gateway::MockGateway;
pub use recording_notifier::{PublishedEvent, RecordingNotifier};
