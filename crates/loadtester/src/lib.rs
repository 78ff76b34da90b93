//! Synthetic load for real-time rooms: virtual participants that publish
//! and subscribe through a [`MediaConnector`], ramped at a fixed rate and
//! summarised per tester.

pub mod agent_load;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod params;
pub mod quality;
pub mod report;
pub mod speaker;
pub mod stats;
pub mod tester;
pub mod transport;

pub use agent_load::{AgentLoadParams, AgentLoadReport, RoomResult};
pub use engine::{LoadTest, SUITE, SUITE_DURATION, SuiteResult};
pub use error::{LoadTestError, Result};
pub use loopback::{Loopback, LoopbackConfig};
pub use params::{Layout, Params, Resolution, VideoCodec};
pub use report::{Report, Summary};
pub use transport::{MediaConnector, TokenIssuer, TokenRequest};
