//! The agent deployment pipeline: source analysis, container recipe,
//! upload, build and log streaming.

pub mod deploy;
pub mod dockerfile;
pub mod logs;
pub mod secrets;
pub mod source;
pub mod tarball;
pub mod version;

pub use deploy::{CreateParams, DeployState, Orchestrator};
pub use source::{ProjectType, SdkCheck};
