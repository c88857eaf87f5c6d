//! Configuration for the rowcast agent.
//!
//! Two sources are consumed at startup and frozen afterwards: the tracking
//! document (a YAML file describing tracked operations, destinations and
//! ignore rules) and process configuration from environment variables.

mod agent;
mod env;
mod error;
mod tracking;

pub use agent::AgentConfig;
pub use env::resolve_env_value;
pub use error::ConfigError;
pub use tracking::{
    BranchRule, ColumnIgnore, ConditionalRule, DestinationConfig, DestinationRole, SimpleRule,
    TrackKey, TrackRule, TrackingDocument,
};
