//! Typed data model shared by every component

pub mod check;
pub mod config;
pub mod result;
pub mod scope;
pub mod value;

pub use check::{Check, CheckId, DepRef, FanoutMode, RetryPolicy, RoutingBlock};
pub use config::{EngineConfig, MemoryConfig, MemoryFormat, RoutingConfig, RoutingDefaults};
pub use result::{CheckResult, ErrorInfo, ErrorKind, Issue, Severity};
pub use scope::{ScopePath, ScopeSegment};
pub use value::OutputValue;
