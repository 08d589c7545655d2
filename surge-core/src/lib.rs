pub mod cancel;
pub mod collector;
pub mod duration;
pub mod engine;
pub mod group;
pub mod http;
pub mod options;
pub mod runner;
pub mod source;
pub mod thresholds;

pub use cancel::CancelSignal;
pub use collector::Collector;
pub use engine::{Engine, EngineStatus, Error, Result, StatusPatch};
pub use group::{Check, CheckSnapshot, GroupId, GroupSnapshot, GroupTree};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use options::{OptField, Options};
pub use runner::{Runner, Vu};
pub use source::{SourceData, SourceKind, looks_like_url};
pub use thresholds::{Threshold, ThresholdSet};
