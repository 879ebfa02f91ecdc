pub mod builtins;
pub mod conditional;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod input;
pub mod output;
pub mod settings;

pub use error::{DiagnosticError, EngineError};
pub use executor::{Engine, Status};
pub use input::decode_query;
pub use settings::{EngineConfig, Limits, Settings};
