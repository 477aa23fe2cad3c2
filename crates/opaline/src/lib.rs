//! opaline — viewer-side core for a virtual world: the agent-appearance
//! pipeline and its supporting models, layered over the [`circuline`]
//! simulator circuit.

pub mod appearance;
pub mod config;
pub mod error;
pub mod llsd;
pub mod services;

pub use appearance::{AppearanceConfig, AppearanceEvent, AppearanceManager, AppearanceState};
pub use error::AppearanceError;
pub use opaline_log::OpalineLogger;
