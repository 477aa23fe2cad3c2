//! circuline — the per-region UDP session layer of the opaline viewer
//! library. One [`circuit::Circuit`] keeps a reliable, ordered-where-
//! required conversation going with a single simulator endpoint; the
//! [`manager::CircuitManager`] owns the set of live circuits.

pub mod circuit;
pub mod consts;
pub mod error;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod reliability;
pub mod stats;
pub mod throttle;

pub use circuit::{Circuit, CircuitConfig, CircuitParams, CircuitState};
pub use error::CircuitError;
pub use manager::{CircuitManager, SimEvent};
pub use protocol::messages::Message;
