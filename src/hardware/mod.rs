//! The hardware module contains the adapters this crate ships with.
//!
//! Real adapter drivers live outside this crate. They only need to implement
//! [crate::channel::CanChannel] and can then be wrapped in an
//! [crate::isotp::IsoTpTransport].

pub mod simulation;

pub use simulation::{SimulationCanBus, SimulationCanChannel};
