//! The simulated data-link layer: data frames, the shared wired-AND bus,
//! the per-node protocol state machine, and fault confinement.
pub mod bus;
pub mod confinement;
pub mod frame;
pub mod node;
