//! `canlink` library: a software simulator of the Controller Area Network
//! data-link layer, built to reproduce fault-confinement behavior and
//! attacks against it (notably the bus-off attack). The crate exposes the
//! wire-level primitives, the shared bus, and the per-node protocol
//! machinery.
//==================================================================================
/// Wire-level vocabulary: bus symbols and frame bit layout.
pub mod core;
/// Construction-time errors (frame validation, bus lifecycle, attachment).
pub mod error;
/// Low-level building blocks (bit-stuffing bookkeeping).
pub mod infra;
/// The data-link layer proper: frames, bus, nodes, fault confinement.
pub mod protocol;
//==================================================================================
