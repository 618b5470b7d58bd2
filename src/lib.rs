//! A small distributed banking system over UDP, built to compare
//! at-least-once and at-most-once invocation semantics on a lossy
//! transport.
//!
//! The pieces: a length-framed big-endian datagram protocol ([`proto`]), an
//! in-memory account store ([`bank`]), a single-threaded server loop
//! ([`server`]) with a reply cache ([`dedup`]) and timed monitor
//! subscriptions ([`monitor`]), and a retrying client invoker ([`client`]).
//! Packet loss is simulated server-side so the duplication behavior of the
//! two semantics can be observed without a hostile network.

pub mod bank;
pub mod client;
pub mod dedup;
pub mod monitor;
pub mod proto;
pub mod server;

pub use bank::Bank;
pub use server::{Server, ServerConfig};
