//! valet — a parking-facility management backend speaking the Postgres
//! wire protocol.
//!
//! Spots, vehicles, and booking sessions live in per-facility engines
//! backed by an append-only WAL. The booking/release core guarantees that
//! concurrent Book attempts on one spot resolve to exactly one open
//! booking, and that a vehicle never holds two open bookings at once.

pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod facility;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
