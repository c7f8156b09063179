//! Persistence for the UTXO nursery.
//!
//! [`kvv::KVVNurseryStore`] implements the core's `NurseryStore` trait on
//! top of any [`kvv::KVVStore`] backend; an in-memory backend is always
//! available and a durable redb backend is provided behind the
//! `redb-kvv` feature.

#![forbid(unsafe_code)]

pub mod kvv;
pub mod model;
