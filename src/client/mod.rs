//! Blocking client for TWS and IB Gateway.

pub(crate) mod id_generator;
mod sync;

pub use sync::Client;

#[cfg(test)]
mod tests;
