//! Real-time risk scoring and fraud rule evaluation for mobile-money
//! transactions.
//!
//! [`core::dispatcher::DecisionEngine`] is the entry point: it takes an
//! [`core::EvaluationContext`] and returns a [`core::Verdict`].

pub mod aggregator;
pub mod anomaly;
pub mod audit;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod rules;
pub mod signals;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;
