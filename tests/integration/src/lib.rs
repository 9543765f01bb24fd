//! End-to-end scenarios for the command lifecycle engine
//!
//! Each module drives the `Commanding` service with the reference command
//! dictionary and checks the recorded history:
//! - transmission constraints (NA, disabled, immediate NOK, PENDING then OK/NOK)
//! - container and algorithm verifiers, per-stage overrides
//! - queue policy: hold, FIFO release on enable, disable, reject, rebuild, expiration
//! - history subscriptions, external annotations
//! - uplink and history failures

pub mod test_utils;



#[cfg(test)]
mod queue_scenarios;

#[cfg(test)]
mod history_scenarios;

#[cfg(test)]
mod failure_scenarios;
