//! Typed client for the TrueNAS SCALE REST API (v2.0).
//!
//! The [`Appliance`] trait is the seam between the CSI driver and the
//! appliance; [`TrueNasClient`] is its HTTP implementation.

pub mod api;
pub mod client;
pub mod error;
pub mod types;

pub use api::Appliance;
pub use client::{ClientConfig, TrueNasClient};
pub use error::{ApiError, Result};
