//! Forecasting: build the inference request, call the endpoint, and reconcile
//! whatever comes back into `predictions` and `recommendations` rows.

mod client;
mod reconcile;
mod request;

pub use client::InferenceClient;
pub use reconcile::{reconcile, ReconcileError};
pub use request::{build_request, ForecastRequest};
