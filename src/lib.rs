//! # Gas DAQ Core Library
//!
//! This crate is the core library for the `gas-daq` harness, which runs timed
//! gas-exposure experiments against a chemiresistive sensor. A session drives
//! several mass-flow controllers through a generated concentration protocol
//! while a source meter samples the sensor, each device on its own worker with
//! its own CSV log.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Converts ppm targets into per-channel flow setpoints and
//!   builds the time-ordered setpoint schedule. Also persists and reloads
//!   protocol artifacts.
//! - **`worker`**: The generic device worker state machine and its two roles,
//!   measurement and flow.
//! - **`session`**: Builds the protocol, constructs every worker and runs them
//!   concurrently until all reach a terminal state.
//! - **`hardware`**: Capability traits the workers drive, plus mock devices for
//!   tests and dry runs.
//! - **`data`**: Append-only CSV logs written by the workers.
//! - **`config`**: Layered TOML + environment configuration via `figment`.
//! - **`error`** / **`error_recovery`**: The `DaqError` enum and connect retry
//!   with device reset.
//! - **`shutdown`**: The coordinated stop signal shared by all workers.
//! - **`tracing_init`**: Structured logging setup.
//! - **`validation`**: Helpers for configuration checks.

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod tracing_init;
pub mod validation;
pub mod worker;
