//! Device capabilities
//!
//! Instrument drivers expose small, focused capability traits instead of one
//! monolithic instrument trait. The acquisition core only ever needs three:
//!
//! - [`Connectable`]: open, reset and close the transport
//! - [`Measurable`]: read one scalar sample
//! - [`Actuatable`]: command a flow setpoint on a channel
//!
//! A source meter implements `Measurable`; a mass-flow controller implements
//! `Actuatable` (and therefore `Measurable`, reading back the actual flow).
//!
//! # Contract
//!
//! - Every fallible call returns [`TransportError`]; the worker decides whether
//!   it is transient or fatal.
//! - `disconnect` is best-effort and cannot fail. Drivers log and swallow
//!   their own close errors.
//! - Methods take `&mut self`: a device and its handle are owned by exactly one
//!   worker, so drivers need no interior locking.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn sample_once<D: Measurable>(device: &mut D) -> Result<f64, TransportError> {
//!     let mut handle = device.connect().await?;
//!     let value = device.read_measurement(&mut handle).await;
//!     device.disconnect(handle).await;
//!     value
//! }
//! ```

use crate::error::TransportError;
use crate::protocol::{ChannelId, Flow};
use async_trait::async_trait;

/// Capability: Connection lifecycle
///
/// # Contract
/// - `connect` returns a handle that every further call takes
/// - `reset` is a hard reset of the instrument or bus, attempted at most once
///   per recovery sequence
/// - `disconnect` consumes the handle
#[async_trait]
pub trait Connectable: Send {
    /// Open-connection state owned by the worker.
    type Handle: Send + 'static;

    /// Stable identifier used in logs and reports.
    fn device_id(&self) -> &str;

    /// Open the transport.
    async fn connect(&mut self) -> Result<Self::Handle, TransportError>;

    /// Hard reset the instrument without a handle.
    async fn reset(&mut self) -> Result<(), TransportError>;

    /// Close the transport; never fails.
    async fn disconnect(&mut self, handle: Self::Handle);
}

/// Capability: Scalar measurement
///
/// Source meters return resistance in ohms; flow controllers return the
/// measured flow in sccm.
#[async_trait]
pub trait Measurable: Connectable {
    /// Read one sample.
    async fn read_measurement(&mut self, handle: &mut Self::Handle) -> Result<f64, TransportError>;
}

/// Capability: Flow setpoint
#[async_trait]
pub trait Actuatable: Measurable {
    /// Command `flow` sccm on `channel`.
    async fn set_flow_setpoint(
        &mut self,
        handle: &mut Self::Handle,
        channel: ChannelId,
        flow: Flow,
    ) -> Result<(), TransportError>;
}
