//! Scalar measurement role (sensor resistance from the source meter).

use super::{SampleRole, Tick, WorkerRole};
use crate::data::{LogRecord, MEASUREMENT_HEADER};
use crate::error::TransportError;
use crate::hardware::Measurable;
use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;

/// Reads one value per tick; optionally stops after a fixed run time.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRole {
    run_for: Option<Duration>,
}

impl MeasurementRole {
    /// Sample until stopped, or until `run_for` has elapsed since the epoch.
    pub fn new(run_for: Option<Duration>) -> Self {
        Self { run_for }
    }
}

#[async_trait]
impl<D: Measurable> SampleRole<D> for MeasurementRole {
    fn role(&self) -> WorkerRole {
        WorkerRole::Measurement
    }

    fn header(&self) -> &'static [&'static str] {
        &MEASUREMENT_HEADER
    }

    async fn tick(
        &mut self,
        device: &mut D,
        handle: &mut D::Handle,
        elapsed: Duration,
    ) -> Result<Tick, TransportError> {
        if self.run_for.is_some_and(|limit| elapsed >= limit) {
            return Ok(Tick::Complete);
        }
        let value = device.read_measurement(handle).await?;
        Ok(Tick::Sampled(LogRecord::Measurement {
            timestamp: Local::now(),
            device_id: device.device_id().to_string(),
            value,
        }))
    }
}
