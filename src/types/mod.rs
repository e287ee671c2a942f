//! Core domain types shared across the pipeline.
//!
//! Every type here crosses a component boundary (a bus payload, a persisted
//! row, or an HTTP body), so all of them serialize with
//! camelCase wire names.

pub mod aggregate;
pub mod alert;
pub mod reading;
pub mod tariff;

pub use aggregate::{MeterAggregate, RegionalAggregate};
pub use alert::{Alert, AlertStatus, AlertStatusUpdate, AnomalyEvent, AnomalyKind, Severity};
pub use reading::{Reading, ReadingStatus};
pub use tariff::{Tariff, TariffUpdate, TriggeredBy};
