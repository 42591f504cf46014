//! Metering consumption.

pub mod consume;
