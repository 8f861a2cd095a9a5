//! Unit tests for the delivery bus.

mod bus_tests;
pub(crate) mod fixtures;
