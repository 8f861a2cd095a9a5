//! Step definitions for delivery scenarios.

pub mod world;

mod given;
mod then;
mod when;
