//! Tests for rule sets, the pipeline and the gate.
