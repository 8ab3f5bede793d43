//! Runnable examples for `sdjobs_core` live under `examples/`.
