//! Wiring for the `vidflowd` process: storage backends, broker, and workers.

pub mod app;
