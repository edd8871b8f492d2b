//! Builders that assemble task queues from configuration.

pub mod taskq_builder;

pub use taskq_builder::build_taskqs;
