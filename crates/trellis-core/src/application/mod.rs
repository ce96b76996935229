//! Application services - the async surface over the domain layer

/// The process engine service
pub mod engine_service;
