//! Infrastructure layer: event store, dispatcher, read models, config and
//! the counting use-case service.

pub mod command_dispatcher;
pub mod config;
pub mod counting_service;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod reference_data;

#[cfg(test)]
mod integration_tests;
