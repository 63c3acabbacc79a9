pub mod aggregator;
pub mod backoff;
pub mod dispatcher;
pub mod model;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod service;
pub mod sources;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
