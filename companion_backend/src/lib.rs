pub mod bot;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod gatekeeper;
pub mod llm_client;
pub mod orchestrator;
pub mod prompt;
pub mod runtime;
pub mod safety;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;
