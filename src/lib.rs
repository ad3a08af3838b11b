pub mod live;
pub mod orchestrator;
pub mod server;
pub mod state;
pub mod store;
