// Library interface for newspulse modules
// This allows tests and the binary to import modules

pub mod aggregator;
pub mod commands;
pub mod delivery;
pub mod digest;
pub mod history;
pub mod ingestion;
pub mod llm;
pub mod recipients;
pub mod scheduler;
