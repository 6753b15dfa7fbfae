pub mod action_parser;
pub mod provider;
pub mod providers;
pub mod sse_parser;
pub mod types;
