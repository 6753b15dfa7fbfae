pub mod coordinator;
pub mod dispatcher;
pub mod input;
pub mod text_input;
