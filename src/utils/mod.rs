//! Small shared helpers: id generation, bounded retries, JSON glue.

pub mod ids;
pub mod json_ext;
pub mod retry;
