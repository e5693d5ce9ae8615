pub mod codec;
pub mod logging;
pub mod retry;
pub mod tasks;
pub mod version;
