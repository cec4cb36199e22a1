pub mod broker;
pub mod client;
pub mod guard;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod topic;

pub use broker::*;
pub use client::*;
pub use guard::*;
pub use handler::*;
pub use protocol::*;
pub use server::*;
pub use topic::*;
