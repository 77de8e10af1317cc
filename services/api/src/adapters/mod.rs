pub mod bridge;
pub mod db;
pub mod fake_gateway;
pub mod memory;

pub use bridge::BridgeGateway;
pub use db::DbAdapter;
pub use fake_gateway::{FakeGateway, FakeOp, Gate};
pub use memory::MemoryStore;
