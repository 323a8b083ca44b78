pub mod adapter;

pub use adapter::EthSource;
