pub mod client;

pub use client::MockChainSource;
