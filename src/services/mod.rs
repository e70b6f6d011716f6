pub mod latch;
pub mod observer;
pub mod sweeper;
pub mod wallet;

pub use observer::ChainObserver;
pub use sweeper::SweepEngine;
pub use wallet::WalletService;
