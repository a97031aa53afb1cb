//! Remote account-service seam: the per-task client traits workers drive and
//! the HTTP implementation used by the binary.

pub mod client;
pub mod options;
pub mod service;

pub use client::{HttpAccountService, HttpAccountServiceFactory};
pub use options::HttpServiceOptions;
pub use service::{AccountService, AccountServiceFactory, PointsSnapshot, RemoteStep};
