//! Domain Layer
//!
//! Ports for the collaborators the cache depends on but does not own.
//!
//! # Usage
//!
//! ```ignore
//! use layercast::domain::{AssetFetcher, FetchOptions};
//!
//! async fn warm<F: AssetFetcher>(fetcher: &F) -> layercast::Result<()> {
//!     let bytes = fetcher.fetch_asset("stems", "bass.wav", &FetchOptions::default()).await?;
//!     // ...
//! }
//! ```

pub mod ports;

pub use ports::{AssetFetcher, ConnectionType, FetchOptions, NetworkConditions, NetworkSampler};
