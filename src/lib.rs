//! Waystation: message pickup and delivery queues for a DIDComm mediator.
//!
//! Devices behind a mediator connect intermittently. This crate queues
//! encrypted messages per logical recipient, tracks which mediator instance
//! currently holds a live delivery session for each recipient, coordinates
//! cross-instance delivery with pub/sub wake-up hints, and falls back to a
//! push notification when nobody holds a session.
//!
//! The surrounding protocol machinery (envelope crypto, connection and
//! mediation state, DID documents, the transports themselves) lives in the
//! external agent runtime and is consumed through the
//! [`MediatorRuntime`](repository::MediatorRuntime) capability trait.
//!
//! ```no_run
//! use std::sync::Arc;
//! use waystation::{PickupRepository, WaystationConfig};
//! # use waystation::repository::MediatorRuntime;
//! # async fn example(runtime: Arc<dyn MediatorRuntime>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = WaystationConfig::from_env()?;
//! let repository = PickupRepository::from_config(&config, runtime).await?;
//! repository.initialize().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod notify;
pub mod pubsub;
pub mod repository;
pub mod sessions;
pub mod store;

pub use config::{PubSubTopology, StoreBackend, WaystationConfig};
pub use error::{NotificationError, PickupError, PubSubError, StorageError};
pub use repository::{MediatorRuntime, PickupRepository};
pub use sessions::LiveSessionRegistry;
pub use store::{LiveSessionRecord, MessageState, PickupStore, QueuedMessage};
