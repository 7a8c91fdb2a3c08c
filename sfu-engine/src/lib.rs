//! SFU engine control plane
//!
//! Drives out-of-process media workers over two framed pipes and exposes the
//! entity graph they host:
//!
//! - **`Worker`**: one worker process, owning routers
//! - **`Router`**: a routing domain, owning transports
//! - **`Transport`**: WebRTC, plain, pipe or direct, owning media and data endpoints
//! - **`Producer`** / **`Consumer`**: inbound and outbound media
//! - **`DataProducer`** / **`DataConsumer`**: inbound and outbound data messages
//!
//! Closing any entity closes everything it owns. Worker death closes the
//! whole graph below it without further requests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_engine::{EngineSettings, RouterOptions, WorkerPool};
//!
//! let settings = EngineSettings::default();
//! let pool = WorkerPool::spawn(&settings).await?;
//! let router = pool
//!     .next_worker()?
//!     .create_router(RouterOptions::from(&settings.router))
//!     .await?;
//! ```

pub mod bus;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod error;
mod lifecycle;
pub mod message;
pub mod ortc;
pub mod payload_channel;
pub mod producer;
pub mod router;
pub mod rtp_parameters;
pub mod test_helpers;
pub mod transport;
pub mod types;
pub mod worker;
pub mod worker_pool;

pub use channel::ControlChannel;
pub use config::{EngineSettings, ListenIp, RouterSettings, WebRtcTransportSettings, WorkerSettings};
pub use consumer::{Consumer, ConsumerEvent, ConsumerLayers, ConsumerOptions, ConsumerScore};
pub use data_consumer::{DataConsumer, DataConsumerEvent, DataConsumerOptions};
pub use data_producer::{DataProducer, DataProducerEvent, DataProducerOptions};
pub use error::{Error, Result};
pub use payload_channel::PayloadChannel;
pub use producer::{Producer, ProducerEvent, ProducerOptions};
pub use router::{Router, RouterEvent, RouterOptions};
pub use rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
pub use transport::{ConnectParams, Transport, TransportEvent, TransportKind};
pub use types::{
    AppData, ConsumerId, DataConsumerId, DataProducerId, ProducerId, RouterId, TransportId,
};
pub use worker::{Worker, WorkerEvent};
pub use worker_pool::WorkerPool;
