//! Meeting orchestration on top of `sfu-engine`
//!
//! - **`Peer`**: one participant, its transports and media endpoints
//! - **`Room`**: a named set of peers
//! - **`MeetingManager`**: peer registry, room limits, join and leave flows
//!
//! Producers that nobody consumes are closed when a peer leaves a room.
//! The engine also reclaims them on its own after a grace period.

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod peer;
pub mod request;
pub mod room;
pub mod types;

pub use config::{Config, LoggingConfig, MeetingConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use manager::MeetingManager;
pub use peer::Peer;
pub use request::{
    ConnectWebRtcTransportRequest, CreateWebRtcTransportRequest, ProduceDataRequest,
    ProduceRequest, SetConsumerPreferredLayersRequest, SetConsumerPriorityRequest,
};
pub use room::Room;
pub use types::{PeerId, RoomId};
