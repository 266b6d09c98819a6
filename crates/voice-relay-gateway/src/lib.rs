//! Signaling gateway and per-session relay.
//!
//! The gateway hosts the HTTP signaling endpoints, owns the session registry,
//! and wires each browser peer connection to its upstream link: inbound RTP
//! through the media pipeline to the endpoint, synthesized audio back onto the
//! peer's outbound track.

pub mod metrics;
pub mod rtc;
pub mod server;
pub mod session;
pub mod state;

pub use server::start_gateway;
pub use session::{Session, UpstreamSlot};
pub use state::{GatewayState, SessionRegistry};
