//! pf-tunnel: device tunnel manager for pilot-fleet
//!
//! Keeps one local TCP endpoint per attached device. Every connection made
//! to that endpoint is relayed to the agent port on the device through the
//! multiplexed device transport.

pub mod inetcat;
pub mod manager;
pub mod relay;
pub mod table;

pub use inetcat::InetcatMux;
pub use manager::TunnelManager;
pub use relay::RelayService;
pub use table::{TunnelHandle, TunnelTable};
