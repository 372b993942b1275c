//! Seams to the world outside the worker

mod device;
mod store;
mod transport;

pub use device::DeviceTools;
pub use store::StoreLookup;
pub use transport::{MuxStream, MuxTransport};
