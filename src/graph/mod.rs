mod object;
mod store;

pub use object::{
    AudioConnection, AudioDevice, AudioPort, ConnectionStatus, DeviceStatus, DeviceType,
    PortDirection, RouteEntry,
};
pub use store::Store;
