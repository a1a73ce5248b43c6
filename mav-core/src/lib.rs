// MAVLink protocol and flight session derivation shared by the server.

pub mod crc;
pub mod dialect;
pub mod frame;
pub mod model;
pub mod session;
