pub mod handshake;
pub mod tokens;
pub mod roles;
pub mod quota;
pub mod gate;

#[cfg(feature = "http-api")]
pub mod http;
