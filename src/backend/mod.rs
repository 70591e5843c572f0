//! Platform [`PortAccess`](crate::port::PortAccess) implementations

#[cfg(feature = "midir")]
pub mod midir;

#[cfg(feature = "midir")]
pub use self::midir::MidirAccess;
