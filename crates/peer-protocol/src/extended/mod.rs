pub mod handshake;
pub mod ut_metadata;

pub use handshake::ExtendedHandshake;
pub use ut_metadata::UtMetadata;
