pub mod domain;
pub mod envelope;
pub mod error;
pub mod protocol;

pub use envelope::Envelope;
pub use error::EnvelopeError;
