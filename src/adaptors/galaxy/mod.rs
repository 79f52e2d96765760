mod adaptor;
pub mod client;
pub mod error;
pub mod types;

pub use adaptor::GalaxyAdaptor;
pub use error::GalaxyError;
