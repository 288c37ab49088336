pub mod db;
pub mod episodes;
pub mod events;
pub mod filter;
pub mod lexical;
pub mod models;
pub mod schema;
pub mod segmentation_state;
pub mod tracking;
pub mod vectors;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
