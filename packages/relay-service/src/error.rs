pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Unknown segmentation definition {name:?}.")]
	UnknownDefinition { name: String },
	#[error("Dependency failure: {message}")]
	Dependency { message: String },
	#[error("Search timed out after {elapsed_ms} ms.")]
	Timeout { elapsed_ms: u64 },
	#[error("Index error: {message}")]
	Index { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<relay_storage::Error> for Error {
	fn from(err: relay_storage::Error) -> Self {
		match err {
			relay_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			relay_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			relay_storage::Error::CorruptRow(message) => Self::Storage { message },
		}
	}
}

impl From<relay_providers::Error> for Error {
	fn from(err: relay_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}
