use std::num::TryFromIntError;
use std::time::SystemTimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolygenError {
	#[error("invalid usage key: {0}")]
	InvalidKey(String),

	#[error("outbound queue full for proxy {0}")]
	QueueFull(String),

	#[error("redis script execution failed: {0}")]
	ScriptFailed(String),

	#[error("proxy connection failed: {0}")]
	ProxyConnection(String),

	#[error("control fifo error: {0}")]
	ControlFifo(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("YAML error: {0}")]
	Yaml(#[from] serde_yaml::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("prometheus error: {0}")]
	Prometheus(#[from] prometheus::Error),

	#[error("conversion error: {0}")]
	Conversion(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl From<SystemTimeError> for PolygenError {
	fn from(error: SystemTimeError) -> Self {
		Self::Internal(format!("system time error: {error}"))
	}
}

impl From<TryFromIntError> for PolygenError {
	fn from(error: TryFromIntError) -> Self {
		Self::Conversion(format!("{error}"))
	}
}
