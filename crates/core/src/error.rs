//! Error taxonomy shared by the control plane and the gateway agent.
//!
//! Fallible operations return an [`Error`] carrying a [`Kind`]; the HTTP
//! boundary maps kinds to status codes and internal code is expected to
//! preserve the kind when propagating (a 401 must never degrade to a 500).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
	/// Entity does not exist.
	NotFound,
	/// Unique constraint violation (duplicate name/slug).
	Conflict,
	/// Missing, invalid or revoked token or session.
	Unauthorized,
	/// Authenticated but lacks a binding to the requested resource.
	Forbidden,
	/// Previously existed but is expired or revoked.
	Gone,
	/// Transient: backend offline, DNS failed, restart failed.
	Unavailable,
	/// Malformed input or unsupported enum value.
	Invalid,
	/// Unexpected; logged with context.
	Internal,
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Kind::NotFound => "not found",
			Kind::Conflict => "conflict",
			Kind::Unauthorized => "unauthorized",
			Kind::Forbidden => "forbidden",
			Kind::Gone => "gone",
			Kind::Unavailable => "unavailable",
			Kind::Invalid => "invalid",
			Kind::Internal => "internal",
		};
		write!(f, "{s}")
	}
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
	pub kind: Kind,
	pub message: String,
}

impl Error {
	pub fn new(kind: Kind, message: impl Into<String>) -> Self {
		Error {
			kind,
			message: message.into(),
		}
	}

	pub fn not_found(what: impl Into<String>) -> Self {
		Self::new(Kind::NotFound, what)
	}

	pub fn conflict(what: impl Into<String>) -> Self {
		Self::new(Kind::Conflict, what)
	}

	pub fn unauthorized(what: impl Into<String>) -> Self {
		Self::new(Kind::Unauthorized, what)
	}

	pub fn forbidden(what: impl Into<String>) -> Self {
		Self::new(Kind::Forbidden, what)
	}

	pub fn gone(what: impl Into<String>) -> Self {
		Self::new(Kind::Gone, what)
	}

	pub fn unavailable(what: impl Into<String>) -> Self {
		Self::new(Kind::Unavailable, what)
	}

	pub fn invalid(what: impl Into<String>) -> Self {
		Self::new(Kind::Invalid, what)
	}

	pub fn internal(what: impl Into<String>) -> Self {
		Self::new(Kind::Internal, what)
	}

	pub fn kind(&self) -> Kind {
		self.kind
	}
}

pub type Result<T> = std::result::Result<T, Error>;
