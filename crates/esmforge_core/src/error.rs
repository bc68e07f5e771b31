use serde::Serialize;
use thiserror::Error;

/// Coarse error classification shared by every component.
///
/// The router maps each kind onto an HTTP status; everything below the router
/// deals in kinds, not statuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
  InvalidRequest,
  Forbidden,
  NotFound,
  Timeout,
  Upstream,
  Internal,
}

impl ErrorKind {
  pub fn status(&self) -> u16 {
    match self {
      ErrorKind::InvalidRequest => 400,
      ErrorKind::Forbidden => 403,
      ErrorKind::NotFound => 404,
      ErrorKind::Timeout => 408,
      ErrorKind::Upstream => 502,
      ErrorKind::Internal => 500,
    }
  }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ForgeError {
  pub kind: ErrorKind,
  pub message: String,
}

impl ForgeError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn invalid_request(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::InvalidRequest, message)
  }

  pub fn forbidden(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Forbidden, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NotFound, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message)
  }

  pub fn upstream(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Upstream, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Internal, message)
  }

  /// Recover a typed error from an `anyhow` chain, defaulting to `Internal`.
  pub fn from_any(error: &anyhow::Error) -> Self {
    if let Some(forge) = error.downcast_ref::<ForgeError>() {
      forge.clone()
    } else {
      Self::internal(error.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn maps_kinds_to_statuses() {
    assert_eq!(ErrorKind::InvalidRequest.status(), 400);
    assert_eq!(ErrorKind::Forbidden.status(), 403);
    assert_eq!(ErrorKind::NotFound.status(), 404);
    assert_eq!(ErrorKind::Timeout.status(), 408);
    assert_eq!(ErrorKind::Upstream.status(), 502);
    assert_eq!(ErrorKind::Internal.status(), 500);
  }

  #[test]
  fn recovers_typed_error_from_anyhow() {
    let source = ForgeError::not_found("package \"left-pad\" not found");
    let chained: anyhow::Error = source.clone().into();
    assert_eq!(ForgeError::from_any(&chained), source);

    let opaque = anyhow::anyhow!("disk on fire");
    assert_eq!(ForgeError::from_any(&opaque).kind, ErrorKind::Internal);
  }
}
