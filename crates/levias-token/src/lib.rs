//! Bearer credentials read from projected service-account token files.
//!
//! The kubelet rotates projected tokens in place, so the file is re-read on
//! every call instead of being cached.

use std::fs;
use std::path::{Path, PathBuf};

/// Where the kubelet mounts a pod's service-account token.
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to read token file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token file {path} is empty")]
    Empty { path: PathBuf },
}

/// Reads a bearer token from a file on each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the token with surrounding whitespace removed.
    pub fn token(&self) -> Result<String, TokenError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| TokenError::Read {
            path: self.path.clone(),
            source,
        })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(TokenError::Empty {
                path: self.path.clone(),
            });
        }
        Ok(token.to_string())
    }
}

impl Default for FileTokenSource {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_PATH)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{FileTokenSource, TokenError};

    #[test]
    fn token_is_trimmed() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "  eyJhbGciOiJSUzI1NiJ9.payload.sig  ")?;
        let source = FileTokenSource::new(file.path());
        assert_eq!(source.token()?, "eyJhbGciOiJSUzI1NiJ9.payload.sig");
        Ok(())
    }

    #[test]
    fn rotated_token_is_picked_up() -> Result<(), Box<dyn std::error::Error>> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), "first")?;
        let source = FileTokenSource::new(file.path());
        assert_eq!(source.token()?, "first");
        std::fs::write(file.path(), "second")?;
        assert_eq!(source.token()?, "second");
        Ok(())
    }

    #[test]
    fn empty_file_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), "\n\n")?;
        let source = FileTokenSource::new(file.path());
        assert!(matches!(source.token(), Err(TokenError::Empty { .. })));
        Ok(())
    }

    #[test]
    fn missing_file_reports_path() -> Result<(), Box<dyn std::error::Error>> {
        let source = FileTokenSource::new("/nonexistent/levias/token");
        let Err(error) = source.token() else {
            return Err("expected missing file error".into());
        };
        assert!(matches!(error, TokenError::Read { .. }));
        assert!(error.to_string().contains("/nonexistent/levias/token"));
        Ok(())
    }
}
