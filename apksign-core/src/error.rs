use thiserror::Error;

/// Errors surfaced across the public boundary of `apksign-core`.
///
/// Internally, most modules thread `anyhow::Result` for `.context(...)`
/// ergonomics on I/O and parsing failures; only the public entry points in
/// `lib.rs` convert those into this closed set.
#[derive(Error, Debug)]
pub enum SignError {
    /// The supplied PEM blob was missing a certificate, a private key, or
    /// both, or either section could not be parsed.
    #[error("certificate PEM is missing a certificate and/or RSA private key")]
    BadCertificate,

    /// The archive is not a valid ZIP, or its central directory/EOCD could
    /// not be parsed.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// Reserved for callers that want strict manifest parsing. The public
    /// `collect_pre_patch_hashes` never raises this itself; it returns
    /// `None` on an unsupported manifest instead.
    #[error("existing manifest is not a supported format")]
    UnsupportedManifest,

    /// A disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cryptographic primitive (hashing, RSA signing, certificate
    /// encoding) failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

impl SignError {
    pub(crate) fn from_anyhow_as_malformed(err: anyhow::Error) -> Self {
        SignError::MalformedArchive(format!("{err:#}"))
    }

    pub(crate) fn from_anyhow_as_signing(err: anyhow::Error) -> Self {
        SignError::SigningFailed(format!("{err:#}"))
    }
}
