//! Error taxonomy for the attestation pipeline.
//!
//! Every variant belongs to exactly one of the kinds in [`ErrorKind`]; that
//! kind governs whether the failure is fatal to the whole run, fatal only to
//! the current GPU, or (for the `Benign` kind, which never reaches here —
//! see the module docs on `orchestrator`) recorded as a warning instead of
//! surfaced as an error at all.

use thiserror::Error;

/// Top-level error kind, matching the taxonomy categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Evidence,
    Malformed,
    IdentityMismatch,
    Cryptographic,
    TrustRevocation,
    Transient,
}

#[derive(Error, Debug)]
pub enum AttestError {
    // --- Configuration ---
    #[error("invalid CLI argument: {0}")]
    BadArgument(String),

    #[error("could not read file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("trust anchor integrity check failed: {0}")]
    TrustAnchorIntegrityFailure(String),

    // --- Evidence ---
    #[error("no GPU found")]
    NoGpuFound,

    #[error("evidence source init failed: {0}")]
    EvidenceInitFailed(String),

    #[error("unsupported GPU architecture: {0}")]
    UnsupportedGpuArchitecture(String),

    // --- Malformed ---
    #[error("malformed attestation report: {0}")]
    MalformedReport(String),

    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("malformed RIM: {0}")]
    MalformedRim(String),

    #[error("certificate chain has no certificates")]
    NoCertificates,

    #[error("certificate chain has wrong length: expected {expected}, got {actual}")]
    WrongCertCount { expected: usize, actual: usize },

    // --- Identity mismatch ---
    #[error("nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: String, actual: String },

    #[error("driver version mismatch: expected {expected}, got {actual}")]
    DriverVersionMismatch { expected: String, actual: String },

    #[error("VBIOS version mismatch: expected {expected}, got {actual}")]
    VbiosVersionMismatch { expected: String, actual: String },

    #[error("RIM version mismatch for {component}: expected {expected}, got {actual}")]
    RimVersionMismatch {
        component: String,
        expected: String,
        actual: String,
    },

    #[error("measurement index {index} has no matching entry in {source}")]
    MeasurementCoverage { index: u32, source: String },

    #[error("measurement index {index} conflicts between driver RIM and VBIOS RIM")]
    MeasurementConflict { index: u32 },

    // --- Cryptographic ---
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("RIM signature verification failed: {0}")]
    RimSignatureVerificationFailed(String),

    // --- Trust / revocation ---
    #[error("certificate chain verification failed at index {index}: {reason}")]
    CertChainVerificationFailure { index: usize, reason: String },

    #[error("certificate revocation status is UNKNOWN for {cn}")]
    RevocationStatusUnknown { cn: String },

    #[error("no trust anchor configured for {mode} chain verification; refusing to treat the chain's own root as trusted")]
    MissingTrustAnchor { mode: String },

    #[error("certificate {cn} is revoked and no longer good for attestation: {reason}")]
    RevocationPastGrace { cn: String, reason: String },

    // --- Transient / network ---
    #[error("OCSP fetch failed after retries and fallback: {0}")]
    OcspFetchFailure(String),

    #[error("RIM fetch failed after retries and fallback: {0}")]
    RimFetchError(String),

    #[error("the GPU's attestation was aborted by a global deadline")]
    Aborted,
}

impl AttestError {
    /// The taxonomy kind this error belongs to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            AttestError::BadArgument(_)
            | AttestError::FileRead { .. }
            | AttestError::InvalidNonce(_)
            | AttestError::TrustAnchorIntegrityFailure(_) => ErrorKind::Configuration,
            AttestError::NoGpuFound
            | AttestError::EvidenceInitFailed(_)
            | AttestError::UnsupportedGpuArchitecture(_) => ErrorKind::Evidence,
            AttestError::MalformedReport(_)
            | AttestError::MalformedCertificate(_)
            | AttestError::MalformedRim(_)
            | AttestError::NoCertificates
            | AttestError::WrongCertCount { .. } => ErrorKind::Malformed,
            AttestError::NonceMismatch { .. }
            | AttestError::DriverVersionMismatch { .. }
            | AttestError::VbiosVersionMismatch { .. }
            | AttestError::RimVersionMismatch { .. }
            | AttestError::MeasurementCoverage { .. }
            | AttestError::MeasurementConflict { .. } => ErrorKind::IdentityMismatch,
            AttestError::SignatureVerificationFailed(_) | AttestError::RimSignatureVerificationFailed(_) => {
                ErrorKind::Cryptographic
            }
            AttestError::CertChainVerificationFailure { .. }
            | AttestError::RevocationStatusUnknown { .. }
            | AttestError::RevocationPastGrace { .. }
            | AttestError::MissingTrustAnchor { .. } => ErrorKind::TrustRevocation,
            AttestError::OcspFetchFailure(_) | AttestError::RimFetchError(_) | AttestError::Aborted => {
                ErrorKind::Transient
            }
        }
    }

    /// Process exit code this error should map to when fatal before
    /// orchestration even starts (`Configuration`/`Evidence` kinds).
    pub const fn exit_code(&self) -> i32 {
        1
    }
}

pub type AttestResult<T> = Result<T, AttestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_configuration() {
        assert_eq!(AttestError::InvalidNonce("bad".into()).kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_kind_identity_mismatch() {
        let err = AttestError::NonceMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
    }

    #[test]
    fn test_kind_trust_revocation() {
        let err = AttestError::RevocationStatusUnknown { cn: "leaf".into() };
        assert_eq!(err.kind(), ErrorKind::TrustRevocation);
    }

    #[test]
    fn test_exit_code_is_one() {
        assert_eq!(AttestError::NoGpuFound.exit_code(), 1);
    }
}
