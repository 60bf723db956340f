//! Confidential Compute GPU attestation verifier — core library.
//!
//! Parses an SPDM-shaped measurement report, walks and validates the GPU's
//! certificate chain (including OCSP revocation with a bounded grace
//! period), fetches and verifies Reference Integrity Manifests, compares
//! reported measurements against RIM golden values, and emits a signed
//! EAT/JWT attesting the outcome. [`orchestrator`] is the entry point that
//! ties every component below together per GPU.

pub mod certs;
pub mod claims;
pub mod config;
pub mod error;
pub mod evidence;
pub mod http_fetch;
pub mod measurements;
pub mod observability;
pub mod ocsp;
pub mod orchestrator;
pub mod report;
pub mod report_verify;
pub mod rim;

pub use error::{AttestError, AttestResult};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grace_hours_reachable_through_lib_root() {
        let h = config::OcspGraceHours::for_profile(config::OcspProfile::Default);
        assert_eq!(h.device_extension, 336);
    }
}
