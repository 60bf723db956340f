//! C8: Claims / EAT builder.
//!
//! Assembles the per-GPU verification outcomes the orchestrator produces
//! into an Entity Attestation Token (EAT)-shaped claim set and signs it as
//! a JWT (RFC 7519). A bare HMAC secret is the development default;
//! production attesters supply their own [`Signer`].

use std::collections::BTreeMap;

use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;

use crate::error::{AttestError, AttestResult};
use crate::orchestrator::GpuClaim;

const DEV_HMAC_SECRET: &[u8] = b"gpu-attest-verifier-dev-secret-do-not-use-in-production";

/// Pluggable token signer. The dev default signs HS256 with a fixed
/// secret; an attester supplying its own key material implements this
/// directly rather than threading a secret through `Settings`.
pub trait Signer {
    fn header(&self) -> Header;
    fn encoding_key(&self) -> &EncodingKey;
}

pub struct DevHmacSigner {
    header: Header,
    key: EncodingKey,
}

impl Default for DevHmacSigner {
    fn default() -> Self {
        Self {
            header: Header::default(), // HS256
            key: EncodingKey::from_secret(DEV_HMAC_SECRET),
        }
    }
}

impl Signer for DevHmacSigner {
    fn header(&self) -> Header {
        self.header.clone()
    }

    fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

/// Per-GPU entry in the `submods` claim, shaped after the ledger marks
/// `orchestrator::VerificationLedger` tracks.
#[derive(Debug, Serialize)]
pub struct GpuSubmod {
    #[serde(rename = "x-nvidia-gpu-arch-check")]
    pub arch_check: &'static str,
    #[serde(rename = "x-nvidia-gpu-report-parsed")]
    pub report_parsed: &'static str,
    #[serde(rename = "x-nvidia-gpu-attestation-report-cert-chain-validated")]
    pub chain_ok: &'static str,
    #[serde(rename = "x-nvidia-gpu-attestation-report-cert-chain-revocation-ok")]
    pub chain_revocation_ok: &'static str,
    #[serde(rename = "x-nvidia-gpu-attestation-report-signature-verified")]
    pub report_verified: &'static str,
    #[serde(rename = "x-nvidia-gpu-driver-rim-schema-validated")]
    pub driver_rim_ok: &'static str,
    #[serde(rename = "x-nvidia-gpu-vbios-rim-schema-validated")]
    pub vbios_rim_ok: &'static str,
    #[serde(rename = "measres")]
    pub measurements_ok: &'static str,
    pub ueid: Option<String>,
    #[serde(rename = "x-nvidia-gpu-manufacturer")]
    pub oem_id: Option<String>,
    #[serde(rename = "hwmodel")]
    pub hw_model: Option<String>,
    #[serde(rename = "x-nvidia-gpu-attestation-warnings")]
    pub warnings: Vec<String>,
    #[serde(rename = "x-nvidia-overall-att-result")]
    pub overall: bool,
}

#[derive(Debug, Serialize)]
pub struct EatClaims {
    pub iss: String,
    pub iat: i64,
    pub nonce: String,
    #[serde(rename = "x-nvidia-overall-att-result")]
    pub overall: bool,
    pub submods: BTreeMap<String, GpuSubmod>,
}

const TOKEN_ISSUER: &str = "gpu_attest_verifier";
const PASS: &str = "success";
const FAIL: &str = "failure";

fn mark(ok: bool) -> &'static str {
    if ok {
        PASS
    } else {
        FAIL
    }
}

/// Build the claim set from the orchestrator's aggregated result.
/// `issued_at` is passed in rather than read from the clock so the
/// builder stays pure and testable (the one call site, `main`, reads
/// `chrono::Utc::now()`).
pub fn build_claims(overall: bool, nonce: &[u8], claims: &[GpuClaim], issued_at: i64) -> EatClaims {
    let submods = claims
        .iter()
        .map(|c| {
            let ledger = &c.ledger;
            (
                c.uuid.clone(),
                GpuSubmod {
                    arch_check: mark(ledger.arch_ok),
                    report_parsed: mark(ledger.report_parsed),
                    chain_ok: mark(ledger.chain_ok),
                    chain_revocation_ok: mark(ledger.chain_revocation_ok),
                    report_verified: mark(ledger.report_verified),
                    driver_rim_ok: mark(ledger.driver_rim_ok),
                    vbios_rim_ok: mark(ledger.vbios_rim_ok),
                    measurements_ok: mark(ledger.measurements_ok),
                    ueid: c.ueid.clone(),
                    oem_id: c.oem_id.clone(),
                    hw_model: c.hw_model.clone(),
                    warnings: c.warnings.clone(),
                    overall: c.overall,
                },
            )
        })
        .collect();

    EatClaims {
        iss: TOKEN_ISSUER.to_string(),
        iat: issued_at,
        nonce: hex::encode(nonce),
        overall,
        submods,
    }
}

/// Sign the claim set as a compact JWT.
pub fn sign(claims: &EatClaims, signer: &dyn Signer) -> AttestResult<String> {
    jsonwebtoken::encode(&signer.header(), claims, signer.encoding_key())
        .map_err(|e| AttestError::SignatureVerificationFailed(format!("JWT encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{GpuState, VerificationLedger};

    fn claim(uuid: &str, overall: bool) -> GpuClaim {
        GpuClaim {
            uuid: uuid.to_string(),
            hw_model: Some("H100".to_string()),
            ueid: Some("abcd".to_string()),
            oem_id: Some("NVIDIA".to_string()),
            overall,
            ledger: VerificationLedger {
                arch_ok: true,
                report_parsed: true,
                chain_ok: true,
                chain_revocation_ok: true,
                report_verified: true,
                driver_rim_ok: true,
                vbios_rim_ok: true,
                measurements_ok: overall,
                done: overall,
            },
            warnings: vec!["THE CERTIFICATE leaf IS REVOKED FOR 'certificate_hold' AT now.".to_string()],
            failure_reason: if overall { None } else { Some("measurement mismatch".to_string()) },
            state_reached: if overall { GpuState::Done } else { GpuState::VbiosRimOk },
        }
    }

    #[test]
    fn test_build_claims_mirrors_ledger() {
        let claims = build_claims(true, &[1, 2, 3], &[claim("GPU-1", true)], 1_700_000_000);
        let submod = claims.submods.get("GPU-1").unwrap();
        assert_eq!(submod.measurements_ok, "success");
        assert!(submod.overall);
        assert_eq!(claims.nonce, hex::encode([1, 2, 3]));
    }

    #[test]
    fn test_failed_gpu_still_gets_a_claims_entry() {
        let claims = build_claims(false, &[0u8; 32], &[claim("GPU-1", true), claim("GPU-2", false)], 0);
        assert_eq!(claims.submods.len(), 2);
        assert!(!claims.submods.get("GPU-2").unwrap().overall);
        assert!(!claims.overall);
    }

    #[test]
    fn test_sign_produces_compact_jwt() {
        let claims = build_claims(true, &[9u8; 4], &[claim("GPU-1", true)], 0);
        let signer = DevHmacSigner::default();
        let token = sign(&claims, &signer).unwrap();
        assert_eq!(token.split('.').count(), 3);
    }
}
