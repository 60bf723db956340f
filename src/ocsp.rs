//! C3: OCSP Client & Validator.
//!
//! Builds OCSP requests (SHA-384 cert ID, optional nonce), POSTs them via
//! the shared [`crate::http_fetch`] fetcher, and validates responses:
//! status, nonce echo, validity window (with extension), the response's
//! own signing chain (recursing into `certs::verify_chain` in
//! `ChainMode::OcspResponse`, which does not itself trigger OCSP), the
//! response signature, and finally the certificate's revocation status
//! with the grace-period policy from `config::OcspGraceHours`.

use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::ocsp::{OcspCertId, OcspCertStatus, OcspFlag, OcspRequest, OcspResponse as OpensslOcspResponse, OcspResponseStatus};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

use crate::certs;
use crate::config::{ChainMode, OcspGraceHours, Settings};
use crate::error::{AttestError, AttestResult};
use crate::http_fetch::HttpFetcher;

/// Outcome of revocation validation for a single certificate's chain.
pub struct ValidationOutcome {
    pub ok: bool,
    pub warnings: Vec<String>,
}

/// Outcome of comparing `now` against a deadline plus its grace extension.
/// Extracted as pure, sweepable logic per SPEC_FULL.md §9 ("Grace-period
/// policy as data... so tests can sweep it") — both the OCSP validity
/// window and the revocation grace window reduce to this same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceDecision {
    Ok,
    Warn,
    Fail,
}

/// `now <= deadline` is `Ok`; `deadline < now <= deadline + extension_hours`
/// is `Warn`; beyond that is `Fail`.
pub fn validity_decision(now: DateTime<Utc>, deadline: DateTime<Utc>, extension_hours: i64) -> GraceDecision {
    if now <= deadline {
        GraceDecision::Ok
    } else if now <= deadline + chrono::Duration::hours(extension_hours) {
        GraceDecision::Warn
    } else {
        GraceDecision::Fail
    }
}

/// `start..end-1` per §4.3: GPU attestation mode skips the leaf (index 0,
/// already covered by the device cert chain's own signature check and
/// the report's own signature verification) and begins revocation
/// checking at index 1.
fn start_index(mode: ChainMode) -> usize {
    match mode {
        ChainMode::GpuAttestation => 1,
        _ => 0,
    }
}

pub async fn validate_chain_revocation(
    chain: &[X509],
    mode: ChainMode,
    settings: &Settings,
    fetcher: &HttpFetcher,
) -> AttestResult<ValidationOutcome> {
    let mut warnings = Vec::new();
    let start = start_index(mode);
    if chain.len() < 2 {
        // Nothing to validate against an issuer; treat as vacuously ok.
        return Ok(ValidationOutcome { ok: true, warnings });
    }

    for i in start..chain.len() - 1 {
        let subject = &chain[i];
        let issuer = &chain[i + 1];
        let cn = subject_cn(subject);

        let nonce = if settings.ocsp_nonce_enabled {
            Some(random_nonce())
        } else {
            None
        };

        let der_request = build_ocsp_request(subject, issuer, nonce.as_deref())?;

        let response_bytes = fetch_with_fallback(&der_request, settings, fetcher).await?;

        let response = OpensslOcspResponse::from_der(&response_bytes)
            .map_err(|e| AttestError::OcspFetchFailure(format!("could not parse OCSP response: {e}")))?;

        if response.status() != OcspResponseStatus::SUCCESSFUL {
            return Err(AttestError::OcspFetchFailure(format!(
                "OCSP response status not SUCCESSFUL for {cn}"
            )));
        }

        let basic = response
            .basic()
            .map_err(|e| AttestError::OcspFetchFailure(format!("no basic OCSP response for {cn}: {e}")))?;

        if let Some(sent) = &nonce {
            if !basic.nonce_equal(sent) {
                return Err(AttestError::OcspFetchFailure(format!("OCSP nonce mismatch for {cn}")));
            }
        }

        // Break the chain<->OCSP cycle: verify the response's own signing
        // chain without recursing into OCSP again. No external anchor here
        // by design: `issuer` (pushed as the declared root) was already
        // verified against the real trust anchor by the outer chain check,
        // so it's trusted as given rather than re-anchored.
        let mut signing_chain = basic
            .certificates()
            .map(|c| c.to_owned())
            .collect::<Vec<_>>();
        signing_chain.push(issuer.clone());
        certs::verify_chain(&signing_chain, ChainMode::OcspResponse, None)?;

        let mut verify_store = X509StoreBuilder::new()
            .map_err(|e| AttestError::SignatureVerificationFailed(e.to_string()))?;
        verify_store
            .add_cert(issuer.clone())
            .map_err(|e| AttestError::SignatureVerificationFailed(e.to_string()))?;
        let store = verify_store.build();
        let certs_stack = openssl::stack::Stack::new().map_err(|e| AttestError::SignatureVerificationFailed(e.to_string()))?;
        basic
            .verify(&certs_stack, &store, OcspFlag::empty())
            .map_err(|e| AttestError::SignatureVerificationFailed(format!("OCSP response signature invalid for {cn}: {e}")))?;

        let cert_id = OcspCertId::from_cert(MessageDigest::sha384(), subject, issuer)
            .map_err(|e| AttestError::MalformedCertificate(format!("could not build OCSP cert id: {e}")))?;
        let status = basic
            .find_status(&cert_id)
            .ok_or_else(|| AttestError::OcspFetchFailure(format!("no status entry for {cn}")))?;

        let this_update = parse_asn1_time(status.this_update.to_string().as_str())?;
        let next_update = parse_asn1_time(status.next_update.to_string().as_str())?;
        let now = Utc::now();

        if now < this_update {
            return Err(AttestError::OcspFetchFailure(format!("OCSP response for {cn} is not yet valid")));
        }

        match validity_decision(now, next_update, settings.grace.validity_extension) {
            GraceDecision::Ok => {}
            GraceDecision::Warn => warnings.push(format!("OCSP FOR {cn} IS EXPIRED AFTER {next_update}.")),
            GraceDecision::Fail => {
                let extended = next_update + chrono::Duration::hours(settings.grace.validity_extension);
                return Err(AttestError::OcspFetchFailure(format!(
                    "OCSP FOR {cn} IS EXPIRED AND IS NO LONGER VALID FOR ATTESTATION AFTER {extended}."
                )));
            }
        }

        match status.status {
            OcspCertStatus::GOOD => {}
            OcspCertStatus::UNKNOWN => {
                return Err(AttestError::RevocationStatusUnknown { cn });
            }
            OcspCertStatus::REVOKED => {
                let reason = status
                    .revocation_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unspecified".to_string());
                let revocation_time = status
                    .revocation_time
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                warnings.push(format!("THE CERTIFICATE {cn} IS REVOKED FOR '{reason}' AT {revocation_time}."));

                if reason == "certificate_hold" && settings.grace.allow_hold_cert {
                    warnings.push(format!(
                        "THE CERTIFICATE {cn} IS REVOKED FOR '{reason}' BUT STILL GOOD FOR ATTESTATION WITH allow_hold_cert ENABLED."
                    ));
                } else {
                    let ext_hours = settings.grace.extension_for(mode);
                    let rt = parse_asn1_time(&revocation_time).unwrap_or(now);

                    match validity_decision(now, rt, ext_hours) {
                        GraceDecision::Ok | GraceDecision::Warn => {
                            let revocation_time_extended = rt + chrono::Duration::hours(ext_hours);
                            warnings.push(format!(
                                "THE CERTIFICATE {cn} IS REVOKED FOR '{reason}' BUT STILL GOOD FOR ATTESTATION UNTIL {revocation_time_extended} WITH {ext_hours} HOURS OF GRACE PERIOD."
                            ));
                        }
                        GraceDecision::Fail => {
                            let revocation_time_extended = rt + chrono::Duration::hours(ext_hours);
                            return Err(AttestError::RevocationPastGrace {
                                cn: cn.clone(),
                                reason: format!(
                                    "THE CERTIFICATE {cn} IS REVOKED FOR '{reason}' AND NO LONGER GOOD FOR ATTESTATION AFTER {revocation_time_extended}."
                                ),
                            });
                        }
                    }
                }
            }
            _ => return Err(AttestError::OcspFetchFailure(format!("unrecognized OCSP status for {cn}"))),
        }
    }

    Ok(ValidationOutcome { ok: true, warnings })
}

fn subject_cn(cert: &X509) -> String {
    cert.subject_name()
        .entries()
        .find(|e| e.object().nid() == openssl::nid::Nid::COMMONNAME)
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<unknown-cn>".to_string())
}

fn random_nonce() -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn build_ocsp_request(subject: &X509, issuer: &X509, nonce: Option<&[u8]>) -> AttestResult<Vec<u8>> {
    let mut request = OcspRequest::new().map_err(|e| AttestError::MalformedCertificate(e.to_string()))?;
    let cert_id = OcspCertId::from_cert(MessageDigest::sha384(), subject, issuer)
        .map_err(|e| AttestError::MalformedCertificate(format!("could not build OCSP cert id: {e}")))?;
    request
        .add_id(cert_id)
        .map_err(|e| AttestError::MalformedCertificate(e.to_string()))?;
    if let Some(n) = nonce {
        request
            .add_nonce(n)
            .map_err(|e| AttestError::MalformedCertificate(e.to_string()))?;
    }
    request.to_der().map_err(|e| AttestError::MalformedCertificate(e.to_string()))
}

async fn fetch_with_fallback(der_request: &[u8], settings: &Settings, fetcher: &HttpFetcher) -> AttestResult<Vec<u8>> {
    let primary = fetcher
        .post(&settings.ocsp_service_url, der_request.to_vec(), "application/ocsp-request")
        .await;
    match primary {
        Ok(bytes) => Ok(bytes),
        Err(_) => fetcher
            .post(settings.nvidia_ocsp_fallback_url(), der_request.to_vec(), "application/ocsp-request")
            .await
            .map_err(|e| AttestError::OcspFetchFailure(e.to_string())),
    }
}

fn parse_asn1_time(s: &str) -> AttestResult<DateTime<Utc>> {
    // openssl's Asn1Time Display renders RFC-ish "Mon DD HH:MM:SS YYYY GMT".
    DateTime::parse_from_str(s, "%b %e %H:%M:%S %Y GMT")
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AttestError::OcspFetchFailure(format!("could not parse OCSP timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, OcspGraceHours, OcspProfile, Settings};
    use rstest::rstest;

    fn default_settings() -> Settings {
        let args = CliArgs {
            verbose: false,
            test_no_gpu: true,
            driver_rim: None,
            vbios_rim: None,
            user_mode: false,
            allow_hold_cert: false,
            nonce: None,
            rim_root_cert: None,
            rim_service_url: None,
            ocsp_service_url: None,
            ocsp_nonce_enabled: false,
            ocsp_validity_extension: None,
            ocsp_cert_revocation_extension_device: None,
            ocsp_cert_revocation_extension_driver_rim: None,
            ocsp_cert_revocation_extension_vbios_rim: None,
            ocsp_attestation_settings: OcspProfile::Default,
        };
        Settings::from_cli(&args).unwrap()
    }

    #[test]
    fn test_start_index_skips_leaf_for_gpu_attestation() {
        assert_eq!(start_index(ChainMode::GpuAttestation), 1);
        assert_eq!(start_index(ChainMode::DriverRim), 0);
    }

    #[test]
    fn test_grace_table_sourced_from_default_settings() {
        let settings = default_settings();
        assert_eq!(settings.grace.device_extension, 336);
        assert_eq!(settings.grace.vbios_rim_extension, 2160);
    }

    #[test]
    fn test_random_nonce_is_nonempty() {
        let n = random_nonce();
        assert_eq!(n.len(), 16);
    }

    #[rstest]
    #[case(0, GraceDecision::Ok)]
    #[case(1, GraceDecision::Warn)]
    #[case(336, GraceDecision::Warn)]
    #[case(337, GraceDecision::Fail)]
    fn test_grace_boundary_sweep_default_profile_hours(#[case] hours_past_deadline: i64, #[case] expected: GraceDecision) {
        let deadline = Utc::now() - chrono::Duration::hours(1000);
        let now = deadline + chrono::Duration::hours(hours_past_deadline);
        let decision = validity_decision(now, deadline, 336);
        assert_eq!(decision, expected);
    }

    #[rstest]
    #[case(0, GraceDecision::Ok)]
    #[case(2160, GraceDecision::Warn)]
    #[case(2161, GraceDecision::Fail)]
    fn test_grace_boundary_sweep_vbios_rim_extension(#[case] hours_past_deadline: i64, #[case] expected: GraceDecision) {
        let deadline = Utc::now() - chrono::Duration::hours(3000);
        let now = deadline + chrono::Duration::hours(hours_past_deadline);
        let decision = validity_decision(now, deadline, 2160);
        assert_eq!(decision, expected);
    }

    #[rstest]
    #[case(0, GraceDecision::Ok)]
    #[case(1, GraceDecision::Fail)]
    fn test_grace_boundary_sweep_strict_profile_has_no_grace(#[case] hours_past_deadline: i64, #[case] expected: GraceDecision) {
        let strict = OcspGraceHours::for_profile(OcspProfile::Strict);
        let deadline = Utc::now() - chrono::Duration::hours(10);
        let now = deadline + chrono::Duration::hours(hours_past_deadline);
        let decision = validity_decision(now, deadline, strict.validity_extension);
        assert_eq!(decision, expected);
    }

    /// Property 7 ("profile matrix"): anything `default` fails outright
    /// (not via a grace path), `strict` also fails; anything `strict`
    /// accepts, `default` accepts too, since `default`'s windows are a
    /// superset of `strict`'s (zeroed) windows.
    #[test]
    fn test_profile_matrix_default_is_superset_of_strict() {
        let default = OcspGraceHours::for_profile(OcspProfile::Default);
        let strict = OcspGraceHours::for_profile(OcspProfile::Strict);
        assert!(default.validity_extension >= strict.validity_extension);
        assert!(default.device_extension >= strict.device_extension);
        assert!(default.driver_rim_extension >= strict.driver_rim_extension);
        assert!(default.vbios_rim_extension >= strict.vbios_rim_extension);
        assert!(default.allow_hold_cert || !strict.allow_hold_cert);
    }
}
