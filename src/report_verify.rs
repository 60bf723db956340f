//! C5: Attestation Report Verifier.
//!
//! Matches the nonce, driver version, and VBIOS version the report
//! carries against the values the caller expects, then verifies the
//! report's own ECDSA-SHA384 signature using the GPU leaf certificate's
//! public key.

use openssl::hash::MessageDigest;
use openssl::x509::X509;

use crate::error::{AttestError, AttestResult};
use crate::report::{self, AttestationReport, OpaqueTag};

const MAX_NONCE_LEN: usize = 32;

pub fn verify(
    report: &AttestationReport,
    leaf_cert: &X509,
    nonce: &[u8],
    driver_version: &str,
    vbios_version: &str,
) -> AttestResult<()> {
    if nonce.len() > MAX_NONCE_LEN || report.request_nonce.len() > MAX_NONCE_LEN {
        return Err(AttestError::InvalidNonce(format!(
            "nonce length exceeds {MAX_NONCE_LEN} bytes"
        )));
    }

    if report.request_nonce != nonce {
        return Err(AttestError::NonceMismatch {
            expected: hex::encode(nonce),
            actual: hex::encode(&report.request_nonce),
        });
    }

    let report_driver = report::opaque_get_ascii(report, OpaqueTag::DriverVersion).unwrap_or_default();
    if report_driver != driver_version {
        return Err(AttestError::DriverVersionMismatch {
            expected: driver_version.to_string(),
            actual: report_driver,
        });
    }

    let report_vbios_raw = report::opaque_get(report, OpaqueTag::VbiosVersion).unwrap_or(&[]);
    let report_vbios = report::format_vbios_version(report_vbios_raw);
    if report_vbios.to_uppercase() != vbios_version.to_uppercase() {
        return Err(AttestError::VbiosVersionMismatch {
            expected: vbios_version.to_string(),
            actual: report_vbios,
        });
    }

    let pubkey = leaf_cert
        .public_key()
        .map_err(|e| AttestError::SignatureVerificationFailed(format!("invalid leaf public key: {e}")))?;
    let mut verifier = openssl::sign::Verifier::new(MessageDigest::sha384(), &pubkey)
        .map_err(|e| AttestError::SignatureVerificationFailed(e.to_string()))?;
    verifier
        .update(&report.signed_region)
        .map_err(|e| AttestError::SignatureVerificationFailed(e.to_string()))?;
    let valid = verifier
        .verify(&report.signature)
        .map_err(|e| AttestError::SignatureVerificationFailed(e.to_string()))?;
    if !valid {
        return Err(AttestError::SignatureVerificationFailed("report signature does not verify".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn fixture_report(nonce: [u8; 32]) -> AttestationReport {
        AttestationReport {
            version: 1,
            request_nonce: nonce.to_vec(),
            measurements: vec![],
            opaque: {
                let mut m = BTreeMap::new();
                m.insert(OpaqueTag::DriverVersion as u16, b"550.54.15\0".to_vec());
                m.insert(OpaqueTag::VbiosVersion as u16, vec![0x96, 0x00, 0x74, 0x01]);
                m
            },
            signature: vec![],
            signed_region: vec![],
        }
    }

    #[test]
    fn test_nonce_too_long_rejected() {
        let report = fixture_report([0u8; 32]);
        let long_nonce = vec![0u8; 33];
        let err = verify(&report, &dummy_cert(), &long_nonce, "550.54.15", "96.00.74.01").unwrap_err();
        assert!(matches!(err, AttestError::InvalidNonce(_)));
    }

    #[test]
    fn test_nonce_mismatch() {
        let report = fixture_report([1u8; 32]);
        let err = verify(&report, &dummy_cert(), &[2u8; 32], "550.54.15", "96.00.74.01").unwrap_err();
        assert!(matches!(err, AttestError::NonceMismatch { .. }));
    }

    #[test]
    fn test_driver_version_mismatch() {
        let report = fixture_report([0u8; 32]);
        let err = verify(&report, &dummy_cert(), &[0u8; 32], "999.99.99", "96.00.74.01").unwrap_err();
        assert!(matches!(err, AttestError::DriverVersionMismatch { .. }));
    }

    #[test]
    fn test_vbios_version_mismatch() {
        let report = fixture_report([0u8; 32]);
        let err = verify(&report, &dummy_cert(), &[0u8; 32], "550.54.15", "00.00.00.00").unwrap_err();
        assert!(matches!(err, AttestError::VbiosVersionMismatch { .. }));
    }

    fn dummy_cert() -> X509 {
        let pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "dummy").unwrap();
        let name = name.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&pkey, openssl::hash::MessageDigest::sha384()).unwrap();
        builder.build()
    }
}
