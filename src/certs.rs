//! C2: Certificate Chain Verifier.
//!
//! Walks a chain from its trust anchor (the last entry, `[leaf, …, root]`)
//! toward the leaf, growing an `X509Store` one certificate at a time so
//! each cert is verified against everything already trusted. FWID
//! extraction reads the TCG DICE FWID extension via `x509_parser` (the
//! `openssl` crate has no generic by-OID extension accessor).

use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};
use x509_parser::der_parser::oid;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::ChainMode;
use crate::error::{AttestError, AttestResult};

/// Hopper-class GPU attestation chains must be exactly this long.
pub const GPU_ATTESTATION_CHAIN_LEN: usize = 5;

const FWID_DIGEST_LEN: usize = 48;

/// Verify a `[leaf, …, root]` chain. `anchor`, when given, is an external
/// trust anchor that `chain`'s own declared root must itself chain to —
/// every certificate in `chain`, including the last one, is verified
/// against a store seeded with `anchor`. When `anchor` is `None`, `chain`'s
/// own last element is trusted as given instead (used only for the OCSP
/// response's own signing chain, whose trust derives from the outer chain
/// already anchored by the caller — see `ocsp::validate_chain_revocation`).
pub fn verify_chain(chain: &[X509], mode: ChainMode, anchor: Option<&X509>) -> AttestResult<()> {
    if chain.is_empty() {
        return Err(AttestError::NoCertificates);
    }
    if mode == ChainMode::GpuAttestation && chain.len() != GPU_ATTESTATION_CHAIN_LEN {
        return Err(AttestError::WrongCertCount {
            expected: GPU_ATTESTATION_CHAIN_LEN,
            actual: chain.len(),
        });
    }
    if has_duplicate(chain) {
        return Err(AttestError::MalformedCertificate("duplicate certificate in chain".into()));
    }

    // With an external anchor, every entry in `chain` (including the
    // declared root) must verify up to it. Without one, the declared root
    // is trusted as given and only the certs above it are walked.
    let verify_upto = if anchor.is_some() { chain.len() } else { chain.len() - 1 };
    let mut trusted: Vec<X509> = match anchor {
        Some(a) => vec![a.clone()],
        None => vec![chain.last().expect("non-empty, checked above").clone()],
    };

    for idx in (0..verify_upto).rev() {
        let mut store_builder = X509StoreBuilder::new()
            .map_err(|e| AttestError::MalformedCertificate(format!("store init failed: {e}")))?;
        for t in &trusted {
            store_builder
                .add_cert(t.clone())
                .map_err(|e| AttestError::MalformedCertificate(format!("could not seed store: {e}")))?;
        }
        let store = store_builder.build();

        let cert = &chain[idx];
        let mut ctx = X509StoreContext::new()
            .map_err(|e| AttestError::CertChainVerificationFailure { index: idx, reason: e.to_string() })?;

        let chain_stack = {
            let mut stack = Stack::new()
                .map_err(|e| AttestError::CertChainVerificationFailure { index: idx, reason: e.to_string() })?;
            stack
                .push(cert.clone())
                .map_err(|e| AttestError::CertChainVerificationFailure { index: idx, reason: e.to_string() })?;
            stack
        };

        let ok = ctx
            .init(&store, cert, &chain_stack, |c| c.verify_cert())
            .map_err(|e| AttestError::CertChainVerificationFailure { index: idx, reason: e.to_string() })?;

        if !ok {
            let mut reason = ctx.error().error_string().to_string();
            if anchor.is_some() && idx == chain.len() - 1 {
                reason = format!("root certificate does not chain to the configured trust anchor: {reason}");
            }
            return Err(AttestError::CertChainVerificationFailure { index: idx, reason });
        }

        trusted.push(cert.clone());
    }

    Ok(())
}

fn has_duplicate(chain: &[X509]) -> bool {
    for i in 0..chain.len() {
        for j in (i + 1)..chain.len() {
            if chain[i].to_der().ok() == chain[j].to_der().ok() {
                return true;
            }
        }
    }
    false
}

/// Extract the FWID extension's digest (last 48 bytes of its octet
/// string). Returns `None` when the extension is absent — the caller
/// (orchestrator) decides whether that warrants a warning.
pub fn extract_fwid(leaf_der: &[u8]) -> AttestResult<Option<Vec<u8>>> {
    let (_, cert) = X509Certificate::from_der(leaf_der)
        .map_err(|e| AttestError::MalformedCertificate(format!("could not parse leaf cert: {e}")))?;

    let fwid_oid = oid!(2.23.133.5.4.1);

    for ext in cert.extensions() {
        if ext.oid == fwid_oid {
            let value = ext.value;
            if value.len() < FWID_DIGEST_LEN {
                return Ok(Some(value.to_vec()));
            }
            return Ok(Some(value[value.len() - FWID_DIGEST_LEN..].to_vec()));
        }
    }
    Ok(None)
}

/// Leaf certificate's serial number, used as the report's UEID claim.
pub fn leaf_serial_hex(leaf: &X509) -> AttestResult<String> {
    let serial = leaf
        .serial_number()
        .to_bn()
        .map_err(|e| AttestError::MalformedCertificate(format!("could not read serial: {e}")))?;
    Ok(hex::encode(serial.to_vec()))
}

/// The second certificate's CN, used as the hardware model claim.
pub fn second_cert_cn(chain: &[X509]) -> Option<String> {
    let second = chain.get(1)?;
    second
        .subject_name()
        .entries()
        .find(|e| e.object().nid() == openssl::nid::Nid::COMMONNAME)
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_is_no_certificates() {
        let err = verify_chain(&[], ChainMode::GpuAttestation, None).unwrap_err();
        assert!(matches!(err, AttestError::NoCertificates));
    }

    #[test]
    fn test_wrong_cert_count_for_gpu_attestation() {
        // Three certificates is not a valid length for a Hopper GPU_ATTESTATION chain.
        // Use dummy self-signed-shaped stand-ins; the length check fires before any
        // cryptographic work happens.
        let pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let cert = build_self_signed(&pkey, "leaf");
        let chain = vec![cert.clone(), cert.clone(), cert];
        let err = verify_chain(&chain, ChainMode::GpuAttestation, None).unwrap_err();
        assert!(matches!(err, AttestError::WrongCertCount { expected: 5, actual: 3 }));
    }

    fn build_self_signed(pkey: &openssl::pkey::PKey<openssl::pkey::Private>, cn: &str) -> X509 {
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(pkey).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(pkey, openssl::hash::MessageDigest::sha384()).unwrap();
        builder.build()
    }

    #[test]
    fn test_duplicate_certs_rejected() {
        let pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let cert = build_self_signed(&pkey, "dup");
        let chain: Vec<X509> = vec![cert.clone(), cert.clone(), cert.clone(), cert.clone(), cert];
        let err = verify_chain(&chain, ChainMode::GpuAttestation, None).unwrap_err();
        assert!(matches!(err, AttestError::MalformedCertificate(_)));
    }

    #[test]
    fn test_root_matching_anchor_is_trusted() {
        let pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let root = build_self_signed(&pkey, "anchor-root");
        let chain = vec![root.clone()];
        verify_chain(&chain, ChainMode::DriverRim, Some(&root)).unwrap();
    }

    #[test]
    fn test_root_not_matching_anchor_is_untrusted() {
        let pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let root = build_self_signed(&pkey, "declared-root");
        let other_pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let real_anchor = build_self_signed(&other_pkey, "real-anchor");
        let chain = vec![root];
        let err = verify_chain(&chain, ChainMode::DriverRim, Some(&real_anchor)).unwrap_err();
        assert!(matches!(err, AttestError::CertChainVerificationFailure { .. }));
    }
}
