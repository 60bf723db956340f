//! C4: RIM Loader & Verifier — Reference Integrity Manifests.
//!
//! A RIM is a signed SWID/CoSWID XML document. This module obtains one
//! (local file or HTTP, mutually exclusive per invocation), schema-checks
//! it, verifies its embedded signing chain and that chain's revocation
//! status, verifies the enveloped XML signature, and exposes golden
//! measurements for C6.

use std::collections::BTreeMap;

use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::x509::X509;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::certs;
use crate::config::{ChainMode, Settings};
use crate::error::{AttestError, AttestResult};
use crate::http_fetch::HttpFetcher;
use crate::ocsp;

pub enum RimSource {
    LocalPath(String),
    Http { rim_id: String },
}

#[derive(Debug, Clone)]
pub struct MeasurementEntry {
    pub index: u32,
    pub name: String,
    pub digests: Vec<Vec<u8>>,
}

pub struct Rim {
    pub manufacturer_id: String,
    pub version: String,
    pub signing_chain: Vec<X509>,
    pub measurements: Vec<MeasurementEntry>,
    xml: String,
}

pub const DRIVER_RIM_PREFIX: &str = "NV_GPU_DRIVER_GH100_";
pub const VBIOS_RIM_PREFIX: &str = "NV_GPU_VBIOS_";

/// `NV_GPU_DRIVER_GH100_<driver_version>`.
pub fn driver_rim_id(driver_version: &str) -> String {
    format!("{DRIVER_RIM_PREFIX}{driver_version}")
}

/// `NV_GPU_VBIOS_<PROJECT>_<PROJECT_SKU>_<CHIP_SKU>_<VBIOS_VERSION_NODOTS>`,
/// all uppercase.
pub fn vbios_rim_id(project: &str, project_sku: &str, chip_sku: &str, vbios_version_nodots: &str) -> String {
    format!(
        "{VBIOS_RIM_PREFIX}{}_{}_{}_{}",
        project.to_uppercase(),
        project_sku.to_uppercase(),
        chip_sku.to_uppercase(),
        vbios_version_nodots.to_uppercase()
    )
}

/// Local on-disk VBIOS RIM filenames use a distinct, lowercase/dotted
/// convention from the HTTP RIM ID — this asymmetry is intentional
/// (SPEC_FULL.md §4.1), not a bug to "fix".
pub fn vbios_rim_local_filename(project: &str, project_sku: &str, chip_sku: &str, vbios_version_dotted: &str) -> String {
    format!(
        "{}_{}_{}_{}.swidtag",
        project.to_lowercase(),
        project_sku.to_lowercase(),
        chip_sku.to_lowercase(),
        vbios_version_dotted.to_lowercase()
    )
}

pub async fn load(source: RimSource, settings: &Settings, fetcher: &HttpFetcher) -> AttestResult<Rim> {
    let xml = match source {
        RimSource::LocalPath(path) => {
            std::fs::read_to_string(&path).map_err(|e| AttestError::FileRead { path, source: e })?
        }
        RimSource::Http { rim_id } => fetch_rim_xml(&rim_id, settings, fetcher).await?,
    };
    parse_rim(&xml)
}

async fn fetch_rim_xml(rim_id: &str, settings: &Settings, fetcher: &HttpFetcher) -> AttestResult<String> {
    let primary_url = format!("{}/{}", settings.rim_service_url, rim_id);
    let bytes = match fetcher.get(&primary_url).await {
        Ok(b) => b,
        Err(_) => {
            let fallback_url = format!("{}/{}", settings.nvidia_rim_fallback_url(), rim_id);
            fetcher
                .get(&fallback_url)
                .await
                .map_err(|e| AttestError::RimFetchError(e.to_string()))?
        }
    };
    let envelope: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| AttestError::RimFetchError(format!("malformed RIM envelope: {e}")))?;
    let b64 = envelope
        .get("rim")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AttestError::RimFetchError("RIM envelope missing 'rim' field".into()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| AttestError::RimFetchError(format!("malformed RIM base64: {e}")))?;
    String::from_utf8(decoded).map_err(|e| AttestError::RimFetchError(format!("RIM xml is not valid utf-8: {e}")))
}

/// Schema-validate (well-formed, expected top-level tags present) and
/// parse into the structured form.
fn parse_rim(xml: &str) -> AttestResult<Rim> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut manufacturer_id = None;
    let mut version = None;
    let mut measurements = Vec::new();
    let mut saw_swid_tag = false;
    let mut saw_payload = false;
    let mut current_index: Option<u32> = None;
    let mut current_name = String::new();
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| AttestError::MalformedRim(format!("XML parse error: {e}")))?
        {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "SoftwareIdentity" => {
                        saw_swid_tag = true;
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            if key.ends_with("version") {
                                version = Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    "Payload" => saw_payload = true,
                    "Meta" => {
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            if key.ends_with("manufacturerId") {
                                manufacturer_id = Some(value);
                            }
                        }
                    }
                    "Directory" | "File" => {
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            if key.ends_with("index") {
                                current_index = value.parse().ok();
                            }
                            if key.ends_with("name") {
                                current_name = value;
                            }
                        }
                    }
                    "Hash" => {
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            if key.ends_with("value") {
                                if let (Some(idx), Ok(digest)) = (current_index, hex::decode(&value)) {
                                    if let Some(entry) =
                                        measurements.iter_mut().find(|m: &&mut MeasurementEntry| m.index == idx)
                                    {
                                        entry.digests.push(digest);
                                    } else {
                                        measurements.push(MeasurementEntry {
                                            index: idx,
                                            name: current_name.clone(),
                                            digests: vec![digest],
                                        });
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(e) if version.is_none() => {
                // SWID version carried as attribute in practice; left here for
                // documents that express it as element text instead.
                let text = e.unescape().unwrap_or_default().to_string();
                if !text.trim().is_empty() && text.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    version = Some(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_swid_tag || !saw_payload {
        return Err(AttestError::MalformedRim("missing SoftwareIdentity/Payload top-level tags".into()));
    }

    measurements.sort_by_key(|m| m.index);

    Ok(Rim {
        manufacturer_id: manufacturer_id.unwrap_or_default(),
        version: version.unwrap_or_default(),
        signing_chain: parse_signing_chain(xml),
        measurements,
        xml: xml.to_string(),
    })
}

/// Collect every `<X509Certificate>` embedded in the document, in document
/// order (`[leaf, …, root]`, matching `certs::verify_chain`'s expectation).
/// A RIM's `<Signature>` carries its whole signing chain this way, not just
/// the leaf — `extract_signature_parts` only needs the first for the
/// signature check itself.
fn parse_signing_chain(xml: &str) -> Vec<X509> {
    let mut certs = Vec::new();
    let mut rest = xml;
    while let Some(start_rel) = rest.find("<X509Certificate>") {
        let start = start_rel + "<X509Certificate>".len();
        let Some(end_rel) = rest[start..].find("</X509Certificate>") else {
            break;
        };
        let end = start + end_rel;
        let b64 = rest[start..end].trim();
        if let Ok(der) = base64::engine::general_purpose::STANDARD.decode(b64) {
            if let Ok(cert) = X509::from_der(&der) {
                certs.push(cert);
            }
        }
        rest = &rest[end..];
    }
    certs
}

fn local_name(qname: &[u8]) -> String {
    let s = String::from_utf8_lossy(qname);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

impl Rim {
    /// Verify the RIM: signing chain (C2) + its revocation (C3) + the
    /// enveloped signature itself + the expected version.
    pub async fn verify(
        &self,
        expected_version: &str,
        component: &str,
        mode: ChainMode,
        settings: &Settings,
        fetcher: &HttpFetcher,
    ) -> AttestResult<Vec<String>> {
        if !self.signing_chain.is_empty() {
            let anchor = settings
                .rim_root_anchor_cert()?
                .ok_or_else(|| AttestError::MissingTrustAnchor { mode: format!("{mode:?}") })?;
            certs::verify_chain(&self.signing_chain, mode, Some(&anchor))?;
            let outcome = ocsp::validate_chain_revocation(&self.signing_chain, mode, settings, fetcher).await?;
            self.verify_signature()?;
            if self.version != expected_version {
                return Err(AttestError::RimVersionMismatch {
                    component: component.to_string(),
                    expected: expected_version.to_string(),
                    actual: self.version.clone(),
                });
            }
            return Ok(outcome.warnings);
        }

        self.verify_signature()?;
        if self.version != expected_version {
            return Err(AttestError::RimVersionMismatch {
                component: component.to_string(),
                expected: expected_version.to_string(),
                actual: self.version.clone(),
            });
        }
        Ok(Vec::new())
    }

    /// Verify the enveloped XML signature over the canonicalized document
    /// with the `<Signature>` element excluded.
    fn verify_signature(&self) -> AttestResult<()> {
        let (signed_bytes, signature, leaf) = match self.extract_signature_parts() {
            Some(parts) => parts,
            None => return Err(AttestError::RimSignatureVerificationFailed("no Signature element found".into())),
        };

        let pubkey = leaf
            .public_key()
            .map_err(|e| AttestError::RimSignatureVerificationFailed(format!("invalid RIM signer public key: {e}")))?;

        let mut verifier = openssl::sign::Verifier::new(MessageDigest::sha384(), &pubkey)
            .map_err(|e| AttestError::RimSignatureVerificationFailed(e.to_string()))?;
        verifier
            .update(signed_bytes.as_bytes())
            .map_err(|e| AttestError::RimSignatureVerificationFailed(e.to_string()))?;
        let valid = verifier
            .verify(&signature)
            .map_err(|e| AttestError::RimSignatureVerificationFailed(e.to_string()))?;
        if !valid {
            return Err(AttestError::RimSignatureVerificationFailed("signature does not verify".into()));
        }
        Ok(())
    }

    fn extract_signature_parts(&self) -> Option<(String, Vec<u8>, X509)> {
        let sig_start = self.xml.find("<Signature")?;
        let sig_end = self.xml.find("</Signature>")? + "</Signature>".len();
        let canonical_without_sig = format!("{}{}", &self.xml[..sig_start], &self.xml[sig_end..]);

        let sig_block = &self.xml[sig_start..sig_end];
        let value_start = sig_block.find("<SignatureValue>")? + "<SignatureValue>".len();
        let value_end = sig_block.find("</SignatureValue>")?;
        let b64 = sig_block[value_start..value_end].trim();
        let signature = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;

        let cert_start = sig_block.find("<X509Certificate>")? + "<X509Certificate>".len();
        let cert_end = sig_block.find("</X509Certificate>")?;
        let cert_b64 = sig_block[cert_start..cert_end].trim();
        let cert_der = base64::engine::general_purpose::STANDARD.decode(cert_b64).ok()?;
        let leaf = X509::from_der(&cert_der).ok()?;

        Some((canonical_without_sig, signature, leaf))
    }

    pub fn golden_measurements(&self) -> &[MeasurementEntry] {
        &self.measurements
    }
}

/// Union driver-RIM and VBIOS-RIM golden measurement sets, failing on any
/// index present (with conflicting digest sets) in both.
pub fn union_golden_measurements(
    driver: &[MeasurementEntry],
    vbios: &[MeasurementEntry],
) -> AttestResult<BTreeMap<u32, Vec<Vec<u8>>>> {
    let mut merged: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();
    for entry in driver {
        merged.insert(entry.index, entry.digests.clone());
    }
    for entry in vbios {
        if let Some(existing) = merged.get(&entry.index) {
            if existing != &entry.digests {
                return Err(AttestError::MeasurementConflict { index: entry.index });
            }
        } else {
            merged.insert(entry.index, entry.digests.clone());
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_rim_id_format() {
        assert_eq!(driver_rim_id("550.54.15"), "NV_GPU_DRIVER_GH100_550.54.15");
    }

    #[test]
    fn test_vbios_rim_id_uppercase_nodots() {
        let id = vbios_rim_id("gh100", "sku1", "chip1", "96007401");
        assert_eq!(id, "NV_GPU_VBIOS_GH100_SKU1_CHIP1_96007401");
    }

    #[test]
    fn test_vbios_local_filename_lowercase_dotted() {
        let name = vbios_rim_local_filename("GH100", "SKU1", "CHIP1", "96.00.74.01");
        assert_eq!(name, "gh100_sku1_chip1_96.00.74.01.swidtag");
    }

    #[test]
    fn test_rejects_missing_swid_tags() {
        let err = parse_rim("<NotARim/>").unwrap_err();
        assert!(matches!(err, AttestError::MalformedRim(_)));
    }

    #[test]
    fn test_union_measurements_no_conflict() {
        let driver = vec![MeasurementEntry { index: 0, name: "a".into(), digests: vec![vec![1]] }];
        let vbios = vec![MeasurementEntry { index: 1, name: "b".into(), digests: vec![vec![2]] }];
        let merged = union_golden_measurements(&driver, &vbios).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_union_measurements_conflict_fails() {
        let driver = vec![MeasurementEntry { index: 0, name: "a".into(), digests: vec![vec![1]] }];
        let vbios = vec![MeasurementEntry { index: 0, name: "a".into(), digests: vec![vec![9]] }];
        let err = union_golden_measurements(&driver, &vbios).unwrap_err();
        assert!(matches!(err, AttestError::MeasurementConflict { index: 0 }));
    }

    fn self_signed_der(cn: &str) -> Vec<u8> {
        let pkey = openssl::pkey::PKey::from_ec_key(
            openssl::ec::EcKey::generate(&openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::SECP384R1).unwrap())
                .unwrap(),
        )
        .unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&pkey, MessageDigest::sha384()).unwrap();
        builder.build().to_der().unwrap()
    }

    #[test]
    fn test_parse_signing_chain_collects_every_cert_in_order() {
        let leaf_der = self_signed_der("leaf");
        let root_der = self_signed_der("root");
        let leaf_b64 = base64::engine::general_purpose::STANDARD.encode(&leaf_der);
        let root_b64 = base64::engine::general_purpose::STANDARD.encode(&root_der);
        let xml = format!(
            "<Signature><X509Certificate>{leaf_b64}</X509Certificate><X509Certificate>{root_b64}</X509Certificate></Signature>"
        );
        let chain = parse_signing_chain(&xml);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].to_der().unwrap(), leaf_der);
        assert_eq!(chain[1].to_der().unwrap(), root_der);
    }

    #[test]
    fn test_parse_rim_reads_version_attribute_off_software_identity() {
        let xml = r#"<SoftwareIdentity version="550.54.15"><Payload/></SoftwareIdentity>"#;
        let rim = parse_rim(xml).unwrap();
        assert_eq!(rim.version, "550.54.15");
    }

    #[tokio::test]
    async fn test_verify_fails_closed_without_rim_root_anchor() {
        let leaf_der = self_signed_der("leaf");
        let leaf_b64 = base64::engine::general_purpose::STANDARD.encode(&leaf_der);
        let xml = format!(
            r#"<SoftwareIdentity version="1"><Payload/></SoftwareIdentity><Signature><SignatureValue>AA==</SignatureValue><X509Certificate>{leaf_b64}</X509Certificate></Signature>"#
        );
        let rim = parse_rim(&xml).unwrap();
        assert!(!rim.signing_chain.is_empty());

        let args = crate::config::CliArgs {
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
            ocsp_attestation_settings: crate::config::OcspProfile::Default,
        };
        let settings = Settings::from_cli(&args).unwrap();
        let fetcher = HttpFetcher::default();
        let err = rim.verify("1", "driver", ChainMode::DriverRim, &settings, &fetcher).await.unwrap_err();
        assert!(matches!(err, AttestError::MissingTrustAnchor { .. }));
    }
}
