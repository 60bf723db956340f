//! C7: Attestation Orchestrator.
//!
//! Drives the per-GPU state machine, owns the `Settings` and a fresh
//! `VerificationLedger` per GPU, invokes C1..C6 in the fixed order the
//! state machine demands, and aggregates into the Claim Map C8 consumes.
//! Mirrors the teacher's `validator.rs` gate-sequence-then-AND-reduce
//! shape, generalized from nine fixed governance gates to this fixed
//! nine-state attestation pipeline.

use openssl::x509::X509;

use crate::certs;
use crate::config::{ChainMode, Settings};
use crate::error::AttestError;
use crate::evidence::GpuEvidence;
use crate::http_fetch::HttpFetcher;
use crate::measurements;
use crate::observability::AuditEvent;
use crate::report::{self, OpaqueTag};
use crate::report_verify;
use crate::rim::{self, RimSource};

/// Monotonic per-GPU state. No step may observe a later step's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpuState {
    Init,
    ArchOk,
    ReportParsed,
    ChainOk,
    ChainRevocationOk,
    ReportVerified,
    DriverRimOk,
    VbiosRimOk,
    MeasurementsOk,
    Done,
}

/// A bag of boolean marks updated only by the orchestrator; components
/// return outcomes, never mutate this directly (§9).
#[derive(Debug, Clone, Default)]
pub struct VerificationLedger {
    pub arch_ok: bool,
    pub report_parsed: bool,
    pub chain_ok: bool,
    pub chain_revocation_ok: bool,
    pub report_verified: bool,
    pub driver_rim_ok: bool,
    pub vbios_rim_ok: bool,
    pub measurements_ok: bool,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct GpuClaim {
    pub uuid: String,
    pub hw_model: Option<String>,
    pub ueid: Option<String>,
    pub oem_id: Option<String>,
    pub overall: bool,
    pub ledger: VerificationLedger,
    pub warnings: Vec<String>,
    pub failure_reason: Option<String>,
    pub state_reached: GpuState,
}

/// Run the full pipeline for every GPU in `evidence`, aggregating
/// `overall = ∧ per_gpu_overall`. Claim-map insertion is serialized here
/// (a single `Vec` built up sequentially); §5 permits per-GPU
/// parallelism but forbids sharing mutable `Settings` across tasks, which
/// this sequential default sidesteps entirely.
pub async fn attest(
    evidence: &[GpuEvidence],
    nonce: &[u8],
    settings: &Settings,
    fetcher: &HttpFetcher,
) -> (bool, Vec<GpuClaim>) {
    tracing::info!(event = %AuditEvent::RunStarted, gpu_count = evidence.len());

    let mut claims = Vec::with_capacity(evidence.len());
    let mut overall = true;

    for gpu in evidence {
        let span = tracing::info_span!("gpu_attestation", uuid = %gpu.uuid);
        let _enter = span.enter();
        let claim = attest_one(gpu, nonce, settings, fetcher).await;
        overall &= claim.overall;
        if claim.overall {
            tracing::info!(event = %AuditEvent::GpuVerified, uuid = %gpu.uuid);
        } else {
            tracing::warn!(event = %AuditEvent::GpuFailed, uuid = %gpu.uuid, reason = ?claim.failure_reason);
        }
        claims.push(claim);
    }

    (overall, claims)
}

/// Retry a single whole-attestation round after a transient Evidence
/// Source failure. Bounded to exactly one retry, and — unlike the source
/// material's broken `retry()` — takes the same `(evidence, nonce,
/// settings)` triple as the initial attempt (SPEC_FULL.md §9, resolved
/// Open Question ii).
pub async fn retry(
    evidence: &[GpuEvidence],
    nonce: &[u8],
    settings: &Settings,
    fetcher: &HttpFetcher,
) -> Option<(bool, Vec<GpuClaim>)> {
    if !settings.is_retry_allowed {
        return None;
    }
    Some(attest(evidence, nonce, settings, fetcher).await)
}

async fn attest_one(gpu: &GpuEvidence, nonce: &[u8], settings: &Settings, fetcher: &HttpFetcher) -> GpuClaim {
    let mut ledger = VerificationLedger::default();
    let mut warnings = Vec::new();
    let mut state = GpuState::Init;

    macro_rules! fail {
        ($err:expr) => {
            return GpuClaim {
                uuid: gpu.uuid.clone(),
                hw_model: None,
                ueid: None,
                oem_id: None,
                overall: false,
                ledger,
                warnings,
                failure_reason: Some($err.to_string()),
                state_reached: state,
            }
        };
    }

    if gpu.architecture != "HOPPER" {
        fail!(AttestError::UnsupportedGpuArchitecture(gpu.architecture.clone()));
    }
    ledger.arch_ok = true;
    state = GpuState::ArchOk;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    let report = match report::parse_report(&gpu.attestation_report_bytes) {
        Ok(r) => r,
        Err(e) => fail!(e),
    };
    ledger.report_parsed = true;
    state = GpuState::ReportParsed;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    let chain = match gpu.cert_chain() {
        Ok(c) => c,
        Err(e) => fail!(e),
    };

    let mut hw_model = certs::second_cert_cn(&chain);
    let ueid = chain.first().and_then(|leaf| certs::leaf_serial_hex(leaf).ok());

    if let Err(e) = verify_chain_with_fwid(&chain, &report, settings) {
        fail!(e);
    } else if chain.first().is_some() {
        let leaf_der = chain[0].to_der().unwrap_or_default();
        if let Ok(None) = certs::extract_fwid(&leaf_der) {
            warnings.push("FWID EXTENSION ABSENT ON LEAF CERTIFICATE; SKIPPING FWID CROSS-CHECK".to_string());
        }
    }
    ledger.chain_ok = true;
    state = GpuState::ChainOk;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    match crate::ocsp::validate_chain_revocation(&chain, ChainMode::GpuAttestation, settings, fetcher).await {
        Ok(outcome) => warnings.extend(outcome.warnings),
        Err(e) => fail!(e),
    }
    ledger.chain_revocation_ok = true;
    state = GpuState::ChainRevocationOk;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    let leaf = match chain.first() {
        Some(l) => l,
        None => fail!(AttestError::NoCertificates),
    };
    if let Err(e) = report_verify::verify(&report, leaf, nonce, &gpu.driver_version, &gpu.vbios_version) {
        fail!(e);
    }
    ledger.report_verified = true;
    state = GpuState::ReportVerified;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    let project = report::opaque_get_ascii(&report, OpaqueTag::Project).unwrap_or_default();
    let project_sku = report::opaque_get_ascii(&report, OpaqueTag::ProjectSku).unwrap_or_default();
    let chip_sku = report::opaque_get_ascii(&report, OpaqueTag::ChipSku).unwrap_or_default();
    let vbios_raw = report::opaque_get(&report, OpaqueTag::VbiosVersion).unwrap_or(&[]);

    let driver_source = match &settings.driver_rim_path {
        Some(path) => RimSource::LocalPath(path.clone()),
        None => RimSource::Http { rim_id: rim::driver_rim_id(&gpu.driver_version) },
    };
    let driver_rim = match rim::load(driver_source, settings, fetcher).await {
        Ok(r) => r,
        Err(e) => fail!(e),
    };
    match driver_rim
        .verify(&gpu.driver_version, "driver", ChainMode::DriverRim, settings, fetcher)
        .await
    {
        Ok(w) => warnings.extend(w),
        Err(e) => fail!(e),
    }
    let mut oem_id = Some(driver_rim.manufacturer_id.clone()).filter(|s| !s.is_empty());
    ledger.driver_rim_ok = true;
    state = GpuState::DriverRimOk;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    let vbios_nodots = report::format_vbios_version_nodots(vbios_raw);
    let vbios_source = match &settings.vbios_rim_path {
        Some(path) => RimSource::LocalPath(path.clone()),
        None => RimSource::Http { rim_id: rim::vbios_rim_id(&project, &project_sku, &chip_sku, &vbios_nodots) },
    };
    let vbios_rim = match rim::load(vbios_source, settings, fetcher).await {
        Ok(r) => r,
        Err(e) => fail!(e),
    };
    match vbios_rim
        .verify(&gpu.vbios_version, "vbios", ChainMode::VbiosRim, settings, fetcher)
        .await
    {
        Ok(w) => warnings.extend(w),
        Err(e) => fail!(e),
    }
    if oem_id.is_none() {
        oem_id = Some(vbios_rim.manufacturer_id.clone()).filter(|s| !s.is_empty());
    }
    ledger.vbios_rim_ok = true;
    state = GpuState::VbiosRimOk;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    let golden = match rim::union_golden_measurements(driver_rim.golden_measurements(), vbios_rim.golden_measurements()) {
        Ok(g) => g,
        Err(e) => fail!(e),
    };
    if let Err(e) = measurements::compare(&report.measurements, &golden) {
        fail!(e);
    }
    ledger.measurements_ok = true;
    state = GpuState::MeasurementsOk;
    tracing::debug!(event = %AuditEvent::GpuStateTransition, state = ?state);

    ledger.done = true;
    state = GpuState::Done;

    if hw_model.is_none() {
        hw_model = certs::second_cert_cn(&chain);
    }

    GpuClaim {
        uuid: gpu.uuid.clone(),
        hw_model,
        ueid,
        oem_id,
        overall: true,
        ledger,
        warnings,
        failure_reason: None,
        state_reached: state,
    }
}

fn verify_chain_with_fwid(
    chain: &[X509],
    report: &crate::report::AttestationReport,
    settings: &Settings,
) -> Result<(), AttestError> {
    let anchor = settings.device_root_anchor_cert()?;
    certs::verify_chain(chain, ChainMode::GpuAttestation, Some(&anchor))?;

    let report_fwid = report::opaque_get(report, OpaqueTag::Fwid);
    if let (Some(expected), Some(leaf)) = (report_fwid, chain.first()) {
        if !expected.is_empty() {
            let leaf_der = leaf.to_der().map_err(|e| AttestError::MalformedCertificate(e.to_string()))?;
            if let Some(actual) = certs::extract_fwid(&leaf_der)? {
                if actual != expected {
                    return Err(AttestError::CertChainVerificationFailure {
                        index: 0,
                        reason: "FWID mismatch between leaf certificate and report".into(),
                    });
                }
            }
        }
    }
    Ok(())
}
