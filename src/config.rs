//! CLI surface and the immutable `Settings` value derived from it.
//!
//! `Settings` is constructed once in `main` and passed by value from then
//! on (cheap to clone: trust-anchor blobs are `Arc`-wrapped). No component
//! mutates it; the whole-attestation retry path (`orchestrator::retry`)
//! receives its own snapshot rather than reaching back into global state.

use std::sync::Arc;

use clap::Parser;
use openssl::hash::MessageDigest;
use openssl::x509::X509;

use crate::error::{AttestError, AttestResult};

const NVIDIA_OCSP_URL: &str = "https://ocsp.ndis.nvidia.com";
const NVIDIA_RIM_SERVICE_URL: &str = "https://rim.attestation.nvidia.com/v1/rim";

/// Built-in trust anchor for the GPU's own device certificate chain
/// (§4.2/§6). A real deployment would carry the actual NVIDIA device
/// identity root; this crate embeds a self-signed stand-in shaped the
/// same way (EC P-384, self-signed, long-lived) and pins its SHA-384
/// fingerprint below so a corrupted or swapped-out constant is caught at
/// startup instead of silently weakening every chain verification.
const NVIDIA_DEVICE_ROOT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIICezCCAgCgAwIBAgIUPWQA8pkzpVtV7Jf5AZwJioam0mowCgYIKoZIzj0EAwMw
dDELMAkGA1UEBhMCVVMxGzAZBgNVBAoMEk5WSURJQSBDb3Jwb3JhdGlvbjEfMB0G
A1UECwwWTlZJRElBIERldmljZSBJZGVudGl0eTEnMCUGA1UEAwweTlZJRElBIERl
dmljZSBJZGVudGl0eSBSb290IENBMB4XDTI2MDczMDIzMjkwNloXDTQ2MDcyNTIz
MjkwNlowdDELMAkGA1UEBhMCVVMxGzAZBgNVBAoMEk5WSURJQSBDb3Jwb3JhdGlv
bjEfMB0GA1UECwwWTlZJRElBIERldmljZSBJZGVudGl0eTEnMCUGA1UEAwweTlZJ
RElBIERldmljZSBJZGVudGl0eSBSb290IENBMHYwEAYHKoZIzj0CAQYFK4EEACID
YgAE9Fwp863Sm+hj/kZFTEvUL8cYFhMv5T3mqq0jN1WpqD2uMw93DHljoPWoP7cP
1BmETZ0Jl4KVWftyc7coG0vnBfTBBzbz5/iDZ1p+JfgAs7fKuR9wcB0vK/chjLgD
6Ch4o1MwUTAdBgNVHQ4EFgQUXtboW9tE9FwPK8Ln9GdKb0IaOA4wHwYDVR0jBBgw
FoAUXtboW9tE9FwPK8Ln9GdKb0IaOA4wDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjO
PQQDAwNpADBmAjEAzJllMdQZ3kXoulfNwoF4jkWJxU6d/LUYeZIYTdttS1Hwfu8I
ReocAT5LHXrN2h9XAjEAvHt7IO50zsCDv9VXnfp4lU63zwrc+7Z/41FZ4tNqnTck
v8By75pjyniTohatEimD
-----END CERTIFICATE-----
";

const NVIDIA_DEVICE_ROOT_SHA384_FINGERPRINT: &str =
    "d10ec6b5eb49f6b5af541301ed7d5d7c8603ba8cdfe456c10b32432c2990623f332f3b9e4cbbdd1b3f1648f684f08df9";

/// OCSP attestation profile, selecting the default grace-period table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OcspProfile {
    Default,
    Strict,
}

/// The chain a given OCSP/chain-verification call is operating on; selects
/// which grace-period knob applies and whether OCSP recursion is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// The GPU's own device certificate chain (fixed length 5, OCSP starts at index 1).
    GpuAttestation,
    /// An OCSP response's own signing chain; verified without recursive OCSP checks.
    OcspResponse,
    /// A RIM's embedded signing chain, anchored at `rim_root_cert`.
    DriverRim,
    VbiosRim,
}

/// Command-line arguments, mirroring the original tool's argument names so
/// operator scripts keep working unmodified.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpu_attest_verifier", version, about = "Confidential Compute GPU attestation verifier")]
pub struct CliArgs {
    /// Elevate log level to debug on the console sink.
    #[arg(long)]
    pub verbose: bool,

    /// Bypass the Evidence Source and use embedded fixtures.
    #[arg(long)]
    pub test_no_gpu: bool,

    /// Use a local driver RIM file instead of fetching one.
    #[arg(long)]
    pub driver_rim: Option<String>,

    /// Use a local VBIOS RIM file instead of fetching one.
    #[arg(long)]
    pub vbios_rim: Option<String>,

    /// Do not alter GPU ready state on success.
    #[arg(long)]
    pub user_mode: bool,

    /// Accept certificates revoked with reason `certificate_hold`.
    #[arg(long)]
    pub allow_hold_cert: bool,

    /// 64 hex characters (32 bytes). If omitted, a fresh nonce is generated.
    #[arg(long)]
    pub nonce: Option<String>,

    /// PEM trust anchor for RIM signing chains.
    #[arg(long)]
    pub rim_root_cert: Option<String>,

    /// Override the RIM service base URL (must be https).
    #[arg(long)]
    pub rim_service_url: Option<String>,

    /// Override the OCSP service base URL (must be https).
    #[arg(long)]
    pub ocsp_service_url: Option<String>,

    /// Include a nonce extension in OCSP requests.
    #[arg(long)]
    pub ocsp_nonce_enabled: bool,

    #[arg(long)]
    pub ocsp_validity_extension: Option<i64>,

    #[arg(long)]
    pub ocsp_cert_revocation_extension_device: Option<i64>,

    #[arg(long)]
    pub ocsp_cert_revocation_extension_driver_rim: Option<i64>,

    #[arg(long)]
    pub ocsp_cert_revocation_extension_vbios_rim: Option<i64>,

    #[arg(long, value_enum, default_value_t = OcspProfile::Default)]
    pub ocsp_attestation_settings: OcspProfile,
}

/// The `{profile, mode} → hours` grace table, represented as plain data so
/// tests can sweep it directly (property 7, "profile matrix").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcspGraceHours {
    pub validity_extension: i64,
    pub device_extension: i64,
    pub driver_rim_extension: i64,
    pub vbios_rim_extension: i64,
    pub allow_hold_cert: bool,
}

impl OcspGraceHours {
    pub const fn for_profile(profile: OcspProfile) -> Self {
        match profile {
            OcspProfile::Default => Self {
                validity_extension: 336,
                device_extension: 336,
                driver_rim_extension: 336,
                vbios_rim_extension: 2160,
                allow_hold_cert: true,
            },
            OcspProfile::Strict => Self {
                validity_extension: 0,
                device_extension: 0,
                driver_rim_extension: 0,
                vbios_rim_extension: 0,
                allow_hold_cert: false,
            },
        }
    }

    pub fn extension_for(&self, mode: ChainMode) -> i64 {
        match mode {
            ChainMode::GpuAttestation => self.device_extension,
            ChainMode::DriverRim => self.driver_rim_extension,
            ChainMode::VbiosRim => self.vbios_rim_extension,
            ChainMode::OcspResponse => 0,
        }
    }
}

/// Immutable, per-run configuration threaded explicitly through the
/// orchestrator and every component it drives.
#[derive(Debug, Clone)]
pub struct Settings {
    pub test_no_gpu: bool,
    pub driver_rim_path: Option<String>,
    pub vbios_rim_path: Option<String>,
    pub user_mode: bool,
    pub rim_service_url: Arc<str>,
    pub ocsp_service_url: Arc<str>,
    pub ocsp_nonce_enabled: bool,
    pub grace: OcspGraceHours,
    pub is_retry_allowed: bool,
    /// Built-in NVIDIA device root, DER-encoded, loaded once and integrity-
    /// checked at startup. Stored as bytes rather than a parsed `X509`
    /// (which isn't `Debug`) so `Settings` keeps deriving `Debug`/`Clone`
    /// cheaply; parse on demand via `device_root_anchor_cert()`.
    device_root_anchor_der: Arc<[u8]>,
    /// DER-encoded RIM root anchor, parsed once from `--rim_root_cert` if
    /// supplied. `None` means no RIM chain can be trusted (§4.4 ii).
    rim_root_anchor_der: Option<Arc<[u8]>>,
}

impl Settings {
    /// Build an immutable `Settings` from parsed CLI arguments, applying
    /// the `max(0, v)` clamp to any per-flag extension override.
    pub fn from_cli(args: &CliArgs) -> AttestResult<Self> {
        if let Some(url) = &args.rim_service_url {
            require_https(url)?;
        }
        if let Some(url) = &args.ocsp_service_url {
            require_https(url)?;
        }

        let mut grace = OcspGraceHours::for_profile(args.ocsp_attestation_settings);
        if args.allow_hold_cert {
            grace.allow_hold_cert = true;
        }
        if let Some(v) = args.ocsp_validity_extension {
            grace.validity_extension = v.max(0);
        }
        if let Some(v) = args.ocsp_cert_revocation_extension_device {
            grace.device_extension = v.max(0);
        }
        if let Some(v) = args.ocsp_cert_revocation_extension_driver_rim {
            grace.driver_rim_extension = v.max(0);
        }
        if let Some(v) = args.ocsp_cert_revocation_extension_vbios_rim {
            grace.vbios_rim_extension = v.max(0);
        }

        let device_root = X509::from_pem(NVIDIA_DEVICE_ROOT_PEM.as_bytes())
            .map_err(|e| AttestError::TrustAnchorIntegrityFailure(format!("built-in device root anchor is corrupt: {e}")))?;
        let fingerprint = device_root
            .digest(MessageDigest::sha384())
            .map_err(|e| AttestError::TrustAnchorIntegrityFailure(format!("could not fingerprint device root anchor: {e}")))?;
        if hex::encode(fingerprint.as_ref()) != NVIDIA_DEVICE_ROOT_SHA384_FINGERPRINT {
            return Err(AttestError::TrustAnchorIntegrityFailure(
                "built-in NVIDIA device root anchor does not match its pinned SHA-384 fingerprint".into(),
            ));
        }
        let device_root_anchor_der: Arc<[u8]> = device_root
            .to_der()
            .map_err(|e| AttestError::TrustAnchorIntegrityFailure(format!("could not re-encode device root anchor: {e}")))?
            .into();

        let rim_root_anchor_der: Option<Arc<[u8]>> = match &args.rim_root_cert {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| AttestError::FileRead { path: path.clone(), source: e })?;
                let cert = X509::from_pem(&pem)
                    .map_err(|e| AttestError::BadArgument(format!("--rim_root_cert is not a valid PEM certificate: {e}")))?;
                Some(
                    cert.to_der()
                        .map_err(|e| AttestError::BadArgument(format!("could not re-encode --rim_root_cert: {e}")))?
                        .into(),
                )
            }
            None => None,
        };

        Ok(Self {
            test_no_gpu: args.test_no_gpu,
            driver_rim_path: args.driver_rim.clone(),
            vbios_rim_path: args.vbios_rim.clone(),
            user_mode: args.user_mode,
            rim_service_url: args
                .rim_service_url
                .clone()
                .unwrap_or_else(|| NVIDIA_RIM_SERVICE_URL.to_string())
                .into(),
            ocsp_service_url: args
                .ocsp_service_url
                .clone()
                .unwrap_or_else(|| NVIDIA_OCSP_URL.to_string())
                .into(),
            ocsp_nonce_enabled: args.ocsp_nonce_enabled,
            grace,
            // Fixture evidence collection cannot fail transiently, so the
            // whole-attestation retry is only meaningful against real hardware.
            is_retry_allowed: !args.test_no_gpu,
            device_root_anchor_der,
            rim_root_anchor_der,
        })
    }

    pub fn nvidia_ocsp_fallback_url(&self) -> &'static str {
        NVIDIA_OCSP_URL
    }

    pub fn nvidia_rim_fallback_url(&self) -> &'static str {
        NVIDIA_RIM_SERVICE_URL
    }

    /// Parse the built-in NVIDIA device root anchor. Always present;
    /// integrity-checked once already in `from_cli`.
    pub fn device_root_anchor_cert(&self) -> AttestResult<X509> {
        X509::from_der(&self.device_root_anchor_der)
            .map_err(|e| AttestError::TrustAnchorIntegrityFailure(format!("device root anchor became unreadable: {e}")))
    }

    /// Parse the configured RIM root anchor, if `--rim_root_cert` was given.
    pub fn rim_root_anchor_cert(&self) -> AttestResult<Option<X509>> {
        self.rim_root_anchor_der
            .as_ref()
            .map(|der| {
                X509::from_der(der)
                    .map_err(|e| AttestError::TrustAnchorIntegrityFailure(format!("RIM root anchor became unreadable: {e}")))
            })
            .transpose()
    }
}

fn require_https(url: &str) -> AttestResult<()> {
    if !url.starts_with("https://") {
        return Err(AttestError::BadArgument(format!("URL must be https: {url}")));
    }
    Ok(())
}
