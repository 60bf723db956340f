//! CLI entry point for the GPU attestation verifier.
//!
//! Parses arguments, builds the immutable [`config::Settings`], collects
//! evidence, drives the orchestrator across every GPU, signs the
//! resulting claim set, and prints the EAT/JWT to stdout. Exit code 0
//! means every GPU attested successfully; 1 covers every failure kind
//! (configuration, evidence, malformed input, or post-attestation
//! verification failure) per SPEC_FULL.md §7.

use anyhow::Context;
use clap::Parser;
use rand::RngCore;

use gpu_attest_verifier::claims::{self, DevHmacSigner};
use gpu_attest_verifier::config::{CliArgs, Settings};
use gpu_attest_verifier::error::AttestError;
use gpu_attest_verifier::evidence::{EvidenceSource, FixtureEvidenceSource};
use gpu_attest_verifier::http_fetch::HttpFetcher;
use gpu_attest_verifier::observability::{self, AuditEvent};
use gpu_attest_verifier::orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let _guard = observability::init_tracing_default(args.verbose);

    match run(args).await {
        Ok(overall) => {
            if overall {
                std::process::exit(0);
            }
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "attestation run failed");
            eprintln!("error: {e}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<bool> {
    let settings = Settings::from_cli(&args).context("invalid configuration")?;
    let nonce = resolve_nonce(&args)?;
    let fetcher = HttpFetcher::default();

    if !settings.test_no_gpu {
        anyhow::bail!("no real GPU evidence source is available in this build; pass --test_no_gpu");
    }
    let source = FixtureEvidenceSource;
    source.init().await.context("evidence source init failed")?;
    let evidence = source.collect(&nonce).await.context("evidence collection failed")?;
    if evidence.is_empty() {
        return Err(AttestError::NoGpuFound.into());
    }

    let (mut overall, mut gpu_claims) = orchestrator::attest(&evidence, &nonce, &settings, &fetcher).await;
    if !overall {
        if let Some((retry_overall, retry_claims)) = orchestrator::retry(&evidence, &nonce, &settings, &fetcher).await {
            overall = retry_overall;
            gpu_claims = retry_claims;
        }
    }

    if overall && !settings.user_mode {
        for gpu in &evidence {
            source.mark_gpu_ready(&gpu.uuid).await.context("failed to mark GPU ready")?;
        }
    }
    source.close().await.context("evidence source close failed")?;

    let claim_set = claims::build_claims(overall, &nonce, &gpu_claims, chrono::Utc::now().timestamp());
    let signer = DevHmacSigner::default();
    let token = claims::sign(&claim_set, &signer).context("failed to sign claim set")?;

    tracing::info!(event = %AuditEvent::TokenEmitted, overall);
    println!("{token}");

    Ok(overall)
}

fn resolve_nonce(args: &CliArgs) -> anyhow::Result<Vec<u8>> {
    match &args.nonce {
        Some(hex_str) => {
            let bytes = hex::decode(hex_str).context("--nonce must be hex-encoded")?;
            if bytes.len() != gpu_attest_verifier::report::NONCE_LEN {
                anyhow::bail!("--nonce must decode to {} bytes", gpu_attest_verifier::report::NONCE_LEN);
            }
            Ok(bytes)
        }
        None => {
            let mut nonce = vec![0u8; gpu_attest_verifier::report::NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce);
            Ok(nonce)
        }
    }
}

fn exit_code_for(_e: &anyhow::Error) -> i32 {
    1
}
