// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TLS bootstrap for the control-plane listener.
//!
//! Builds one [`rustls::ServerConfig`] per process from a password-protected
//! PKCS12 bundle, with an explicit cipher-suite list. Every failure here is
//! fatal to bring-up: a control plane must not silently run with weaker
//! transport security, so there is no partial-success state and no retry.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use p12::PFX;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedProtocolVersion};

use crate::config::TlsConfig;

/// Owner of the process-wide TLS server context.
///
/// Built exactly once at bootstrap; the listener receives shared handles via
/// [`TlsContext::server_config`] and the context is released when the owner
/// drops.
#[derive(Debug)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Builds the server context from the certificate bundle named by
    /// `config`. Any failure (missing file, empty password, unparsable or
    /// password-mismatched bundle, key/cert mismatch, unsupported cipher
    /// list) is an error the caller must treat as fatal.
    pub fn init(config: &TlsConfig) -> Result<Self> {
        let path = Path::new(&config.server_cert_path);
        if !path.exists() {
            bail!(
                "the server_cert_path value {} does not exist",
                path.display()
            );
        }
        if config.server_password.is_empty() {
            bail!("the server_password value is empty");
        }

        let bundle = fs::read(path)
            .with_context(|| format!("reading certificate bundle {}", path.display()))?;
        let pfx = PFX::parse(&bundle)
            .map_err(|err| anyhow::anyhow!("parsing PKCS12 bundle: {err:?}"))?;
        if !pfx.verify_mac(&config.server_password) {
            bail!(
                "PKCS12 MAC verification failed for {}; wrong password",
                path.display()
            );
        }

        let certs: Vec<CertificateDer<'static>> = pfx
            .cert_bags(&config.server_password)
            .map_err(|err| anyhow::anyhow!("extracting certificates: {err:?}"))?
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        if certs.is_empty() {
            bail!("certificate bundle holds no certificates");
        }
        let key_der = pfx
            .key_bags(&config.server_password)
            .map_err(|err| anyhow::anyhow!("extracting private key: {err:?}"))?
            .into_iter()
            .next()
            .context("certificate bundle holds no private key")?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let provider = restricted_provider(&config.cipher_list)?;

        // the private key must belong to the leaf certificate
        let signing_key = provider
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|err| anyhow::anyhow!("unusable private key: {err}"))?;
        CertifiedKey::new(certs.clone(), signing_key)
            .keys_match()
            .map_err(|err| anyhow::anyhow!("private key does not match certificate: {err}"))?;

        let versions = supported_versions(&provider);
        let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)
            .context("cipher list supports no TLS protocol version")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("installing certificate chain and private key")?;

        tracing::info!(
            bundle = %path.display(),
            suites = config.cipher_list.len(),
            "TLS server context initialized"
        );
        Ok(TlsContext {
            server_config: Arc::new(server_config),
        })
    }

    /// Shared handle for the listener. The listener must not outlive the
    /// owning context.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

impl Drop for TlsContext {
    fn drop(&mut self) {
        tracing::debug!("TLS server context released");
    }
}

/// Builds a crypto provider restricted to exactly the configured suites.
/// Implicit defaults are not permitted: an empty list or an unknown suite
/// name is an error.
fn restricted_provider(cipher_list: &[String]) -> Result<CryptoProvider> {
    if cipher_list.is_empty() {
        bail!("the cipher_list value is empty; an explicit cipher list is required");
    }
    let base = rustls::crypto::aws_lc_rs::default_provider();
    let mut suites = Vec::with_capacity(cipher_list.len());
    for name in cipher_list {
        match base
            .cipher_suites
            .iter()
            .find(|suite| format!("{:?}", suite.suite()) == *name)
        {
            Some(suite) => suites.push(*suite),
            None => bail!("unsupported cipher suite {name:?}"),
        }
    }
    Ok(CryptoProvider {
        cipher_suites: suites,
        ..base
    })
}

/// Protocol versions actually covered by the restricted suite set.
fn supported_versions(provider: &CryptoProvider) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
    if provider
        .cipher_suites
        .iter()
        .any(|suite| matches!(suite, rustls::SupportedCipherSuite::Tls12(_)))
    {
        versions.push(&rustls::version::TLS12);
    }
    if provider
        .cipher_suites
        .iter()
        .any(|suite| matches!(suite, rustls::SupportedCipherSuite::Tls13(_)))
    {
        versions.push(&rustls::version::TLS13);
    }
    versions
}
