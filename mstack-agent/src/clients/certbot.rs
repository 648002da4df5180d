//! Certificate issuance via certbot (webroot challenge).

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info};

use super::{run_tool, CertificateIssuer};
use crate::error::AdapterError;
use crate::model::Certificate;

/// Issues certificates with certbot and reads them back with openssl.
pub struct CertbotIssuer {
    webroot: PathBuf,
    live_dir: PathBuf,
    staging: bool,
}

impl CertbotIssuer {
    pub fn new(webroot: PathBuf, live_dir: PathBuf, staging: bool) -> Self {
        Self {
            webroot,
            live_dir,
            staging,
        }
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.live_dir.join(domain).join("cert.pem")
    }
}

#[async_trait]
impl CertificateIssuer for CertbotIssuer {
    async fn issue(
        &self,
        domain: &str,
        email: &str,
        renew_before: chrono::Duration,
    ) -> Result<Certificate, AdapterError> {
        if let Some(existing) = self.inspect(domain).await? {
            if !existing.expires_within(renew_before, Utc::now()) {
                debug!(domain, not_after = %existing.not_after, "Certificate still valid, not renewing");
                return Ok(existing);
            }
        }

        let webroot = self.webroot.to_string_lossy();
        let mut args = vec![
            "certonly",
            "--webroot",
            "-w",
            webroot.as_ref(),
            "-d",
            domain,
            "--email",
            email,
            "--agree-tos",
            "--non-interactive",
            "--force-renewal",
        ];
        if self.staging {
            args.push("--staging");
        }

        info!(domain, "Requesting certificate");
        run_tool("certbot", &args)
            .await
            .map_err(AdapterError::Issuance)?;

        self.inspect(domain).await?.ok_or_else(|| {
            AdapterError::Issuance(format!(
                "certbot succeeded but {} does not exist",
                self.cert_path(domain).display()
            ))
        })
    }

    async fn inspect(&self, domain: &str) -> Result<Option<Certificate>, AdapterError> {
        let path = self.cert_path(domain);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                return Err(AdapterError::Issuance(format!(
                    "cannot access {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        let path_str = path.to_string_lossy();
        let text = run_tool(
            "openssl",
            &[
                "x509",
                "-in",
                path_str.as_ref(),
                "-noout",
                "-issuer",
                "-startdate",
                "-enddate",
                "-fingerprint",
                "-sha256",
            ],
        )
        .await
        .map_err(AdapterError::Issuance)?;

        parse_x509_text(domain, &text).map(Some)
    }
}

/// Parse the `key=value` lines printed by `openssl x509 -noout ...`.
pub fn parse_x509_text(domain: &str, text: &str) -> Result<Certificate, AdapterError> {
    let mut issuer = None;
    let mut not_before = None;
    let mut not_after = None;
    let mut fingerprint = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "issuer" => issuer = Some(value.to_string()),
            "notBefore" => not_before = Some(parse_openssl_date(value)?),
            "notAfter" => not_after = Some(parse_openssl_date(value)?),
            k if k.to_ascii_lowercase().ends_with("fingerprint") => {
                fingerprint = Some(value.to_string())
            }
            _ => {}
        }
    }

    let missing = |field: &str| AdapterError::Issuance(format!("openssl output lacks {}", field));
    Ok(Certificate {
        domain: domain.to_string(),
        issuer: issuer.ok_or_else(|| missing("issuer"))?,
        not_before: not_before.ok_or_else(|| missing("notBefore"))?,
        not_after: not_after.ok_or_else(|| missing("notAfter"))?,
        fingerprint: fingerprint.ok_or_else(|| missing("fingerprint"))?,
    })
}

/// `Mar  5 12:00:00 2025 GMT`
fn parse_openssl_date(value: &str) -> Result<DateTime<Utc>, AdapterError> {
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = normalized.trim_end_matches(" GMT");
    NaiveDateTime::parse_from_str(trimmed, "%b %d %H:%M:%S %Y")
        .map(|t| t.and_utc())
        .map_err(|e| AdapterError::Issuance(format!("bad certificate date '{}': {}", value, e)))
}
