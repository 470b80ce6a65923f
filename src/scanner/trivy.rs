use super::Scanner;
use crate::config::ScannerConfig;
use crate::crd::Vulnerability;
use crate::image_reference::ImageReference;
use crate::registry_auth::AuthContext;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

// credentials from the controller's own environment must not leak into anonymous attempts
const PASSTHROUGH_ENV: &[&str] = &["HOME", "PATH", "TRIVY_CACHE_DIR"];

/// Runs the trivy CLI against a registry.
pub struct Trivy {
    binary: String,
    severities: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Report {
    #[serde(default)]
    results: Option<Vec<ReportResult>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportResult {
    #[serde(default)]
    vulnerabilities: Option<Vec<ReportVulnerability>>,
}

#[derive(Deserialize)]
struct ReportVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "Title", default)]
    title: String,
}

impl Trivy {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            binary: config.trivy_path.clone(),
            severities: config.severities.clone(),
        }
    }

    fn environment(&self, auth: &AuthContext) -> Vec<(&'static str, String)> {
        let mut env = vec![("TRIVY_SEVERITY", self.severities.clone())];
        if auth.insecure {
            env.push(("TRIVY_INSECURE", "true".to_string()));
        }
        if let Some(credentials) = &auth.credentials {
            env.push(("TRIVY_USERNAME", credentials.username.clone()));
            env.push((
                "TRIVY_PASSWORD",
                credentials.password.expose_secret().to_string(),
            ));
        }
        env
    }

    async fn run(&self, image: &ImageReference, auth: &AuthContext) -> Result<Vec<u8>> {
        let output = Command::new(&self.binary)
            .args(["--quiet", "image", "--format", "json"])
            .arg(image.to_string())
            .env_clear()
            .envs(std::env::vars().filter(|(k, _)| PASSTHROUGH_ENV.contains(&k.as_str())))
            .envs(self.environment(auth))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!(
                "trivy exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

impl Scanner for Trivy {
    async fn scan(
        &self,
        image: &ImageReference,
        auths: &[AuthContext],
    ) -> Result<Vec<Vulnerability>> {
        let mut errors = Vec::new();
        for (attempt, auth) in auths.iter().enumerate() {
            debug!("Scanning {} with auth context {:?}", image, auth);
            let stdout = match self.run(image, auth).await {
                Ok(stdout) => stdout,
                Err(e) => {
                    warn!("Scan attempt {} for {} failed: {:#}", attempt + 1, image, e);
                    errors.push(format!("{:#}", e));
                    continue;
                }
            };
            let vulnerabilities = parse_report(&stdout)?;
            info!(
                "Scanned {}, found {} vulnerabilities",
                image,
                vulnerabilities.len()
            );
            return Ok(vulnerabilities);
        }
        anyhow::bail!("unable to scan image: {}", errors.join("; "))
    }
}

fn parse_report(raw: &[u8]) -> Result<Vec<Vulnerability>> {
    let report: Report = serde_json::from_slice(raw).context("error unmarshaling report")?;
    Ok(report
        .results
        .unwrap_or_default()
        .into_iter()
        .flat_map(|r| r.vulnerabilities.unwrap_or_default())
        .map(|v| Vulnerability {
            id: v.id,
            severity: v.severity,
            description: v.title,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_auth::Credentials;
    use crate::secret_string::SecretString;

    fn reference() -> ImageReference {
        ImageReference::parse(
            "quay.io/org/app@sha256:4bf0b5cb6ac1a2c5a3c4fd84a4d0f4b0c1e88c3c4d2e2f0a1b2c3d4e5f607182",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_report() {
        let raw = br#"{
            "SchemaVersion": 2,
            "Results": [
                {"Target": "os", "Vulnerabilities": [
                    {"VulnerabilityID": "CVE-1", "Severity": "HIGH", "Title": "x"},
                    {"VulnerabilityID": "CVE-2", "Severity": "MEDIUM"}
                ]},
                {"Target": "lang"}
            ]
        }"#;
        let vulnerabilities = parse_report(raw).unwrap();
        assert_eq!(
            vulnerabilities,
            vec![
                Vulnerability {
                    id: "CVE-1".to_string(),
                    severity: "HIGH".to_string(),
                    description: "x".to_string(),
                },
                Vulnerability {
                    id: "CVE-2".to_string(),
                    severity: "MEDIUM".to_string(),
                    description: String::new(),
                },
            ]
        );
        assert!(parse_report(b"{}").unwrap().is_empty());
        assert!(parse_report(b"garbage").is_err());
    }

    #[test]
    fn test_environment() {
        let trivy = Trivy::new(&ScannerConfig::default());
        let env = trivy.environment(&AuthContext::anonymous(false));
        assert_eq!(
            env,
            vec![("TRIVY_SEVERITY", "MEDIUM,HIGH,CRITICAL".to_string())]
        );

        let env = trivy.environment(&AuthContext {
            credentials: Some(Credentials {
                username: "u".to_string(),
                password: SecretString::new("p"),
            }),
            insecure: true,
        });
        assert!(env.contains(&("TRIVY_INSECURE", "true".to_string())));
        assert!(env.contains(&("TRIVY_USERNAME", "u".to_string())));
        assert!(env.contains(&("TRIVY_PASSWORD", "p".to_string())));
    }

    #[tokio::test]
    async fn test_scan_aggregates_failures() {
        let trivy = Trivy::new(&ScannerConfig {
            trivy_path: "/nonexistent/trivy".to_string(),
            ..Default::default()
        });
        let auths = vec![AuthContext::anonymous(false), AuthContext::anonymous(true)];
        let err = trivy.scan(&reference(), &auths).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("unable to scan image"));
        assert_eq!(message.matches("Failed to execute").count(), 2);
    }

    #[tokio::test]
    async fn test_scan_without_contexts_fails() {
        let trivy = Trivy::new(&ScannerConfig::default());
        assert!(trivy.scan(&reference(), &[]).await.is_err());
    }
}
