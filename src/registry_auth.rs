use crate::config::Registry;
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use globset::{Glob, GlobMatcher};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, warn};

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub credentials: Option<Credentials>,
    pub insecure: bool,
}

impl AuthContext {
    pub fn anonymous(insecure: bool) -> Self {
        Self {
            credentials: None,
            insecure,
        }
    }
}

pub trait AuthResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        image: &ImageReference,
        namespace: &str,
        insecure: bool,
    ) -> impl Future<Output = Result<Vec<AuthContext>>> + Send;
}

struct RegistryMatcher {
    matcher: GlobMatcher,
    credentials: Credentials,
}

/// Resolves credentials from the static config and from the pull secrets in the Image's
/// namespace.
pub struct KubeAuthResolver {
    client: Client,
    registries: Vec<RegistryMatcher>,
}

impl KubeAuthResolver {
    pub fn new(client: Client, registries: &[Registry]) -> Result<Self> {
        let registries = registries
            .iter()
            .map(|r| -> Result<RegistryMatcher> {
                let matcher = Glob::new(&r.hostname)
                    .with_context(|| format!("Invalid registry hostname pattern {}", r.hostname))?
                    .compile_matcher();
                Ok(RegistryMatcher {
                    matcher,
                    credentials: Credentials {
                        username: r.username.clone().unwrap_or_default(),
                        password: r.token.clone(),
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { client, registries })
    }

    fn configured_credentials(&self, registry: &str) -> Vec<Credentials> {
        self.registries
            .iter()
            .filter(|r| r.matcher.is_match(registry))
            .map(|r| r.credentials.clone())
            .collect()
    }
}

impl AuthResolver for KubeAuthResolver {
    async fn resolve(
        &self,
        image: &ImageReference,
        namespace: &str,
        insecure: bool,
    ) -> Result<Vec<AuthContext>> {
        let mut credentials = self.configured_credentials(&image.registry);

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("type={}", DOCKER_CONFIG_JSON_TYPE));
        let secret_list = secrets
            .list(&lp)
            .await
            .with_context(|| format!("Failed to list pull secrets in namespace {}", namespace))?;

        for secret in secret_list.items {
            match credentials_from_secret(&secret, &image.registry) {
                Ok(Some(c)) => credentials.push(c),
                Ok(None) => {}
                Err(e) => warn!(
                    "Skipping secret {}/{}: {:#}",
                    namespace,
                    secret.name_any(),
                    e
                ),
            }
        }

        debug!(
            "Resolved {} credentialed contexts for registry {}",
            credentials.len(),
            image.registry
        );
        Ok(build_contexts(credentials, insecure))
    }
}

fn build_contexts(credentials: Vec<Credentials>, insecure: bool) -> Vec<AuthContext> {
    std::iter::once(AuthContext::anonymous(insecure))
        .chain(credentials.into_iter().map(|c| AuthContext {
            credentials: Some(c),
            insecure,
        }))
        .collect()
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    username: Option<String>,
    password: Option<SecretString>,
    auth: Option<SecretString>,
}

fn credentials_from_secret(secret: &Secret, registry: &str) -> Result<Option<Credentials>> {
    let Some(raw) = secret
        .data
        .as_ref()
        .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
    else {
        return Ok(None);
    };
    credentials_from_docker_config(&raw.0, registry)
}

fn credentials_from_docker_config(raw: &[u8], registry: &str) -> Result<Option<Credentials>> {
    let config: DockerConfig =
        serde_json::from_slice(raw).context("Failed to parse docker config json")?;
    let Some(auth) = config
        .auths
        .iter()
        .find(|(server, _)| registry_host(server) == registry)
        .map(|(_, auth)| auth)
    else {
        return Ok(None);
    };

    if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
        return Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }));
    }

    let encoded = auth
        .auth
        .as_ref()
        .context("Docker config entry has neither username/password nor auth")?;
    let decoded = general_purpose::STANDARD
        .decode(encoded.expose_secret())
        .context("Docker config auth field is not valid base64")?;
    let decoded = String::from_utf8(decoded).context("Docker config auth field is not UTF-8")?;
    let (username, password) = decoded
        .split_once(':')
        .context("Docker config auth field is not in user:password form")?;
    Ok(Some(Credentials {
        username: username.to_string(),
        password: SecretString::new(password),
    }))
}

/// Docker config keys may be bare hosts or URLs like `https://index.docker.io/v1/`.
fn registry_host(server: &str) -> &str {
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        h => h,
    }
}
