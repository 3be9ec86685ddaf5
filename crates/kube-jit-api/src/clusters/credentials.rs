//! Credential acquisition for target clusters
//!
//! Each cluster type mints a bearer token plus endpoint and CA:
//! - `gke`: metadata-server OAuth2 token, endpoint and CA from the GKE API
//! - `aks`: managed-identity token for ARM to list user credentials, then an
//!   AAD token for the AKS server application
//! - `generic`: static values from configuration

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::config::Kubeconfig;
use kube::{Api, Client};
use serde::Deserialize;

use crate::config::{ClusterConfig, ClusterType, SecretKeyRef};
use kube_jit_common::Error;

/// GCE metadata endpoint for the default service account token
pub const GKE_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// GKE control plane API
pub const GKE_CONTAINER_API: &str = "https://container.googleapis.com/v1";

/// Azure instance metadata token endpoint
pub const AZURE_IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Azure Resource Manager
pub const AZURE_ARM_URL: &str = "https://management.azure.com";

/// AAD application id of the AKS API server
pub const AKS_SERVER_APP_ID: &str = "6dae42f8-4368-4678-94ff-3960e28e3630";

const AKS_API_VERSION: &str = "2023-08-01";
const IMDS_API_VERSION: &str = "2018-02-01";

/// Credentials for one target cluster
#[derive(Clone)]
pub struct ClusterCredentials {
    /// API server URL
    pub server: String,
    /// Base64-encoded PEM CA bundle
    pub ca_data: Option<String>,
    /// Bearer token
    pub token: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// Instant after which the token must not be used
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("server", &self.server)
            .field("insecure", &self.insecure)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl ClusterCredentials {
    /// Render as a single-context kubeconfig
    pub fn kubeconfig(&self, name: &str) -> Result<Kubeconfig, Error> {
        let mut cluster = serde_json::json!({ "server": self.server });
        if self.insecure {
            cluster["insecure-skip-tls-verify"] = serde_json::Value::Bool(true);
        } else if let Some(ca) = &self.ca_data {
            cluster["certificate-authority-data"] = serde_json::Value::String(ca.clone());
        }
        let doc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": name, "cluster": cluster }],
            "users": [{ "name": name, "user": { "token": self.token } }],
            "contexts": [{ "name": name, "context": { "cluster": name, "user": name } }],
            "current-context": name,
        });
        Kubeconfig::from_yaml(&doc.to_string())
            .map_err(|e| Error::credentials_permanent(name, "kubeconfig", e.to_string()))
    }

    /// Build a kube client from these credentials
    pub async fn client(&self, name: &str) -> Result<Client, Error> {
        kube_jit_common::kube_utils::client_from_kubeconfig(self.kubeconfig(name)?).await
    }
}

/// Source of credentials for one cluster
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Provider kind, for logging
    fn provider(&self) -> ClusterType;

    /// Mint credentials valid at `now`
    async fn fetch(&self, now: DateTime<Utc>) -> Result<ClusterCredentials, Error>;
}

/// Static credentials for `generic` clusters
pub struct GenericCredentials {
    host: String,
    ca: Option<String>,
    insecure: bool,
    token: String,
}

impl GenericCredentials {
    /// Static lifetime of a generic entry
    pub const LIFETIME_HOURS: i64 = 24;

    /// Create from the resolved token
    pub fn new(host: String, ca: Option<String>, insecure: bool, token: String) -> Self {
        Self {
            host,
            ca,
            insecure,
            token,
        }
    }
}

#[async_trait]
impl CredentialSource for GenericCredentials {
    fn provider(&self) -> ClusterType {
        ClusterType::Generic
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<ClusterCredentials, Error> {
        Ok(ClusterCredentials {
            server: self.host.clone(),
            ca_data: self.ca.clone(),
            token: self.token.clone(),
            insecure: self.insecure,
            expires_at: now + Duration::hours(Self::LIFETIME_HOURS),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeCluster {
    endpoint: String,
    master_auth: GkeMasterAuth,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeMasterAuth {
    cluster_ca_certificate: String,
}

/// Credentials for `gke` clusters via the GCE metadata server
pub struct GkeCredentials {
    name: String,
    project: String,
    location: String,
    http: reqwest::Client,
    metadata_token_url: String,
    container_api: String,
}

impl GkeCredentials {
    /// Safety margin subtracted from the token lifetime
    pub const EXPIRY_SKEW_MINUTES: i64 = 5;

    /// Create a GKE source
    pub fn new(name: String, project: String, location: String, http: reqwest::Client) -> Self {
        Self {
            name,
            project,
            location,
            http,
            metadata_token_url: GKE_METADATA_TOKEN_URL.to_string(),
            container_api: GKE_CONTAINER_API.to_string(),
        }
    }

    fn err(&self, msg: impl std::fmt::Display) -> Error {
        Error::credentials(&self.name, "gke", msg.to_string())
    }
}

fn gke_credentials(cluster: GkeCluster, token: OAuthToken, now: DateTime<Utc>) -> ClusterCredentials {
    let lifetime = Duration::seconds(token.expires_in.unwrap_or(3600));
    ClusterCredentials {
        server: format!("https://{}", cluster.endpoint),
        ca_data: Some(cluster.master_auth.cluster_ca_certificate),
        token: token.access_token,
        insecure: false,
        expires_at: now + lifetime - Duration::minutes(GkeCredentials::EXPIRY_SKEW_MINUTES),
    }
}

#[async_trait]
impl CredentialSource for GkeCredentials {
    fn provider(&self) -> ClusterType {
        ClusterType::Gke
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<ClusterCredentials, Error> {
        let token: OAuthToken = self
            .http
            .get(&self.metadata_token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.err(format!("metadata token: {}", e)))?
            .json()
            .await
            .map_err(|e| self.err(format!("metadata token: {}", e)))?;

        let url = format!(
            "{}/projects/{}/locations/{}/clusters/{}",
            self.container_api, self.project, self.location, self.name
        );
        let cluster: GkeCluster = self
            .http
            .get(&url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.err(format!("get cluster: {}", e)))?
            .json()
            .await
            .map_err(|e| self.err(format!("get cluster: {}", e)))?;

        Ok(gke_credentials(cluster, token, now))
    }
}

#[derive(Debug, Deserialize)]
struct AksCredentialResults {
    #[serde(default)]
    kubeconfigs: Vec<AksCredentialResult>,
}

#[derive(Debug, Deserialize)]
struct AksCredentialResult {
    value: String,
}

/// Credentials for `aks` clusters via Azure managed identity
pub struct AksCredentials {
    name: String,
    subscription: String,
    resource_group: String,
    client_id: Option<String>,
    http: reqwest::Client,
    imds_url: String,
    arm_url: String,
}

impl AksCredentials {
    /// Fixed lifetime assumed for AKS tokens
    pub const LIFETIME_HOURS: i64 = 1;

    /// Create an AKS source. `client_id` selects a user-assigned identity.
    pub fn new(
        name: String,
        subscription: String,
        resource_group: String,
        client_id: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            name,
            subscription,
            resource_group,
            client_id,
            http,
            imds_url: AZURE_IMDS_TOKEN_URL.to_string(),
            arm_url: AZURE_ARM_URL.to_string(),
        }
    }

    fn err(&self, msg: impl std::fmt::Display) -> Error {
        Error::credentials(&self.name, "aks", msg.to_string())
    }

    async fn imds_token(&self, resource: &str) -> Result<String, Error> {
        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }
        let token: OAuthToken = self
            .http
            .get(&self.imds_url)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.err(format!("imds token for {}: {}", resource, e)))?
            .json()
            .await
            .map_err(|e| self.err(format!("imds token for {}: {}", resource, e)))?;
        Ok(token.access_token)
    }
}

/// Extract server and CA from the first kubeconfig of a
/// `listClusterUserCredential` response.
fn aks_endpoint(kubeconfig_b64: &str) -> Result<(String, Option<String>), String> {
    let raw = STANDARD
        .decode(kubeconfig_b64.trim())
        .map_err(|e| format!("kubeconfig is not base64: {}", e))?;
    let raw = String::from_utf8(raw).map_err(|e| format!("kubeconfig is not utf-8: {}", e))?;
    let kubeconfig =
        Kubeconfig::from_yaml(&raw).map_err(|e| format!("kubeconfig does not parse: {}", e))?;
    let cluster = kubeconfig
        .clusters
        .into_iter()
        .find_map(|c| c.cluster)
        .ok_or_else(|| "kubeconfig has no clusters".to_string())?;
    let server = cluster
        .server
        .ok_or_else(|| "kubeconfig cluster has no server".to_string())?;
    Ok((server, cluster.certificate_authority_data))
}

#[async_trait]
impl CredentialSource for AksCredentials {
    fn provider(&self) -> ClusterType {
        ClusterType::Aks
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<ClusterCredentials, Error> {
        let arm_token = self.imds_token(&format!("{}/", self.arm_url)).await?;

        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}/listClusterUserCredential?api-version={}",
            self.arm_url, self.subscription, self.resource_group, self.name, AKS_API_VERSION
        );
        let results: AksCredentialResults = self
            .http
            .post(&url)
            .bearer_auth(&arm_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.err(format!("list user credentials: {}", e)))?
            .json()
            .await
            .map_err(|e| self.err(format!("list user credentials: {}", e)))?;

        let first = results
            .kubeconfigs
            .first()
            .ok_or_else(|| self.err("no kubeconfigs returned"))?;
        let (server, ca_data) = aks_endpoint(&first.value).map_err(|e| self.err(e))?;

        let token = self.imds_token(AKS_SERVER_APP_ID).await?;

        Ok(ClusterCredentials {
            server,
            ca_data,
            token,
            insecure: false,
            expires_at: now + Duration::hours(Self::LIFETIME_HOURS),
        })
    }
}

/// Read a bearer token from a Kubernetes Secret
pub async fn read_token_secret(
    client: &Client,
    cluster: &str,
    secret: &SecretKeyRef,
) -> Result<String, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &secret.namespace);
    let found = api.get(&secret.name).await?;
    let bytes = found
        .data
        .and_then(|mut d| d.remove(&secret.key))
        .ok_or_else(|| {
            Error::credentials_permanent(
                cluster,
                "generic",
                format!(
                    "secret {}/{} has no key '{}'",
                    secret.namespace, secret.name, secret.key
                ),
            )
        })?;
    let token = String::from_utf8(bytes.0)
        .map_err(|e| Error::credentials_permanent(cluster, "generic", e.to_string()))?;
    Ok(token.trim().to_string())
}

/// HTTP client used for cloud credential endpoints
pub fn http_client(timeout: StdDuration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::internal_with_context("http_client", e.to_string()))
}

/// Build the credential source for a configured cluster.
///
/// `token` is the already-resolved generic bearer token, if any.
pub fn source_for(
    cluster: &ClusterConfig,
    token: Option<String>,
    http: reqwest::Client,
) -> Result<Box<dyn CredentialSource>, Error> {
    let missing = |field: &str| {
        Error::credentials_permanent(
            &cluster.name,
            cluster.cluster_type.to_string(),
            format!("missing '{}'", field),
        )
    };
    Ok(match cluster.cluster_type {
        ClusterType::Generic => Box::new(GenericCredentials::new(
            cluster.host.clone().ok_or_else(|| missing("host"))?,
            cluster.ca.clone(),
            cluster.insecure,
            token
                .or_else(|| cluster.token.clone())
                .ok_or_else(|| missing("token"))?,
        )),
        ClusterType::Gke => Box::new(GkeCredentials::new(
            cluster.name.clone(),
            cluster.project_id.clone().ok_or_else(|| missing("projectID"))?,
            cluster.region.clone().ok_or_else(|| missing("region"))?,
            http,
        )),
        ClusterType::Aks => Box::new(AksCredentials::new(
            cluster.name.clone(),
            cluster.project_id.clone().ok_or_else(|| missing("projectID"))?,
            cluster.region.clone().ok_or_else(|| missing("region"))?,
            std::env::var("AZURE_CLIENT_ID").ok(),
            http,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn generic_credentials_live_a_day() {
        let source = GenericCredentials::new("https://10.0.0.1:6443".into(), None, true, "t".into());
        let creds = source.fetch(now()).await.unwrap();
        assert_eq!(creds.expires_at, now() + Duration::hours(24));
        assert!(creds.insecure);
        assert_eq!(source.provider(), ClusterType::Generic);
    }

    #[test]
    fn gke_token_expiry_has_five_minute_skew() {
        let creds = gke_credentials(
            GkeCluster {
                endpoint: "34.1.2.3".into(),
                master_auth: GkeMasterAuth {
                    cluster_ca_certificate: "Y2E=".into(),
                },
            },
            OAuthToken {
                access_token: "ya29".into(),
                expires_in: Some(3599),
            },
            now(),
        );
        assert_eq!(creds.server, "https://34.1.2.3");
        assert_eq!(creds.ca_data.as_deref(), Some("Y2E="));
        assert_eq!(
            creds.expires_at,
            now() + Duration::seconds(3599) - Duration::minutes(5)
        );
    }

    #[test]
    fn aks_kubeconfig_yields_server_and_ca() {
        let kubeconfig = r#"
apiVersion: v1
kind: Config
clusters:
  - name: aks
    cluster:
      server: https://aks-dns.hcp.westeurope.azmk8s.io:443
      certificate-authority-data: Y2E=
contexts: []
users: []
"#;
        let (server, ca) = aks_endpoint(&STANDARD.encode(kubeconfig)).unwrap();
        assert_eq!(server, "https://aks-dns.hcp.westeurope.azmk8s.io:443");
        assert_eq!(ca.as_deref(), Some("Y2E="));

        assert!(aks_endpoint("not base64!").is_err());
    }

    #[test]
    fn kubeconfig_carries_token_and_ca() {
        let creds = ClusterCredentials {
            server: "https://10.0.0.1:6443".into(),
            ca_data: Some("Y2E=".into()),
            token: "secret-token".into(),
            insecure: false,
            expires_at: now(),
        };
        let kubeconfig = creds.kubeconfig("lab").unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("lab"));
        let cluster = kubeconfig.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(cluster.certificate_authority_data.as_deref(), Some("Y2E="));
        assert!(!format!("{:?}", creds).contains("secret-token"));
    }

    #[test]
    fn source_for_requires_type_specific_fields() {
        let http = reqwest::Client::new();
        let mut cluster = ClusterConfig {
            name: "lab".into(),
            cluster_type: ClusterType::Generic,
            host: Some("https://10.0.0.1".into()),
            ca: None,
            insecure: false,
            token: None,
            token_secret: None,
            project_id: None,
            region: None,
        };
        assert!(source_for(&cluster, None, http.clone()).is_err());
        assert!(source_for(&cluster, Some("t".into()), http.clone()).is_ok());

        cluster.cluster_type = ClusterType::Gke;
        assert!(source_for(&cluster, None, http).is_err());
    }
}
