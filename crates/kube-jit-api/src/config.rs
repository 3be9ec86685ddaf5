//! API configuration file
//!
//! Mounted as YAML; lists the target clusters and the access policy.
//!
//! ```yaml
//! clusters:
//!   - name: prod-gke
//!     type: gke
//!     projectID: my-project
//!     region: europe-west1
//!   - name: lab
//!     type: generic
//!     host: https://10.0.0.1:6443
//!     ca: LS0tLS1CRUdJTi...
//!     tokenSecret: { name: lab-token, namespace: kube-jit, key: token }
//! allowedRoles: [edit, view]
//! platformApproverTeams:
//!   - { id: 1234, name: platform }
//! adminTeams:
//!   - { id: "5678", name: sre }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::permissions::Team;

/// Contents of the API configuration file
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Target clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// ClusterRoles users may request
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Teams that may approve any request
    #[serde(default)]
    pub platform_approver_teams: Vec<Team>,
    /// Teams with platform approver authority plus administrative sweeps
    #[serde(default)]
    pub admin_teams: Vec<Team>,
}

impl ApiConfig {
    /// Read and validate the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Internal(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: ApiConfig = serde_yaml::from_str(raw)
            .map_err(|e| Error::BadRequest(format!("invalid api config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(Error::BadRequest("cluster with empty name".into()));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(Error::BadRequest(format!(
                    "duplicate cluster '{}'",
                    cluster.name
                )));
            }
            cluster.validate()?;
        }
        Ok(())
    }

    /// Look up a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// How credentials for a cluster are obtained
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Google Kubernetes Engine via the metadata server
    Gke,
    /// Azure Kubernetes Service via managed identity
    Aks,
    /// Static host, CA and bearer token
    Generic,
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gke => write!(f, "gke"),
            Self::Aks => write!(f, "aks"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Reference to a key in a Kubernetes Secret
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Data key holding the token
    #[serde(default = "default_token_key")]
    pub key: String,
}

fn default_token_key() -> String {
    "token".to_string()
}

/// One target cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name, also the GKE/AKS resource name
    pub name: String,
    /// Credential provider
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,
    /// API server URL (generic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Base64-encoded CA bundle (generic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// Skip TLS verification (generic)
    #[serde(default)]
    pub insecure: bool,
    /// Inline bearer token (generic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Secret holding the bearer token (generic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<SecretKeyRef>,
    /// GCP project (gke) or Azure subscription id (aks)
    #[serde(default, rename = "projectID", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// GCP location (gke) or Azure resource group (aks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Error::BadRequest(format!(
                "cluster '{}' ({}) requires '{}'",
                self.name, self.cluster_type, field
            ))
        };
        match self.cluster_type {
            ClusterType::Generic => {
                if self.host.is_none() {
                    return Err(missing("host"));
                }
                if self.token.is_none() && self.token_secret.is_none() {
                    return Err(missing("token or tokenSecret"));
                }
            }
            ClusterType::Gke | ClusterType::Aks => {
                if self.project_id.is_none() {
                    return Err(missing("projectID"));
                }
                if self.region.is_none() {
                    return Err(missing("region"));
                }
            }
        }
        Ok(())
    }
}

/// SameSite attribute for session cookies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SameSite {
    /// `SameSite=Lax`
    #[default]
    Lax,
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=None`
    None,
}

impl std::str::FromStr for SameSite {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lax" => Ok(Self::Lax),
            "strict" => Ok(Self::Strict),
            "none" => Ok(Self::None),
            other => Err(format!("invalid SameSite value '{}'", other)),
        }
    }
}

impl std::fmt::Display for SameSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lax => write!(f, "Lax"),
            Self::Strict => write!(f, "Strict"),
            Self::None => write!(f, "None"),
        }
    }
}

/// Parse the `--allow-origins` JSON array
pub fn parse_origins(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| Error::BadRequest(format!("allow-origins must be a JSON array: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
clusters:
  - name: prod-gke
    type: gke
    projectID: my-project
    region: europe-west1
  - name: prod-aks
    type: aks
    projectID: 00000000-0000-0000-0000-000000000000
    region: rg-prod
  - name: lab
    type: generic
    host: https://10.0.0.1:6443
    ca: Y2E=
    insecure: true
    tokenSecret: { name: lab-token, namespace: kube-jit }
allowedRoles: [edit, view]
platformApproverTeams:
  - { id: 1234, name: platform }
adminTeams:
  - { id: "5678", name: sre }
"#;

    #[test]
    fn parses_full_config() {
        let config = ApiConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.clusters.len(), 3);
        assert_eq!(config.allowed_roles, vec!["edit", "view"]);

        let lab = config.cluster("lab").unwrap();
        assert_eq!(lab.cluster_type, ClusterType::Generic);
        assert!(lab.insecure);
        assert_eq!(lab.token_secret.as_ref().unwrap().key, "token");

        let aks = config.cluster("prod-aks").unwrap();
        assert_eq!(aks.region.as_deref(), Some("rg-prod"));
    }

    #[test]
    fn numeric_team_ids_become_strings() {
        let config = ApiConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.platform_approver_teams[0].id, "1234");
        assert_eq!(config.admin_teams[0].id, "5678");
    }

    #[test]
    fn rejects_generic_cluster_without_token() {
        let err = ApiConfig::from_yaml(
            r#"
clusters:
  - name: lab
    type: generic
    host: https://10.0.0.1:6443
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("token or tokenSecret"));
    }

    #[test]
    fn rejects_duplicate_cluster_names() {
        let err = ApiConfig::from_yaml(
            r#"
clusters:
  - { name: a, type: generic, host: "https://a", token: t }
  - { name: a, type: generic, host: "https://b", token: t }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate cluster 'a'"));
    }

    #[test]
    fn same_site_parsing() {
        assert_eq!("strict".parse::<SameSite>().unwrap(), SameSite::Strict);
        assert_eq!("None".parse::<SameSite>().unwrap(), SameSite::None);
        assert!("sometimes".parse::<SameSite>().is_err());
    }

    #[test]
    fn origins_are_a_json_array() {
        assert_eq!(
            parse_origins(r#"["https://a.example.com"]"#).unwrap(),
            vec!["https://a.example.com"]
        );
        assert!(parse_origins("").unwrap().is_empty());
        assert!(parse_origins("https://a").is_err());
    }
}
