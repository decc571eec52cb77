//! Credential validation against the Proxmox VE API
//!
//! Login requests for non-local realms (pam, pve, ldap, ad) are validated
//! by requesting an authentication ticket from the designated auth node's
//! HTTPS API. The same API serves realm enumeration for the login form.
//! Proxmox nodes commonly run with self-signed certificates, so
//! certificate verification is disabled on this client.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use zfsync_common::{Error, Node, Result};

const PROXMOX_API_PORT: u16 = 8006;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A user validated by the Proxmox API
#[derive(Debug, Clone)]
pub struct ProxmoxUser {
    /// `username@realm`
    pub userid: String,
    pub username: String,
    pub realm: String,
    pub email: Option<String>,
    pub is_admin: bool,
}

/// One authentication realm advertised by the hypervisor
#[derive(Debug, Clone, Serialize)]
pub struct RealmInfo {
    pub realm: String,
    #[serde(rename = "type")]
    pub realm_type: String,
    pub comment: String,
    pub default: bool,
}

/// `https://host:port/api2/json` for a node, honoring an explicit
/// `api_endpoint` override.
pub fn api_base_url(node: &Node) -> String {
    match node.api_endpoint.as_deref() {
        Some(endpoint) => format!("{}/api2/json", endpoint.trim_end_matches('/')),
        None => format!("https://{}:{}/api2/json", node.hostname, PROXMOX_API_PORT),
    }
}

/// Ticket-based authentication against the Proxmox VE API
pub struct ProxmoxAuthService {
    http: reqwest::Client,
}

impl ProxmoxAuthService {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build Proxmox API client ({}), using defaults", e);
                reqwest::Client::new()
            });

        Self { http }
    }

    /// Validate credentials by requesting a ticket, then resolve the
    /// user's details and privileges.
    pub async fn authenticate(
        &self,
        node: &Node,
        username: &str,
        password: &str,
        realm: &str,
    ) -> Result<ProxmoxUser> {
        let userid = format!("{}@{}", username, realm);
        let api_url = api_base_url(node);

        let response = self
            .http
            .post(format!("{}/access/ticket", api_url))
            .form(&[("username", userid.as_str()), ("password", password)])
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Cannot reach Proxmox API on {}: {}", node.name, e)))?;

        if !response.status().is_success() {
            warn!("Proxmox auth failed for {} against {}", userid, node.name);
            return Err(Error::Unauthorized);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Invalid Proxmox API response: {}", e)))?;

        let data = &body["data"];
        let ticket = data["ticket"]
            .as_str()
            .ok_or(Error::Unauthorized)?
            .to_string();
        let csrf_token = data["CSRFPreventionToken"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let user_info = self.user_info(&api_url, &userid, &ticket, &csrf_token).await;
        let permissions = self.user_permissions(&api_url, &ticket, &csrf_token).await;
        let is_admin = has_admin_privileges(&userid, &permissions);

        info!("Proxmox auth successful for {} (admin={})", userid, is_admin);

        Ok(ProxmoxUser {
            userid,
            username: username.to_string(),
            realm: realm.to_string(),
            email: user_info["email"].as_str().map(|s| s.to_string()),
            is_admin,
        })
    }

    async fn user_info(&self, api_url: &str, userid: &str, ticket: &str, csrf_token: &str) -> Value {
        let url = format!("{}/access/users/{}", api_url, urlencoding::encode(userid));

        match self
            .http
            .get(url)
            .header("Cookie", format!("PVEAuthCookie={}", urlencoding::encode(ticket)))
            .header("CSRFPreventionToken", csrf_token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .map(|body| body["data"].clone())
                .unwrap_or(Value::Null),
            Ok(_) | Err(_) => {
                warn!("Could not fetch Proxmox user info for {}", userid);
                Value::Null
            }
        }
    }

    /// Permissions per path, each path mapping to the granted privileges.
    async fn user_permissions(&self, api_url: &str, ticket: &str, csrf_token: &str) -> Value {
        match self
            .http
            .get(format!("{}/access/permissions", api_url))
            .header("Cookie", format!("PVEAuthCookie={}", urlencoding::encode(ticket)))
            .header("CSRFPreventionToken", csrf_token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .map(|body| body["data"].clone())
                .unwrap_or(Value::Null),
            Ok(_) | Err(_) => {
                warn!("Could not fetch Proxmox permissions");
                Value::Null
            }
        }
    }

    /// Realms advertised by the node; no authentication required. Falls
    /// back to the stock pam/pve pair when the API is unreachable.
    pub async fn available_realms(&self, node: &Node) -> Vec<RealmInfo> {
        let api_url = api_base_url(node);

        let realms = match self
            .http
            .get(format!("{}/access/domains", api_url))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body["data"].as_array().cloned()),
            Ok(_) | Err(_) => None,
        };

        match realms {
            Some(entries) => entries
                .iter()
                .filter_map(|entry| {
                    entry["realm"].as_str().map(|realm| RealmInfo {
                        realm: realm.to_string(),
                        realm_type: entry["type"].as_str().unwrap_or("").to_string(),
                        comment: entry["comment"].as_str().unwrap_or("").to_string(),
                        default: entry["default"].as_i64() == Some(1),
                    })
                })
                .collect(),
            None => {
                warn!("Could not enumerate realms from {}, using fallback", node.name);
                fallback_realms()
            }
        }
    }
}

impl Default for ProxmoxAuthService {
    fn default() -> Self {
        Self::new()
    }
}

fn fallback_realms() -> Vec<RealmInfo> {
    vec![
        RealmInfo {
            realm: "pam".to_string(),
            realm_type: "pam".to_string(),
            comment: "Linux PAM".to_string(),
            default: true,
        },
        RealmInfo {
            realm: "pve".to_string(),
            realm_type: "pve".to_string(),
            comment: "Proxmox VE".to_string(),
            default: false,
        },
    ]
}

/// root@pam is always an administrator; otherwise any of the admin
/// privileges on the root path qualifies.
fn has_admin_privileges(userid: &str, permissions: &Value) -> bool {
    if userid == "root@pam" {
        return true;
    }

    let Some(root_perms) = permissions["/"].as_object() else {
        return false;
    };

    ["Sys.Audit", "Sys.Modify", "Permissions.Modify"]
        .iter()
        .any(|perm| root_perms.get(*perm).and_then(|v| v.as_i64()) == Some(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn node(api_endpoint: Option<&str>) -> Node {
        Node {
            id: 1,
            name: "pve1".to_string(),
            hostname: "192.168.1.100".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_key_path: "/root/.ssh/id_rsa".to_string(),
            api_endpoint: api_endpoint.map(|s| s.to_string()),
            is_auth_node: true,
            parallel_commands: false,
            online: true,
            last_seen: None,
            syncoid_installed: true,
            syncoid_version: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_api_base_url_default() {
        assert_eq!(
            api_base_url(&node(None)),
            "https://192.168.1.100:8006/api2/json"
        );
    }

    #[test]
    fn test_api_base_url_override() {
        assert_eq!(
            api_base_url(&node(Some("https://pve.example.com:8006/"))),
            "https://pve.example.com:8006/api2/json"
        );
    }

    #[test]
    fn test_root_pam_is_admin() {
        assert!(has_admin_privileges("root@pam", &Value::Null));
    }

    #[test]
    fn test_admin_by_root_path_privilege() {
        let perms = json!({"/": {"Sys.Modify": 1, "VM.Audit": 1}});
        assert!(has_admin_privileges("ops@pve", &perms));

        let perms = json!({"/": {"VM.Audit": 1}});
        assert!(!has_admin_privileges("ops@pve", &perms));

        let perms = json!({"/vms": {"Sys.Modify": 1}});
        assert!(!has_admin_privileges("ops@pve", &perms));

        assert!(!has_admin_privileges("ops@pve", &Value::Null));
    }

    #[test]
    fn test_fallback_realms() {
        let realms = fallback_realms();
        assert_eq!(realms.len(), 2);
        assert!(realms[0].default);
        assert_eq!(realms[0].realm, "pam");
    }
}
