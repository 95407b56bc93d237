//! HTTP volume provider client
//!
//! Talks JSON to `{endpoint}/{project}/{environment}/`. Every call carries
//! the `K8S-Namespace` header (the infra name) plus the environment's pool
//! headers.

use crate::config::{Credential, ProviderConfig};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::*;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const NAMESPACE_HEADER: &str = "K8S-Namespace";

#[derive(Deserialize)]
struct IdentifierReply {
    identifier: String,
}

#[derive(Deserialize)]
struct CommandReply {
    #[serde(default)]
    command: Option<String>,
}

#[derive(Deserialize)]
struct RemovedReply {
    removed: bool,
}

#[derive(Deserialize)]
struct NewDiskReply {
    create_new_disk: Value,
}

/// Loose truthiness of a JSON answer
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Volume provider bound to one environment and namespace
#[derive(Debug, Clone)]
pub struct VolumeProviderClient {
    http: Client,
    base_uri: String,
    environment: String,
    headers: HeaderMap,
}

impl VolumeProviderClient {
    pub fn new(
        http: Client,
        credential: &Credential,
        environment: &str,
        namespace: &str,
    ) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &credential.pool_headers {
            headers.insert(header_name(name)?, header_value(value)?);
        }
        headers.insert(header_name(NAMESPACE_HEADER)?, header_value(namespace)?);

        Ok(Self {
            http,
            base_uri: credential.base_uri(environment),
            environment: environment.to_string(),
            headers,
        })
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_uri, path)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> ProviderResult<Response> {
        let response = self.dispatch(operation, request).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(
                operation,
                environment = %self.environment,
                status,
                body = %body,
                "Volume provider rejected call"
            );
            return Err(ProviderError::Http {
                operation,
                status,
                body,
            });
        }
        Ok(response)
    }

    async fn dispatch(&self, operation: &'static str, request: RequestBuilder) -> ProviderResult<Response> {
        let response = request
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|source| ProviderError::Transport { operation, source })?;
        debug!(
            operation,
            environment = %self.environment,
            status = response.status().as_u16(),
            "Volume provider answered"
        );
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, operation: &'static str, request: RequestBuilder) -> ProviderResult<T> {
        self.send(operation, request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode {
                operation,
                reason: e.to_string(),
            })
    }

    async fn command(&self, operation: &'static str, request: RequestBuilder) -> ProviderResult<String> {
        let reply: CommandReply = self.json(operation, request).await?;
        Ok(reply.command.unwrap_or_default())
    }

    fn snapshot_url(&self, prefix: &str, volume_identifier: &str, persist: bool) -> String {
        let mut url = self.url(&format!("{}{}", prefix, volume_identifier));
        if persist {
            url.push_str("?persist=1");
        }
        url
    }
}

fn header_name(name: &str) -> ProviderResult<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ProviderError::Config(format!("invalid header name '{}': {}", name, e)))
}

fn header_value(value: &str) -> ProviderResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ProviderError::Config(format!("invalid header value '{}': {}", value, e)))
}

#[async_trait]
impl VolumeProvider for VolumeProviderClient {
    fn environment(&self) -> &str {
        &self.environment
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> ProviderResult<String> {
        debug!(group = %request.group, snapshot = ?request.snapshot_id, "Creating volume");
        let reply: IdentifierReply = self
            .json("create_volume", self.http.post(self.url("volume/new")).json(request))
            .await?;
        Ok(reply.identifier)
    }

    async fn get_volume(&self, identifier: &str) -> ProviderResult<VolumeDetails> {
        self.json(
            "get_volume",
            self.http.get(self.url(&format!("volume/{}", identifier))),
        )
        .await
    }

    async fn delete_volume(&self, identifier: &str) -> ProviderResult<()> {
        self.send(
            "destroy_volume",
            self.http.delete(self.url(&format!("volume/{}", identifier))),
        )
        .await?;
        Ok(())
    }

    async fn attach_disk(&self, identifier: &str, vm: &VmLocation) -> ProviderResult<()> {
        let body = json!({ "host_vm": vm.name, "host_zone": vm.zone });
        self.send(
            "attach_disk",
            self.http
                .post(self.url(&format!("attach/{}/", identifier)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn detach_disk(&self, identifier: &str) -> ProviderResult<()> {
        self.send(
            "detach_disk",
            self.http.post(self.url(&format!("detach/{}/", identifier))),
        )
        .await?;
        Ok(())
    }

    async fn move_disk(&self, identifier: &str, zone: &str) -> ProviderResult<()> {
        self.send(
            "move_disk",
            self.http
                .post(self.url(&format!("move/{}", identifier)))
                .json(&json!({ "zone": zone })),
        )
        .await?;
        Ok(())
    }

    async fn resize(&self, identifier: &str, new_size_kb: u64) -> ProviderResult<()> {
        self.send(
            "resize",
            self.http
                .post(self.url(&format!("resize/{}", identifier)))
                .json(&json!({ "new_size_kb": new_size_kb })),
        )
        .await?;
        Ok(())
    }

    async fn mount_command(&self, identifier: &str, request: &MountRequest) -> ProviderResult<String> {
        self.command(
            "get_mount_command",
            self.http
                .post(self.url(&format!("commands/{}/mount", identifier)))
                .json(request),
        )
        .await
    }

    async fn umount_command(&self, identifier: &str, data_directory: &str) -> ProviderResult<String> {
        self.command(
            "get_umount_command",
            self.http
                .post(self.url(&format!("commands/{}/umount", identifier)))
                .json(&json!({ "data_directory": data_directory })),
        )
        .await
    }

    async fn resize2fs_command(&self, identifier: &str) -> ProviderResult<String> {
        self.command(
            "get_resize2fs_command",
            self.http
                .post(self.url(&format!("commands/{}/resize2fs", identifier))),
        )
        .await
    }

    async fn cleanup_command(&self, identifier: &str) -> ProviderResult<String> {
        self.command(
            "clean_up",
            self.http
                .get(self.url(&format!("commands/{}/cleanup", identifier))),
        )
        .await
    }

    async fn host_command(&self, command: HostCommand, host_ip: &str) -> ProviderResult<String> {
        self.command(
            command.path(),
            self.http
                .get(self.url(&format!("commands/{}", command.path())))
                .json(&json!({ "host_ip": host_ip })),
        )
        .await
    }

    async fn copy_files_command(&self, request: &CopyFilesRequest) -> ProviderResult<String> {
        self.command(
            "get_copy_files_command",
            self.http.post(self.url("commands/copy_files")).json(request),
        )
        .await
    }

    async fn snapshot_copy_command(
        &self,
        method: SnapshotCopy,
        snapshot_identifier: &str,
        request: &SnapshotCopyRequest,
    ) -> ProviderResult<String> {
        let operation = match method {
            SnapshotCopy::Scp => "get_scp_from_snapshot_command",
            SnapshotCopy::Rsync => "get_rsync_from_snapshot_command",
        };
        self.command(
            operation,
            self.http
                .get(self.url(&format!(
                    "snapshots/{}/commands/{}",
                    snapshot_identifier,
                    method.path()
                )))
                .json(request),
        )
        .await
    }

    async fn take_snapshot(
        &self,
        volume_identifier: &str,
        labels: &ResourceLabels,
        persist: bool,
    ) -> ProviderResult<TakenSnapshot> {
        let url = self.snapshot_url("snapshot/", volume_identifier, persist);
        debug!(url = %url, "Calling create snapshot");
        self.json("take_snapshot", self.http.post(url).json(labels))
            .await
    }

    async fn new_take_snapshot(
        &self,
        volume_identifier: &str,
        labels: &ResourceLabels,
        persist: bool,
    ) -> ProviderResult<SnapshotReply> {
        let operation = "new_take_snapshot";
        let url = self.snapshot_url("gcp/snapshot/", volume_identifier, persist);
        debug!(url = %url, "Calling create snapshot");
        let response = self
            .dispatch(operation, self.http.post(url).json(labels))
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Ok(SnapshotReply::Rejected { status, body });
        }

        let taken = response
            .json::<TakenSnapshot>()
            .await
            .map_err(|e| ProviderError::Decode {
                operation,
                reason: e.to_string(),
            })?;
        Ok(SnapshotReply::Accepted(taken))
    }

    async fn snapshot_state(&self, snapshot_identifier: &str) -> ProviderResult<SnapshotState> {
        self.json(
            "get_snapshot_state",
            self.http
                .get(self.url(&format!("snapshot/{}/state", snapshot_identifier))),
        )
        .await
    }

    async fn delete_snapshot(&self, snapshot_identifier: &str, force: bool) -> ProviderResult<bool> {
        let reply: RemovedReply = self
            .json(
                "delete_snapshot",
                self.http.delete(self.url(&format!(
                    "snapshot/{}?force={}",
                    snapshot_identifier,
                    u8::from(force)
                ))),
            )
            .await?;
        Ok(reply.removed)
    }

    async fn restore_snapshot(&self, snapshot_identifier: &str, request: &RestoreRequest) -> ProviderResult<String> {
        let reply: IdentifierReply = self
            .json(
                "restore_snapshot",
                self.http
                    .post(self.url(&format!("snapshot/{}/restore", snapshot_identifier)))
                    .json(request),
            )
            .await?;
        Ok(reply.identifier)
    }

    async fn restore_snapshot_to_rsync(&self, snapshot_identifier: &str, request: &RestoreRequest) -> ProviderResult<()> {
        self.send(
            "restore_snapshot_to_rsync",
            self.http
                .post(self.url(&format!(
                    "snapshot/{}/restore-to-rsync",
                    snapshot_identifier
                )))
                .json(request),
        )
        .await?;
        Ok(())
    }

    async fn add_access(&self, identifier: &str, to_address: &str, access_type: Option<&str>) -> ProviderResult<()> {
        let mut body = json!({ "to_address": to_address });
        if let Some(access_type) = access_type {
            body["access_type"] = json!(access_type);
        }
        self.send(
            "add_access",
            self.http
                .post(self.url(&format!("access/{}", identifier)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn remove_access(&self, identifier: &str, address: &str) -> ProviderResult<()> {
        self.send(
            "remove_access",
            self.http
                .delete(self.url(&format!("access/{}/{}", identifier, address))),
        )
        .await?;
        Ok(())
    }

    async fn should_migrate_with_new_disk(&self) -> ProviderResult<bool> {
        let reply: NewDiskReply = self
            .json(
                "should_migrate_with_new_disk",
                self.http.get(self.url("new-disk-migration")),
            )
            .await?;
        Ok(truthy(&reply.create_new_disk))
    }

    async fn update_team_labels(&self, vm_name: &str, team_name: &str, zone: &str) -> ProviderResult<bool> {
        let body = json!({ "vm_name": vm_name, "team_name": team_name, "zone": zone });
        let reply: Value = self
            .json(
                "update_team_labels_disks",
                self.http.post(self.url("volume/update_labels")).json(&body),
            )
            .await?;
        Ok(truthy(&reply))
    }
}

/// Builds [`VolumeProviderClient`]s from [`ProviderConfig`] credentials
///
/// One `reqwest::Client` (and its connection pool) is shared by every
/// environment.
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    config: ProviderConfig,
    http: Client,
}

impl HttpProviderFactory {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn provider(&self, environment: &str, namespace: &str) -> ProviderResult<Arc<dyn VolumeProvider>> {
        let credential = self.config.credential(environment)?;
        let client = VolumeProviderClient::new(self.http.clone(), credential, environment, namespace)?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn labels() -> ResourceLabels {
        ResourceLabels {
            engine: "mysql_8_0".to_string(),
            db_name: "orders".to_string(),
            team_name: "payments".to_string(),
        }
    }

    async fn setup() -> (MockServer, Arc<dyn VolumeProvider>) {
        let server = MockServer::start().await;
        let credential =
            Credential::new(server.uri(), "dbaas").with_pool_header("X-Pool-Name", "pool-a");
        let factory =
            HttpProviderFactory::new(ProviderConfig::new().with_environment("dev", credential))
                .unwrap();
        let provider = factory.provider("dev", "orders-infra").unwrap();
        (server, provider)
    }

    #[tokio::test]
    async fn test_create_volume() {
        let (server, provider) = setup().await;

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/volume/new"))
            .and(header("K8S-Namespace", "orders-infra"))
            .and(header("X-Pool-Name", "pool-a"))
            .and(body_partial_json(json!({
                "group": "orders-infra",
                "size_kb": 2048,
                "snapshot_id": null,
                "disk_offering_type": "SSD",
                "team_name": "payments"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"identifier": "vol-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let identifier = provider
            .create_volume(&CreateVolumeRequest {
                group: "orders-infra".to_string(),
                size_kb: 2048,
                to_address: "10.0.0.1".to_string(),
                snapshot_id: None,
                zone: Some("zone-a".to_string()),
                vm_name: Some("db-01".to_string()),
                labels: labels(),
                disk_offering_type: Some("SSD".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(identifier, "vol-1");
    }

    #[tokio::test]
    async fn test_non_success_carries_status_and_body() {
        let (server, provider) = setup().await;

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/detach/vol-1/"))
            .respond_with(ResponseTemplate::new(409).set_body_string("disk busy"))
            .mount(&server)
            .await;

        let err = provider.detach_disk("vol-1").await.unwrap_err();
        match err {
            ProviderError::Http {
                operation,
                status,
                body,
            } => {
                assert_eq!(operation, "detach_disk");
                assert_eq!(status, 409);
                assert_eq!(body, "disk busy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_attach_and_mount_command() {
        let (server, provider) = setup().await;
        let vm = VmLocation::new("db-01", "zone-a");

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/attach/vol-1/"))
            .and(body_json(json!({"host_vm": "db-01", "host_zone": "zone-a"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dbaas/dev/commands/vol-1/mount"))
            .and(body_json(json!({
                "with_fstab": false,
                "data_directory": "/data_migrate",
                "host_vm": "db-01",
                "host_zone": "zone-a"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"command": "mount /dev/sdb /data_migrate"})))
            .expect(1)
            .mount(&server)
            .await;

        provider.attach_disk("vol-1", &vm).await.unwrap();
        let command = provider
            .mount_command(
                "vol-1",
                &MountRequest {
                    with_fstab: false,
                    data_directory: "/data_migrate".to_string(),
                    host_vm: vm.name.clone(),
                    host_zone: vm.zone.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(command, "mount /dev/sdb /data_migrate");
    }

    #[tokio::test]
    async fn test_host_command_is_get_with_body() {
        let (server, provider) = setup().await;

        Mock::given(method("GET"))
            .and(path("/dbaas/dev/commands/add_hosts_allow"))
            .and(body_json(json!({"host_ip": "10.0.0.9"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"command": "echo allow"})))
            .expect(1)
            .mount(&server)
            .await;

        let command = provider.add_hosts_allow_command("10.0.0.9").await.unwrap();
        assert_eq!(command, "echo allow");
    }

    #[tokio::test]
    async fn test_cleanup_command_may_be_empty() {
        let (server, provider) = setup().await;

        Mock::given(method("GET"))
            .and(path("/dbaas/dev/commands/vol-1/cleanup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"command": null})))
            .mount(&server)
            .await;

        assert_eq!(provider.cleanup_command("vol-1").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_calls() {
        let (server, provider) = setup().await;

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/snapshot/vol-1"))
            .and(query_param("persist", "1"))
            .and(body_json(json!({"engine": "mysql_8_0", "db_name": "orders", "team_name": "payments"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "identifier": "snap-1",
                "description": "/snapshots/snap-1",
                "size": 4096
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dbaas/dev/snapshot/snap-1/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"snapshot_status": "READY"})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/dbaas/dev/snapshot/snap-1"))
            .and(query_param("force", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"removed": true})))
            .expect(1)
            .mount(&server)
            .await;

        let taken = provider.take_snapshot("vol-1", &labels(), true).await.unwrap();
        assert_eq!(taken.identifier, "snap-1");
        assert_eq!(taken.size, Some(4096));
        assert!(taken.warning.is_none());

        let state = provider.snapshot_state("snap-1").await.unwrap();
        assert_eq!(state.snapshot_status, "READY");

        assert!(provider.delete_snapshot("snap-1", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_new_take_snapshot_rejection_is_returned() {
        let (server, provider) = setup().await;

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/gcp/snapshot/vol-1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("quota"))
            .mount(&server)
            .await;

        let reply = provider.new_take_snapshot("vol-1", &labels(), false).await.unwrap();
        assert_eq!(
            reply,
            SnapshotReply::Rejected {
                status: 500,
                body: "quota".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_restore_and_access() {
        let (server, provider) = setup().await;

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/snapshot/snap-1/restore"))
            .and(body_partial_json(json!({"vm_name": "db-01", "zone": "zone-a", "disk_offering_type": "SSD"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"identifier": "vol-restored"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dbaas/dev/access/vol-1"))
            .and(body_json(json!({"to_address": "10.0.0.2", "access_type": "read-only"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/dbaas/dev/access/vol-1/10.0.0.2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let identifier = provider
            .restore_snapshot(
                "snap-1",
                &RestoreRequest {
                    vm_name: "db-01".to_string(),
                    zone: "zone-a".to_string(),
                    labels: labels(),
                    disk_offering_type: Some("SSD".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(identifier, "vol-restored");

        provider
            .add_access("vol-1", "10.0.0.2", Some("read-only"))
            .await
            .unwrap();
        provider.remove_access("vol-1", "10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn test_new_disk_migration_flag() {
        let (server, provider) = setup().await;

        Mock::given(method("GET"))
            .and(path("/dbaas/dev/new-disk-migration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"create_new_disk": 1})))
            .mount(&server)
            .await;

        assert!(provider.should_migrate_with_new_disk().await.unwrap());
    }

    #[test]
    fn test_factory_unknown_environment() {
        let factory = HttpProviderFactory::new(ProviderConfig::new()).unwrap();
        assert!(matches!(
            factory.provider("prod", "orders-infra"),
            Err(ProviderError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!({"updated": 2})));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!([])));
    }
}
