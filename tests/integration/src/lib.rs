//! Integration tests for Keyward server.
//!
//! These tests spawn the server binary and drive the KMS operations over HTTP.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;

pub const ROOT: &str = "arn:keyward:iam::111122223333:root";
pub const APP: &str = "arn:keyward:iam::111122223333:role/app";

/// Fixed master key so a restarted server can read its own data.
pub const MASTER_KEY: &str = "0707070707070707070707070707070707070707070707070707070707070707";

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub region: String,
}

/// Error envelope returned by the server.
#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(rename = "__type")]
    pub code: String,
    pub message: String,
}

// ============================================================================
// Test Server
// ============================================================================

/// A test server instance that manages its own data directory and process.
pub struct TestServer {
    process: Child,
    pub base_url: String,
    pub port: u16,
    data_dir: TempDir,
}

impl TestServer {
    /// Start a dev-mode server (in-memory, root caller by default).
    pub async fn start_dev(port: u16) -> Result<Self> {
        let data_dir = TempDir::new().context("Failed to create temp dir")?;
        let process = spawn(&["--dev".to_string()], port)?;
        Self::ready(process, port, data_dir).await
    }

    /// Start a durable server over `data_dir`.
    pub async fn start_durable(port: u16, data_dir: TempDir) -> Result<Self> {
        let args = [
            "--data-dir".to_string(),
            data_dir.path().display().to_string(),
            "--master-key".to_string(),
            MASTER_KEY.to_string(),
        ];
        let process = spawn(&args, port)?;
        Self::ready(process, port, data_dir).await
    }

    async fn ready(process: Child, port: u16, data_dir: TempDir) -> Result<Self> {
        let server = Self {
            process,
            base_url: format!("http://127.0.0.1:{}", port),
            port,
            data_dir,
        };
        server.wait_for_ready().await?;
        Ok(server)
    }

    /// Wait for the server to be ready to accept connections.
    async fn wait_for_ready(&self) -> Result<()> {
        let client = Client::new();
        let url = format!("{}/v1/sys/health", self.base_url);

        for _ in 0..50 {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        bail!("Server failed to start within 5 seconds")
    }

    /// Stops the process and hands back the data directory.
    pub fn stop(mut self) -> TempDir {
        let _ = self.process.kill();
        let _ = self.process.wait();
        let data_dir = TempDir::new().unwrap();
        std::mem::replace(&mut self.data_dir, data_dir)
    }

    /// Client acting as `principal`; `None` sends no principal header.
    pub fn client(&self, principal: Option<&str>) -> KeywardClient {
        KeywardClient::new(&self.base_url, principal)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn spawn(args: &[String], port: u16) -> Result<Child> {
    let server_binary = find_server_binary()?;
    Command::new(&server_binary)
        .args(args)
        .arg("--bind")
        .arg(format!("127.0.0.1:{}", port))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start server: {:?}", server_binary))
}

/// Find the server binary in the target directory.
fn find_server_binary() -> Result<std::path::PathBuf> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let root = Path::new(&manifest_dir).join("../..");

    let candidates = [
        root.join("target/debug/keyward-server"),
        root.join("target/debug/keyward-server.exe"),
        root.join("target/release/keyward-server"),
        root.join("target/release/keyward-server.exe"),
    ];

    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.canonicalize()?);
        }
    }

    bail!(
        "Could not find keyward-server binary. Run 'cargo build -p keyward-server' first. Searched in: {:?}",
        candidates
    )
}

// ============================================================================
// Test Client
// ============================================================================

/// HTTP client for the Keyward API.
pub struct KeywardClient {
    client: Client,
    base_url: String,
    principal: Option<String>,
}

impl KeywardClient {
    pub fn new(base_url: &str, principal: Option<&str>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.to_string(),
            principal: principal.map(str::to_string),
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self
            .client
            .get(format!("{}/v1/sys/health", self.base_url))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    /// Runs `operation`; returns the status and the decoded body.
    pub async fn call(&self, operation: &str, body: Value) -> Result<(StatusCode, Value)> {
        let mut req = self
            .client
            .post(format!("{}/v1/kms", self.base_url))
            .header("X-Keyward-Operation", operation)
            .json(&body);
        if let Some(principal) = &self.principal {
            req = req.header("X-Keyward-Principal", principal);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Runs `operation` and fails unless it succeeded.
    pub async fn ok(&self, operation: &str, body: Value) -> Result<Value> {
        let (status, body) = self.call(operation, body).await?;
        if !status.is_success() {
            bail!("{operation} failed with {status}: {body}");
        }
        Ok(body)
    }

    /// Runs `operation` and returns the error it must produce.
    pub async fn err(&self, operation: &str, body: Value) -> Result<(StatusCode, ApiError)> {
        let (status, body) = self.call(operation, body).await?;
        if status.is_success() {
            bail!("{operation} unexpectedly succeeded: {body}");
        }
        Ok((status, serde_json::from_value(body)?))
    }

    pub async fn attach_identity_policy(&self, principal: &str, name: &str, document: &Value) -> Result<()> {
        let mut req = self
            .client
            .post(format!("{}/v1/sys/identity-policies", self.base_url))
            .json(&json!({
                "Principal": principal,
                "PolicyName": name,
                "PolicyDocument": document.to_string(),
            }));
        if let Some(principal) = &self.principal {
            req = req.header("X-Keyward-Principal", principal);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            bail!("Attach identity policy failed: {}", resp.text().await?);
        }
        Ok(())
    }
}

pub fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn unb64(value: &Value) -> Vec<u8> {
    STANDARD.decode(value.as_str().unwrap()).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    // Port counter to avoid conflicts between parallel tests
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18300);

    fn next_port() -> u16 {
        PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    async fn create_key(client: &KeywardClient) -> String {
        let created = client.ok("CreateKey", json!({})).await.unwrap();
        created["KeyMetadata"]["KeyId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_server_health_in_dev_mode() {
        let server = TestServer::start_dev(next_port()).await.unwrap();
        let health = server.client(None).health().await.unwrap();

        assert_eq!(health.status, "ok");
        assert_eq!(health.region, "us-east-1");
        assert!(!health.version.is_empty());
    }

    #[tokio::test]
    async fn test_envelope_encryption_over_http() {
        let server = TestServer::start_dev(next_port()).await.unwrap();
        let client = server.client(None);
        let key_id = create_key(&client).await;

        let encrypted = client
            .ok(
                "Encrypt",
                json!({
                    "KeyId": key_id,
                    "Plaintext": b64(b"hello"),
                    "EncryptionContext": {"app": "x"},
                }),
            )
            .await
            .unwrap();
        let blob = encrypted["CiphertextBlob"].clone();

        let decrypted = client
            .ok(
                "Decrypt",
                json!({"CiphertextBlob": blob, "EncryptionContext": {"app": "x"}}),
            )
            .await
            .unwrap();
        assert_eq!(unb64(&decrypted["Plaintext"]), b"hello");

        let (status, err) = client
            .err("Decrypt", json!({"CiphertextBlob": blob}))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "InvalidCiphertextException");

        let data_key = client
            .ok("GenerateDataKey", json!({"KeyId": key_id, "KeySpec": "AES_256"}))
            .await
            .unwrap();
        assert_eq!(unb64(&data_key["Plaintext"]).len(), 32);
    }

    #[tokio::test]
    async fn test_lifecycle_errors_over_http() {
        let server = TestServer::start_dev(next_port()).await.unwrap();
        let client = server.client(None);
        let key_id = create_key(&client).await;

        client.ok("DisableKey", json!({"KeyId": key_id})).await.unwrap();
        let (_, err) = client
            .err("Encrypt", json!({"KeyId": key_id, "Plaintext": b64(b"x")}))
            .await
            .unwrap();
        assert_eq!(err.code, "DisabledException");

        let scheduled = client
            .ok(
                "ScheduleKeyDeletion",
                json!({"KeyId": key_id, "PendingWindowInDays": 7}),
            )
            .await
            .unwrap();
        assert_eq!(scheduled["KeyState"], "PendingDeletion");

        let (status, err) = client
            .err("DescribeKey", json!({"KeyId": "alias/missing"}))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NotFoundException");

        let (_, err) = client.err("MakeCoffee", json!({})).await.unwrap();
        assert_eq!(err.code, "UnsupportedOperationException");
    }

    #[tokio::test]
    async fn test_grants_and_principals() {
        let data_dir = TempDir::new().unwrap();
        let server = TestServer::start_durable(next_port(), data_dir).await.unwrap();
        let root = server.client(Some(ROOT));
        let app = server.client(Some(APP));

        let (status, err) = server
            .client(None)
            .err("ListKeys", json!({}))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, "MissingAuthenticationTokenException");

        let key_id = create_key(&root).await;
        let blob = root
            .ok("Encrypt", json!({"KeyId": key_id, "Plaintext": b64(b"for app")}))
            .await
            .unwrap()["CiphertextBlob"]
            .clone();

        let (status, err) = app.err("Decrypt", json!({"CiphertextBlob": blob})).await.unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, "AccessDeniedException");

        let grant = root
            .ok(
                "CreateGrant",
                json!({
                    "KeyId": key_id,
                    "GranteePrincipal": APP,
                    "Operations": ["Decrypt"],
                }),
            )
            .await
            .unwrap();
        let decrypted = app
            .ok(
                "Decrypt",
                json!({"CiphertextBlob": blob, "GrantTokens": [grant["GrantToken"]]}),
            )
            .await
            .unwrap();
        assert_eq!(unb64(&decrypted["Plaintext"]), b"for app");

        let (_, err) = app
            .err(
                "Encrypt",
                json!({
                    "KeyId": key_id,
                    "Plaintext": b64(b"x"),
                    "GrantTokens": [grant["GrantToken"]],
                }),
            )
            .await
            .unwrap();
        assert_eq!(err.code, "AccessDeniedException");

        root.attach_identity_policy(
            APP,
            "encrypt",
            &json!({
                "Version": "2012-10-17",
                "Statement": [{"Effect": "Allow", "Action": "kms:Encrypt", "Resource": "*"}],
            }),
        )
        .await
        .unwrap();
        app.ok("Encrypt", json!({"KeyId": key_id, "Plaintext": b64(b"x")}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_keys_survive_restart() {
        let port = next_port();
        let server = TestServer::start_durable(port, TempDir::new().unwrap())
            .await
            .unwrap();
        let root = server.client(Some(ROOT));
        let key_id = create_key(&root).await;
        root.ok(
            "CreateAlias",
            json!({"AliasName": "alias/durable", "TargetKeyId": key_id}),
        )
        .await
        .unwrap();
        let blob = root
            .ok("Encrypt", json!({"KeyId": "alias/durable", "Plaintext": b64(b"kept")}))
            .await
            .unwrap()["CiphertextBlob"]
            .clone();

        let data_dir = server.stop();
        let server = TestServer::start_durable(next_port(), data_dir).await.unwrap();
        let root = server.client(Some(ROOT));

        let decrypted = root
            .ok("Decrypt", json!({"CiphertextBlob": blob}))
            .await
            .unwrap();
        assert_eq!(unb64(&decrypted["Plaintext"]), b"kept");

        let aliases = root.ok("ListAliases", json!({})).await.unwrap();
        assert_eq!(aliases["Aliases"][0]["AliasName"], "alias/durable");
        assert_eq!(aliases["Aliases"][0]["TargetKeyId"], key_id);
    }
}
