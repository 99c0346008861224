//! Cloud-init document execution for kubeadm-mode bootstrap.
//!
//! The bootstrap secret carries a cloud-init-style document with two
//! directives: `write_files` (with per-file encodings) and `runCmd`. On top
//! of plain execution, any file recognizable as a kubeadm configuration has
//! the host's provider ID, node labels and taints injected into its
//! `kubeletExtraArgs` so the autoscaler can map nodes back to machines.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Taint;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info};

use super::cmd::CmdRunner;
use crate::crd::types::generate_provider_id;
use crate::{Error, Result};

/// One entry of the `write_files` directive.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FileSpec {
    /// Absolute path to write
    pub path: String,
    /// Content encoding: empty/plain, base64, or gzip+base64
    #[serde(default)]
    pub encoding: String,
    /// Owner (`user:group`); best-effort
    #[serde(default)]
    pub owner: String,
    /// Octal permission string, e.g. "0600"
    #[serde(default)]
    pub permissions: String,
    /// File content, encoded per `encoding`
    #[serde(default)]
    pub content: String,
    /// Append instead of truncate
    #[serde(default)]
    pub append: bool,
}

/// The parsed cloud-init document.
#[derive(Debug, Default, Deserialize)]
pub struct BootstrapDoc {
    /// Files to write before running commands
    #[serde(default, rename = "write_files")]
    pub write_files: Vec<FileSpec>,
    /// Shell commands to run, in order
    #[serde(default, rename = "runCmd")]
    pub run_cmd: Vec<String>,
}

/// Writes files on the host filesystem.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Create a directory (and parents) if absent
    async fn mkdir_if_not_exists(&self, path: &str) -> Result<()>;
    /// Write one file per its spec (permissions, append)
    async fn write_file(&self, file: &FileSpec) -> Result<()>;
}

/// FileWriter backed by the real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskFileWriter;

#[async_trait]
impl FileWriter for DiskFileWriter {
    async fn mkdir_if_not_exists(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn write_file(&self, file: &FileSpec) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if file.append {
            use tokio::io::AsyncWriteExt;
            let mut handle = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file.path)
                .await?;
            handle.write_all(file.content.as_bytes()).await?;
        } else {
            tokio::fs::write(&file.path, file.content.as_bytes()).await?;
        }

        if !file.permissions.is_empty() {
            if let Ok(mode) = u32::from_str_radix(file.permissions.trim_start_matches("0o"), 8) {
                tokio::fs::set_permissions(&file.path, std::fs::Permissions::from_mode(mode))
                    .await?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Encodings
// =============================================================================

/// Normalize an encoding declaration into the decode chain to apply,
/// outermost first.
pub fn parse_encoding_scheme(encoding: &str) -> Vec<&'static str> {
    match encoding.trim().to_lowercase().as_str() {
        "gz+base64" | "gzip+base64" | "gz+b64" | "gzip+b64" => vec!["base64", "gzip"],
        "base64" | "b64" => vec!["base64"],
        _ => vec!["plain"],
    }
}

/// Decode file content through the given chain.
pub fn decode_content(content: &str, encodings: &[&str]) -> Result<Vec<u8>> {
    let mut data = content.as_bytes().to_vec();
    for encoding in encodings {
        data = match *encoding {
            "base64" => BASE64
                .decode(String::from_utf8_lossy(&data).trim())
                .map_err(|e| Error::serialization(format!("invalid base64 content: {}", e)))?,
            "gzip" => {
                let mut decoder = GzDecoder::new(data.as_slice());
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::serialization(format!("invalid gzip content: {}", e)))?;
                out
            }
            "plain" => data,
            other => {
                return Err(Error::serialization(format!(
                    "unknown bootstrap data encoding {:?}",
                    other
                )))
            }
        };
    }
    Ok(data)
}

// =============================================================================
// Templates
// =============================================================================

/// Substitute the template variables install and bootstrap scripts use:
/// the host name and the bundle download path.
pub fn render_template(content: &str, hostname: &str, download_path: &str) -> String {
    content
        .replace("{{ .Hostname }}", hostname)
        .replace("{{.Hostname}}", hostname)
        .replace("{{ .BundleDownloadPath }}", download_path)
        .replace("{{.BundleDownloadPath}}", download_path)
}

// =============================================================================
// Kubeadm config interception
// =============================================================================

/// Format taints as kubelet `--register-with-taints` entries:
/// `key=value:effect`, with the key standing in for an empty value.
pub fn format_taints(taints: &[Taint]) -> String {
    taints
        .iter()
        .map(|t| {
            let value = match t.value.as_deref() {
                Some(v) if !v.is_empty() => v,
                _ => t.key.as_str(),
            };
            format!("{}={}:{}", t.key, value, t.effect)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Format node labels as a kubelet `--node-labels` value.
pub fn format_labels(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// If the document looks like a kubeadm configuration (carries a
/// `nodeRegistration` key), inject `provider-id`, `node-labels` and
/// `register-with-taints` into its `kubeletExtraArgs`, preserving any
/// values already present. Non-kubeadm documents pass through unchanged.
pub fn intercept_kubeadm_config(
    content: &str,
    hostname: &str,
    labels: &std::collections::BTreeMap<String, String>,
    taints: &[Taint],
) -> String {
    let Ok(mut doc) = serde_yaml::from_str::<serde_yaml::Value>(content) else {
        return content.to_string();
    };
    let Some(mapping) = doc.as_mapping_mut() else {
        return content.to_string();
    };
    let node_reg_key = serde_yaml::Value::from("nodeRegistration");
    if !mapping.contains_key(&node_reg_key) {
        return content.to_string();
    }

    let node_reg = mapping
        .get_mut(&node_reg_key)
        .and_then(|v| v.as_mapping_mut());
    let Some(node_reg) = node_reg else {
        return content.to_string();
    };

    let extra_key = serde_yaml::Value::from("kubeletExtraArgs");
    if !node_reg.contains_key(&extra_key) {
        node_reg.insert(extra_key.clone(), serde_yaml::Value::Mapping(Default::default()));
    }
    let Some(extra) = node_reg.get_mut(&extra_key).and_then(|v| v.as_mapping_mut()) else {
        return content.to_string();
    };

    let mut inject = |key: &str, value: String| {
        let key = serde_yaml::Value::from(key);
        if !extra.contains_key(&key) {
            extra.insert(key, serde_yaml::Value::from(value));
        }
    };
    inject("provider-id", generate_provider_id(hostname));
    if !labels.is_empty() {
        inject("node-labels", format_labels(labels));
    }
    if !taints.is_empty() {
        inject("register-with-taints", format_taints(taints));
    }

    serde_yaml::to_string(&doc).unwrap_or_else(|_| content.to_string())
}

// =============================================================================
// Executor
// =============================================================================

/// Executes a cloud-init bootstrap document on the host.
pub struct ScriptExecutor {
    /// File writer for the `write_files` directive
    pub file_writer: Arc<dyn FileWriter>,
    /// Command runner for the `runCmd` directive
    pub cmd_runner: Arc<dyn CmdRunner>,
    /// Host name, injected into kubeadm configs and templates
    pub hostname: String,
    /// Node labels to inject into kubeadm configs
    pub labels: std::collections::BTreeMap<String, String>,
    /// Node taints to inject into kubeadm configs
    pub taints: Vec<Taint>,
    /// Bundle download path substituted into templates
    pub download_path: String,
}

impl ScriptExecutor {
    /// Execute the document: write every file (decode, template, intercept)
    /// then run every command in order. The first failing step aborts.
    pub async fn execute(&self, bootstrap_doc: &str) -> Result<()> {
        let doc: BootstrapDoc = serde_yaml::from_str(bootstrap_doc)
            .map_err(|e| Error::serialization(format!("invalid cloud-init document: {}", e)))?;

        for mut file in doc.write_files {
            let parent = Path::new(&file.path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !parent.is_empty() {
                self.file_writer.mkdir_if_not_exists(&parent).await?;
            }

            let decoded = decode_content(&file.content, &parse_encoding_scheme(&file.encoding))?;
            let mut content = String::from_utf8_lossy(&decoded).into_owned();
            content = render_template(&content, &self.hostname, &self.download_path);

            // Autoscaler integration: kubeadm configs get the provider ID,
            // labels and taints injected before they land on disk.
            if file.path.contains("kubeadm") || file.path.ends_with(".yaml") {
                content =
                    intercept_kubeadm_config(&content, &self.hostname, &self.labels, &self.taints);
            }

            file.content = content;
            debug!(path = %file.path, "writing bootstrap file");
            self.file_writer.write_file(&file).await?;
        }

        for cmd in &doc.run_cmd {
            info!(cmd = %cmd, "running bootstrap command");
            self.cmd_runner.run(cmd).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::cmd::MockCmdRunner;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    // =========================================================================
    // Encoding stories
    // =========================================================================
    //
    // The decode law: for every supported encoding, decoding what the
    // cluster manager encoded yields the original bytes. The chain order is
    // outer-to-inner: base64 first, then gzip.

    #[test]
    fn plain_content_passes_through() {
        assert_eq!(
            decode_content("hello", &parse_encoding_scheme("")).unwrap(),
            b"hello"
        );
        assert_eq!(
            decode_content("hello", &parse_encoding_scheme("text/plain")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn base64_content_decodes() {
        let encoded = BASE64.encode("#!/bin/bash\nkubeadm join");
        for spelling in ["base64", "b64", "B64"] {
            assert_eq!(
                decode_content(&encoded, &parse_encoding_scheme(spelling)).unwrap(),
                b"#!/bin/bash\nkubeadm join"
            );
        }
    }

    #[test]
    fn gzip_base64_content_decodes_outer_to_inner() {
        let raw = b"write me to disk";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        let gzipped = encoder.finish().unwrap();
        let encoded = BASE64.encode(gzipped);

        for spelling in ["gz+base64", "gzip+base64", "gz+b64", "gzip+b64"] {
            assert_eq!(
                decode_content(&encoded, &parse_encoding_scheme(spelling)).unwrap(),
                raw
            );
        }
    }

    #[test]
    fn corrupt_encodings_error_instead_of_writing_garbage() {
        assert!(decode_content("!!!", &["base64"]).is_err());
        assert!(decode_content("definitely-not-gzip", &["gzip"]).is_err());
    }

    // =========================================================================
    // Template stories
    // =========================================================================

    #[test]
    fn templates_substitute_hostname_and_download_path() {
        let content = "curl {{ .BundleDownloadPath }}/bundle.tar && echo {{ .Hostname }}";
        let rendered = render_template(content, "h1", "/var/lib/bundles");
        assert_eq!(rendered, "curl /var/lib/bundles/bundle.tar && echo h1");
    }

    // =========================================================================
    // Kubeadm interception stories
    // =========================================================================
    //
    // The interception layer is what makes invariant 3 (provider-ID
    // consistency) hold on the kubeadm path: the same provider ID the
    // controller writes to the Node is planted into kubeletExtraArgs here.

    const KUBEADM_DOC: &str = "apiVersion: kubeadm.k8s.io/v1beta3\n\
                               kind: JoinConfiguration\n\
                               nodeRegistration:\n\
                               \x20 name: h1\n";

    #[test]
    fn kubeadm_config_gains_provider_id() {
        let out = intercept_kubeadm_config(KUBEADM_DOC, "h1", &Default::default(), &[]);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(
            parsed["nodeRegistration"]["kubeletExtraArgs"]["provider-id"].as_str(),
            Some("hostpool://h1")
        );
    }

    #[test]
    fn kubeadm_config_gains_labels_and_taints() {
        let labels = [("pool".to_string(), "gpu".to_string())].into_iter().collect();
        let taints = vec![Taint {
            key: "dedicated".to_string(),
            value: Some("ml".to_string()),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }];

        let out = intercept_kubeadm_config(KUBEADM_DOC, "h1", &labels, &taints);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        let extra = &parsed["nodeRegistration"]["kubeletExtraArgs"];
        assert_eq!(extra["node-labels"].as_str(), Some("pool=gpu"));
        assert_eq!(
            extra["register-with-taints"].as_str(),
            Some("dedicated=ml:NoSchedule")
        );
    }

    /// Values the cluster manager already set win over injection.
    #[test]
    fn existing_extra_args_are_preserved() {
        let doc = "nodeRegistration:\n\
                   \x20 kubeletExtraArgs:\n\
                   \x20   provider-id: custom://already-set\n";
        let out = intercept_kubeadm_config(doc, "h1", &Default::default(), &[]);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(
            parsed["nodeRegistration"]["kubeletExtraArgs"]["provider-id"].as_str(),
            Some("custom://already-set")
        );
    }

    /// Non-kubeadm YAML (no nodeRegistration) passes through byte-identical.
    #[test]
    fn non_kubeadm_documents_are_untouched() {
        let doc = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n";
        assert_eq!(
            intercept_kubeadm_config(doc, "h1", &Default::default(), &[]),
            doc
        );
    }

    /// A taint without a value falls back to its key, matching kubelet's
    /// accepted syntax.
    #[test]
    fn valueless_taints_use_the_key() {
        let taints = vec![Taint {
            key: "gpu".to_string(),
            value: None,
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }];
        assert_eq!(format_taints(&taints), "gpu=gpu:NoSchedule");
    }

    // =========================================================================
    // Executor stories
    // =========================================================================

    /// Files are written (with parent directories) before any command runs,
    /// and commands run in declared order.
    #[tokio::test]
    async fn executor_writes_files_then_runs_commands() {
        let doc = "write_files:\n\
                   - path: /etc/kubernetes/kubeadm.yaml\n\
                   \x20 content: |\n\
                   \x20   nodeRegistration:\n\
                   \x20     name: h1\n\
                   runCmd:\n\
                   - kubeadm join --config /etc/kubernetes/kubeadm.yaml\n";

        let mut writer = MockFileWriter::new();
        writer
            .expect_mkdir_if_not_exists()
            .withf(|p| p == "/etc/kubernetes")
            .times(1)
            .returning(|_| Ok(()));
        writer
            .expect_write_file()
            .withf(|f| {
                f.path == "/etc/kubernetes/kubeadm.yaml"
                    && f.content.contains("provider-id: hostpool://h1")
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut runner = MockCmdRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.starts_with("kubeadm join"))
            .times(1)
            .returning(|_| Ok(()));

        let executor = ScriptExecutor {
            file_writer: Arc::new(writer),
            cmd_runner: Arc::new(runner),
            hostname: "h1".to_string(),
            labels: Default::default(),
            taints: Vec::new(),
            download_path: "/tmp/bundles".to_string(),
        };
        executor.execute(doc).await.unwrap();
    }

    /// A failing command aborts the run and surfaces the error.
    #[tokio::test]
    async fn executor_aborts_on_command_failure() {
        let doc = "runCmd:\n- first\n- second\n";

        let mut runner = MockCmdRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd == "first")
            .times(1)
            .returning(|_| Err(crate::Error::command("boom")));
        // "second" must never run

        let executor = ScriptExecutor {
            file_writer: Arc::new(MockFileWriter::new()),
            cmd_runner: Arc::new(runner),
            hostname: "h1".to_string(),
            labels: Default::default(),
            taints: Vec::new(),
            download_path: String::new(),
        };
        assert!(executor.execute(doc).await.is_err());
    }
}
