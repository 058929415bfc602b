//! Artifact Retriever
//!
//! After an execution, asks the runtime to bundle the files its working
//! directories produced into a single zip, streams that bundle down through
//! the runtime proxy, and extracts it locally. Retrieval is split into a
//! network stage (run the collection snippet, download bytes) and a pure
//! extraction stage, so the path-traversal guard can be exercised against
//! crafted archives without any network.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::colab::RuntimeApi;
use crate::error::BridgeError;
use crate::execute::{Dispatcher, ExecutionRequest, ExecutionStatus};
use crate::session::ColabSession;

/// Bundle file name inside the runtime's content root.
pub const BUNDLE_NAME: &str = "colab_artifacts.zip";

/// Marker line the collection snippet prints: `COLAB_EXEC_ARTIFACTS <count>`.
const COUNT_MARKER: &str = "COLAB_EXEC_ARTIFACTS";

/// Ceiling on the collection snippet's own runtime.
const COLLECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs on the kernel: scans the usual output locations for artifact files,
/// zips them into the content root, and reports how many were found.
const COLLECT_SNIPPET: &str = r#"
import os, zipfile
_bundle = "/content/colab_artifacts.zip"
_scan_dirs = ["/tmp", os.getcwd(), "/content"]
_exts = ('.png', '.jpg', '.jpeg', '.gif', '.svg', '.csv', '.json',
         '.txt', '.pt', '.pth', '.h5', '.pkl', '.npy', '.npz',
         '.onnx', '.mp4', '.wav', '.mp3', '.pdf')
_collected = []
for _sd in _scan_dirs:
    if not os.path.isdir(_sd):
        continue
    for _root, _dirs, _files in os.walk(_sd):
        _dirs[:] = [d for d in _dirs if not d.startswith('.')]
        for _f in _files:
            _fp = os.path.join(_root, _f)
            if _fp == _bundle or not _f.endswith(_exts):
                continue
            try:
                if os.path.getsize(_fp) < 50 * 1024 * 1024:
                    _collected.append(_fp)
            except OSError:
                pass
_collected = sorted(set(_collected))
if _collected:
    with zipfile.ZipFile(_bundle, 'w', zipfile.ZIP_DEFLATED) as _zf:
        for _fp in _collected:
            _zf.write(_fp, os.path.basename(_fp))
print("COLAB_EXEC_ARTIFACTS %d" % len(_collected), flush=True)
"#;

/// Downloads and unpacks artifact bundles.
pub struct ArtifactRetriever {
    api: Arc<dyn RuntimeApi>,
}

impl ArtifactRetriever {
    pub fn new(api: Arc<dyn RuntimeApi>) -> Self {
        Self { api }
    }

    /// Bundle the session's artifacts and extract them into `output_dir`.
    ///
    /// Returns the extracted relative paths. Never touches an execution
    /// result the caller already holds: any failure here is reported as
    /// `ArtifactRetrieval` on its own.
    pub async fn collect(
        &self,
        dispatcher: &Dispatcher,
        session: &mut ColabSession,
        output_dir: &Path,
    ) -> Result<Vec<String>, BridgeError> {
        let request = ExecutionRequest {
            code: COLLECT_SNIPPET.to_string(),
            accelerator: session.accelerator,
            timeout: COLLECT_TIMEOUT,
        };
        let result = dispatcher
            .execute(session, &request)
            .await
            .map_err(|e| BridgeError::ArtifactRetrieval(format!("collection snippet failed: {e}")))?;

        if result.status != ExecutionStatus::Ok {
            return Err(BridgeError::ArtifactRetrieval(format!(
                "collection snippet finished with status {}",
                result.status.as_str()
            )));
        }

        let count = result
            .cells
            .iter()
            .flat_map(|c| c.stdout.lines())
            .find_map(|line| {
                line.strip_prefix(COUNT_MARKER)
                    .and_then(|rest| rest.trim().parse::<usize>().ok())
            })
            .ok_or_else(|| {
                BridgeError::ArtifactRetrieval("collection snippet reported no count".into())
            })?;

        if count == 0 {
            debug!("No artifacts produced on {}", session.endpoint);
            return Ok(Vec::new());
        }

        let bytes = self
            .api
            .download_file(&session.proxy, BUNDLE_NAME)
            .await
            .map_err(|e| BridgeError::ArtifactRetrieval(format!("bundle download failed: {e}")))?;
        session.touch();

        let target = output_dir.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&bytes, &target))
            .await
            .map_err(|e| BridgeError::ArtifactRetrieval(format!("extraction task failed: {e}")))??;

        info!(
            "Extracted {} artifact(s) into {}",
            extracted.len(),
            output_dir.display()
        );
        Ok(extracted)
    }
}

/// Unpack `bytes` into `target`, creating it if absent.
///
/// Every entry path is validated before any write: an entry that would
/// resolve outside `target` (absolute paths, `..` traversal) fails the whole
/// extraction. A zero-byte or malformed archive fails the same way.
pub fn extract_archive(bytes: &[u8], target: &Path) -> Result<Vec<String>, BridgeError> {
    if bytes.is_empty() {
        return Err(BridgeError::ArtifactRetrieval("empty archive".into()));
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| BridgeError::ArtifactRetrieval(format!("malformed archive: {e}")))?;

    std::fs::create_dir_all(target)?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| BridgeError::ArtifactRetrieval(format!("malformed archive entry: {e}")))?;

        let raw_name = entry.name().to_string();
        let Some(rel) = entry.enclosed_name() else {
            return Err(BridgeError::ArtifactRetrieval(format!(
                "archive entry escapes the output directory: {raw_name}"
            )));
        };

        let dest = target.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted.push(rel.to_string_lossy().into_owned());
    }

    Ok(extracted)
}
