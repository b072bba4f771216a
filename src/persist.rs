//! Writing the result document.
//!
//! The output file is replaced atomically: the JSON is written to a
//! sibling temp file and renamed over the target, so a reader never sees
//! a half-written document.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::PipelineResult;

/// Serialize `result` as pretty JSON and atomically replace `path`.
pub fn write_result(path: &Path, result: &PipelineResult) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let mut json = serde_json::to_vec_pretty(result)?;
    json.push(b'\n');

    let tmp = temp_path(path);
    let written = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move result into {}", path.display()))?;
        Ok(())
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Render `result` the same way [`write_result`] does, for stdout.
pub fn render_result(result: &PipelineResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result.json".to_string());
    path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultMeta;
    use tempfile::TempDir;

    fn result(parsed_count: usize) -> PipelineResult {
        PipelineResult {
            meta: ResultMeta {
                ok: true,
                diagnostic: None,
                source_url: "https://example.org/".to_string(),
                archive_url: None,
                entry_name: None,
                format: None,
                parsed_count,
                truncated: false,
                generated_at: chrono::Utc::now(),
            },
            incidents: Vec::new(),
        }
    }

    #[test]
    fn creates_parent_dirs_and_replaces_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("public/nested/latest.json");

        write_result(&path, &result(1)).unwrap();
        write_result(&path, &result(2)).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["meta"]["parsedCount"], 2);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn rendered_output_matches_written_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        let r = result(3);
        write_result(&path, &r).unwrap();
        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim_end(), render_result(&r).unwrap());
    }
}
