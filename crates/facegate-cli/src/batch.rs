//! Batch manifests: many independent verifications in one JSON file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use facegate_core::{EngineHandle, ImageSource, VerificationResult};
use serde::{Deserialize, Serialize};

/// One manifest entry. Either `reference` or `references` (or both) must be given.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub reference: Option<PathBuf>,
    #[serde(default)]
    pub references: Vec<PathBuf>,
    pub probe: PathBuf,
    #[serde(default)]
    pub threshold: Option<f32>,
}

impl BatchEntry {
    pub fn all_references(&self) -> Vec<PathBuf> {
        self.reference.iter().chain(self.references.iter()).cloned().collect()
    }
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub probe: PathBuf,
    pub result: VerificationResult,
}

/// Parse a manifest; relative image paths resolve against the manifest's directory.
pub fn load_manifest(path: &Path) -> Result<Vec<BatchEntry>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
    let mut entries: Vec<BatchEntry> =
        serde_json::from_str(&text).with_context(|| format!("parsing manifest {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for (i, entry) in entries.iter_mut().enumerate() {
        if entry.reference.is_none() && entry.references.is_empty() {
            bail!("manifest entry {i} has no reference image");
        }
        entry.probe = base.join(&entry.probe);
        entry.reference = entry.reference.as_ref().map(|r| base.join(r));
        entry.references = entry.references.iter().map(|r| base.join(r)).collect();
    }
    Ok(entries)
}

/// Submit every entry to the pool at once and collect results in manifest order.
pub async fn run(handle: &EngineHandle, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
    let tasks: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let probe = ImageSource::Path(entry.probe.clone());
                let mut references: Vec<ImageSource> =
                    entry.all_references().into_iter().map(ImageSource::Path).collect();
                let result = if references.len() == 1 {
                    let reference = references.remove(0);
                    handle.verify(reference, probe, entry.threshold).await?
                } else {
                    handle.verify_enrolled(references, probe, entry.threshold).await?
                };
                Ok::<_, anyhow::Error>(BatchOutcome { id: entry.id, probe: entry.probe, result })
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        outcomes.push(task.await??);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_paths_resolve_against_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "a", "reference": "ref.png", "probe": "probe.png"},
                {"references": ["r1.png", "/abs/r2.png"], "probe": "p.png", "threshold": 0.8}
            ]"#,
        )
        .unwrap();

        let entries = load_manifest(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id.as_deref(), Some("a"));
        assert_eq!(entries[0].all_references(), vec![dir.path().join("ref.png")]);
        assert_eq!(entries[0].probe, dir.path().join("probe.png"));
        assert_eq!(
            entries[1].all_references(),
            vec![dir.path().join("r1.png"), PathBuf::from("/abs/r2.png")]
        );
        assert_eq!(entries[1].threshold, Some(0.8));
    }

    #[test]
    fn test_entry_without_reference_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"[{"probe": "p.png"}]"#).unwrap();
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("no reference"));
    }

    #[tokio::test]
    async fn test_run_reports_each_entry() {
        use facegate_core::{spawn_workers, Capabilities, EngineOptions, VerificationEngine};
        use std::sync::Arc;

        let engine = Arc::new(VerificationEngine::new(Capabilities::empty(), EngineOptions::default()));
        let handle = spawn_workers(engine, 2).unwrap();
        let entries = vec![
            BatchEntry {
                id: Some("missing".into()),
                reference: Some(PathBuf::from("/nonexistent/a.png")),
                references: vec![],
                probe: PathBuf::from("/nonexistent/b.png"),
                threshold: None,
            },
            BatchEntry {
                id: None,
                reference: None,
                references: vec![PathBuf::from("/nonexistent/c.png"), PathBuf::from("/nonexistent/d.png")],
                probe: PathBuf::from("/nonexistent/e.png"),
                threshold: Some(0.9),
            },
        ];

        let outcomes = run(&handle, entries).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].id.as_deref(), Some("missing"));
        assert!(outcomes[0].result.error.as_deref().unwrap().contains("reference"));
        assert!(outcomes[1].result.error.as_deref().unwrap().contains("probe"));
        assert!((outcomes[1].result.threshold - 90.0).abs() < 1e-4);
    }
}
