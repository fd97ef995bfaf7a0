use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Writes run summaries as `<root>/<run_id>/<name>.json`.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn report_path(&self, run_id: Uuid, name: &str) -> PathBuf {
        self.root.join(run_id.to_string()).join(format!("{name}.json"))
    }

    /// Serializes `report` next to its final path and renames it into place,
    /// so a reader never sees a half-written summary.
    pub async fn write<T: Serialize>(
        &self,
        run_id: Uuid,
        name: &str,
        report: &T,
    ) -> anyhow::Result<PathBuf> {
        let json = serde_json::to_vec_pretty(report)
            .with_context(|| format!("serializing {name} report for run {run_id}"))?;
        let run_dir = self.root.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let target = self.report_path(run_id, name);
        let staging = run_dir.join(format!(".{name}.json.partial"));
        let mut out = fs::File::create(&staging)
            .await
            .with_context(|| format!("creating {}", staging.display()))?;
        out.write_all(&json).await?;
        out.sync_all()
            .await
            .with_context(|| format!("syncing {}", staging.display()))?;
        drop(out);

        if let Err(err) = fs::rename(&staging, &target).await {
            fs::remove_file(&staging).await.ok();
            return Err(err).with_context(|| format!("publishing {}", target.display()));
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Summary {
        loaded: u64,
        skipped: u64,
    }

    #[tokio::test]
    async fn writes_report_under_run_directory() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());
        let run_id = Uuid::new_v4();

        let path = writer
            .write(run_id, "import", &Summary { loaded: 3, skipped: 1 })
            .await
            .expect("write report");

        assert_eq!(path, dir.path().join(run_id.to_string()).join("import.json"));
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["loaded"], 3);
        assert_eq!(value["skipped"], 1);

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".partial"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rewriting_a_report_replaces_it() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());
        let run_id = Uuid::new_v4();

        writer
            .write(run_id, "sync", &Summary { loaded: 1, skipped: 0 })
            .await
            .expect("first");
        let path = writer
            .write(run_id, "sync", &Summary { loaded: 2, skipped: 0 })
            .await
            .expect("second");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["loaded"], 2);
    }
}
