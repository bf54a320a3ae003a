//! Tabular export of a project's accumulated scan results.
//!
//! Streams every stored result as one CSV row: the component key, the
//! commit, then one column per configured metric key in order. Results
//! are read in pages so a large project never loads at once.

use std::sync::Arc;

use crate::error::Result;
use crate::store::{Page, Store};
use scanforge_core::ProjectId;

/// Page size for streaming results out of the store.
const EXPORT_PAGE_SIZE: usize = 500;

/// Streams scan results as CSV.
pub struct Exporter<S> {
    store: Arc<S>,
}

impl<S> std::fmt::Debug for Exporter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter").finish()
    }
}

impl<S: Store> Exporter<S> {
    /// Creates an exporter over the store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Writes a project's results to `writer` as CSV and returns the
    /// number of data rows.
    ///
    /// The header is `component_key, commit_sha` followed by the metric
    /// keys; metrics a result lacks render as empty cells.
    pub async fn export_csv<W: std::io::Write>(
        &self,
        project_id: &ProjectId,
        metric_keys: &[String],
        writer: W,
    ) -> Result<u64> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let mut header = vec!["component_key".to_string(), "commit_sha".to_string()];
        header.extend(metric_keys.iter().cloned());
        csv_writer.write_record(&header)?;

        let mut rows = 0_u64;
        let mut offset = 0;
        loop {
            let results = self
                .store
                .results_by_project(project_id, Page::new(offset, EXPORT_PAGE_SIZE))
                .await?;
            if results.is_empty() {
                break;
            }
            offset += results.len();

            for result in results {
                let commit_sha = self
                    .store
                    .get_job(&result.scan_job_id)
                    .await?
                    .map(|job| job.commit_sha)
                    .unwrap_or_default();

                let mut record = vec![result.component_key.clone(), commit_sha];
                for key in metric_keys {
                    record.push(
                        result
                            .metrics
                            .get(key)
                            .map(crate::record::MetricValue::render)
                            .unwrap_or_default(),
                    );
                }
                csv_writer.write_record(&record)?;
                rows += 1;
            }
        }
        csv_writer.flush().map_err(|e| crate::error::Error::Csv {
            message: e.to_string(),
        })?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ScanJob;
    use crate::record::{MetricValue, ScanResult};
    use crate::store::memory::InMemoryStore;
    use std::collections::BTreeMap;

    async fn seed_result(
        store: &InMemoryStore,
        project_id: ProjectId,
        commit: &str,
        ncloc: f64,
    ) -> ScanJob {
        let job = ScanJob::new(project_id, "acme/lib", commit);
        store.insert_job(&job).await.unwrap();

        let mut metrics = BTreeMap::new();
        metrics.insert("ncloc".to_string(), MetricValue::Number(ncloc));
        metrics.insert(
            "alert_status".to_string(),
            MetricValue::Text("OK".to_string()),
        );
        let result = ScanResult::new(
            job.id,
            project_id,
            format!("acme_{commit}"),
            format!("AX-{commit}"),
            metrics,
        );
        store.upsert_result(&result).await.unwrap();
        job
    }

    #[tokio::test]
    async fn export_writes_header_and_one_row_per_result() {
        let store = Arc::new(InMemoryStore::new());
        let project_id = ProjectId::generate();
        seed_result(&store, project_id, "c1", 120.0).await;
        seed_result(&store, project_id, "c2", 140.0).await;

        let keys = vec!["ncloc".to_string(), "alert_status".to_string()];
        let mut buffer = Vec::new();
        let rows = Exporter::new(store)
            .export_csv(&project_id, &keys, &mut buffer)
            .await
            .expect("export succeeds");
        assert_eq!(rows, 2);

        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("component_key,commit_sha,ncloc,alert_status"));
        assert!(text.contains("acme_c1,c1,120,OK"));
        assert!(text.contains("acme_c2,c2,140,OK"));
    }

    #[tokio::test]
    async fn missing_metric_renders_as_empty_cell() {
        let store = Arc::new(InMemoryStore::new());
        let project_id = ProjectId::generate();
        seed_result(&store, project_id, "c1", 120.0).await;

        let keys = vec!["ncloc".to_string(), "coverage".to_string()];
        let mut buffer = Vec::new();
        Exporter::new(store)
            .export_csv(&project_id, &keys, &mut buffer)
            .await
            .unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("acme_c1,c1,120,\n") || text.contains("acme_c1,c1,120,\r\n"));
    }

    #[tokio::test]
    async fn empty_project_exports_header_only() {
        let store = Arc::new(InMemoryStore::new());
        let mut buffer = Vec::new();
        let rows = Exporter::new(store)
            .export_csv(&ProjectId::generate(), &["ncloc".to_string()], &mut buffer)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(
            String::from_utf8(buffer).unwrap().lines().count(),
            1
        );
    }
}
