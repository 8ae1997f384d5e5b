// Local Filesystem Warehouse
//
// Directory-backed destination so the target runs end to end without a
// cloud client:
//
//   <root>/<project>/<dataset>/dataset.json
//   <root>/<project>/<dataset>/<table>/table.json
//   <root>/<project>/<dataset>/<table>/rows.jsonl
//
// New rows are appended and fsynced before a call returns; a failed
// append is cut back to the last committed length. Rows that replace
// earlier ones by key rewrite the row file, and metadata files are always
// replaced atomically through a rename.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::schema::{Column, Record};
use crate::warehouse::{
    row_key, DatasetRef, InsertRow, LoadJob, PartitionConfig, TableInfo, TableRef, Warehouse,
    WarehouseError,
};

const TABLE_FILE: &str = "table.json";
const ROWS_FILE: &str = "rows.jsonl";

/// Row file bookkeeping for one table.
#[derive(Debug, Default)]
struct TableRows {
    /// Lines currently in the row file.
    lines: usize,
    /// Line index of every keyed row written by this process.
    by_key: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Seen {
    jobs: HashSet<Uuid>,
    tables: HashMap<TableRef, TableRows>,
    /// Fail the next append after this many bytes.
    #[cfg(test)]
    tear_next_append: Option<usize>,
}

/// One encoded row, newline included, and its merge identity.
type KeyedLine = (Option<String>, Vec<u8>);

/// Warehouse rooted at a local directory.
///
/// Load job ids and row keys are remembered for the life of the process,
/// which gives the same best-effort deduplication window a hosted
/// warehouse offers. Writes are serialized.
#[derive(Debug)]
pub struct LocalWarehouse {
    root: PathBuf,
    seen: Mutex<Seen>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_dir(&self, project: &str, dataset: &str) -> PathBuf {
        self.root.join(project).join(dataset)
    }

    fn table_dir(&self, table: &TableRef) -> PathBuf {
        self.dataset_dir(&table.project, &table.dataset)
            .join(&table.table)
    }

    /// Path of the row file for `table`.
    pub fn rows_path(&self, table: &TableRef) -> PathBuf {
        self.table_dir(table).join(ROWS_FILE)
    }

    async fn read_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError> {
        match fs::read(self.table_dir(table).join(TABLE_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_table(&self, info: &TableInfo) -> Result<(), WarehouseError> {
        let bytes = serde_json::to_vec_pretty(info)?;
        replace_file(&self.table_dir(&info.table).join(TABLE_FILE), &bytes).await
    }

    /// Store `rows` in order. A keyed row replaces the row already stored
    /// under its key, or an earlier row of the same call.
    async fn write_rows(
        &self,
        seen: &mut Seen,
        table: &TableRef,
        rows: Vec<KeyedLine>,
    ) -> Result<(), WarehouseError> {
        if self.read_table(table).await?.is_none() {
            return Err(WarehouseError::NotFound(table.to_string()));
        }

        let path = self.rows_path(table);
        let state = match seen.tables.entry(table.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(TableRows {
                lines: count_lines(&path).await?,
                by_key: HashMap::new(),
            }),
        };

        let mut replaced: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut appended: Vec<Vec<u8>> = Vec::new();
        let mut new_keys: HashMap<String, usize> = HashMap::new();

        for (key, line) in rows {
            let Some(key) = key else {
                appended.push(line);
                continue;
            };
            let stored = new_keys
                .get(&key)
                .or_else(|| state.by_key.get(&key))
                .copied();
            match stored {
                Some(index) if index < state.lines => {
                    replaced.insert(index, line);
                }
                Some(index) => appended[index - state.lines] = line,
                None => {
                    new_keys.insert(key, state.lines + appended.len());
                    appended.push(line);
                }
            }
        }

        if replaced.is_empty() {
            #[cfg(test)]
            let tear_at = seen_tear(&mut seen.tear_next_append);
            #[cfg(not(test))]
            let tear_at = None;
            append_lines(&path, &appended, tear_at).await?;
        } else {
            rewrite_lines(&path, &replaced, &appended).await?;
        }

        let state = seen.tables.entry(table.clone()).or_default();
        state.lines += appended.len();
        state.by_key.extend(new_keys);
        Ok(())
    }
}

#[cfg(test)]
fn seen_tear(tear: &mut Option<usize>) -> Option<usize> {
    tear.take()
}

/// Write `bytes` to `path` through a synced temporary file and a rename.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), WarehouseError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_lines(path: &Path) -> Result<Vec<Vec<u8>>, WarehouseError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut line = line.to_vec();
            line.push(b'\n');
            line
        })
        .collect())
}

async fn count_lines(path: &Path) -> Result<usize, WarehouseError> {
    Ok(read_lines(path).await?.len())
}

/// Append `lines` and sync. On failure the file is cut back to its
/// length before the call, so a retry never sees a torn tail.
async fn append_lines(
    path: &Path,
    lines: &[Vec<u8>],
    tear_at: Option<usize>,
) -> Result<(), WarehouseError> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let committed = file.metadata().await?.len();
    let payload = lines.concat();

    let written: io::Result<()> = async {
        if let Some(at) = tear_at {
            file.write_all(&payload[..at.min(payload.len())]).await?;
            return Err(io::Error::new(io::ErrorKind::Other, "write interrupted"));
        }
        file.write_all(&payload).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        if let Err(truncate) = file.set_len(committed).await {
            warn!(path = %path.display(), error = %truncate, "could not roll back partial append");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Rewrite the row file with `replaced` lines swapped in by index and
/// `appended` lines at the end.
async fn rewrite_lines(
    path: &Path,
    replaced: &HashMap<usize, Vec<u8>>,
    appended: &[Vec<u8>],
) -> Result<(), WarehouseError> {
    let mut payload = Vec::new();
    for (index, line) in read_lines(path).await?.into_iter().enumerate() {
        payload.extend_from_slice(replaced.get(&index).unwrap_or(&line));
    }
    for line in appended {
        payload.extend_from_slice(line);
    }
    replace_file(path, &payload).await
}

fn encode_line(row: &Record) -> Result<Vec<u8>, WarehouseError> {
    let mut line = serde_json::to_vec(row)?;
    line.push(b'\n');
    Ok(line)
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    async fn ensure_dataset(
        &self,
        dataset: &DatasetRef,
        location: &str,
    ) -> Result<(), WarehouseError> {
        let dir = self.dataset_dir(&dataset.project, &dataset.dataset);
        let marker = dir.join("dataset.json");
        if fs::try_exists(&marker).await? {
            return Ok(());
        }

        fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(&json!({
            "dataset": dataset.to_string(),
            "location": location,
        }))?;
        fs::write(&marker, body).await?;
        tracing::info!(dataset = %dataset, location, "created dataset");
        Ok(())
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError> {
        self.read_table(table).await
    }

    async fn create_table(
        &self,
        table: &TableRef,
        columns: &[Column],
        partitioning: Option<&PartitionConfig>,
    ) -> Result<TableInfo, WarehouseError> {
        let dataset_dir = self.dataset_dir(&table.project, &table.dataset);
        if !fs::try_exists(&dataset_dir).await? {
            return Err(WarehouseError::NotFound(format!(
                "{}.{}",
                table.project, table.dataset
            )));
        }
        if self.read_table(table).await?.is_some() {
            return Err(WarehouseError::AlreadyExists(table.to_string()));
        }

        fs::create_dir_all(self.table_dir(table)).await?;
        let info = TableInfo {
            table: table.clone(),
            columns: columns.to_vec(),
            partitioning: partitioning.cloned(),
        };
        self.write_table(&info).await?;
        Ok(info)
    }

    async fn update_columns(
        &self,
        table: &TableRef,
        columns: &[Column],
    ) -> Result<TableInfo, WarehouseError> {
        let mut info = self
            .read_table(table)
            .await?
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;
        info.columns = columns.to_vec();
        self.write_table(&info).await?;
        Ok(info)
    }

    async fn load_rows(&self, table: &TableRef, job: &LoadJob) -> Result<(), WarehouseError> {
        let mut seen = self.seen.lock().await;
        if seen.jobs.contains(&job.job_id) {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(job.row_count);
        for line in job.rows.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let key = if job.merge_key.is_empty() {
                None
            } else {
                match serde_json::from_slice::<Value>(line)? {
                    Value::Object(row) => row_key(&job.merge_key, &row),
                    _ => return Err(WarehouseError::Rejected("row is not an object".into())),
                }
            };
            let mut line = line.to_vec();
            line.push(b'\n');
            rows.push((key, line));
        }

        self.write_rows(&mut seen, table, rows).await?;
        seen.jobs.insert(job.job_id);
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[InsertRow],
    ) -> Result<(), WarehouseError> {
        let lines = rows
            .iter()
            .map(|row| Ok((Some(row.insert_id.clone()), encode_line(&row.row)?)))
            .collect::<Result<Vec<_>, WarehouseError>>()?;

        let mut seen = self.seen.lock().await;
        self.write_rows(&mut seen, table, lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn dataset() -> DatasetRef {
        DatasetRef {
            project: "acme".into(),
            dataset: "raw".into(),
        }
    }

    #[tokio::test]
    async fn create_load_and_evolve() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path());
        let table = dataset().table("users");

        warehouse.ensure_dataset(&dataset(), "EU").await.unwrap();
        warehouse
            .create_table(&table, &[Column::new("id", FieldType::Integer)], None)
            .await
            .unwrap();

        let job = LoadJob {
            job_id: Uuid::new_v4(),
            columns: vec![Column::new("id", FieldType::Integer)],
            rows: b"{\"id\":1}\n{\"id\":2}\n".to_vec(),
            row_count: 2,
            merge_key: Vec::new(),
        };
        warehouse.load_rows(&table, &job).await.unwrap();
        warehouse.load_rows(&table, &job).await.unwrap();

        let rows = std::fs::read_to_string(warehouse.rows_path(&table)).unwrap();
        assert_eq!(rows.lines().count(), 2);

        let updated = warehouse
            .update_columns(
                &table,
                &[
                    Column::new("id", FieldType::Integer),
                    Column::new("name", FieldType::String),
                ],
            )
            .await
            .unwrap();
        assert_eq!(updated.columns.len(), 2);
        assert_eq!(
            warehouse.get_table(&table).await.unwrap().unwrap().columns,
            updated.columns
        );
    }

    #[tokio::test]
    async fn missing_table_and_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = LocalWarehouse::new(dir.path());
        let table = dataset().table("users");

        assert_eq!(warehouse.get_table(&table).await.unwrap(), None);
        assert!(matches!(
            warehouse.create_table(&table, &[], None).await,
            Err(WarehouseError::NotFound(_))
        ));
    }

    async fn table_with_rows(dir: &Path, name: &str) -> (LocalWarehouse, TableRef) {
        let warehouse = LocalWarehouse::new(dir);
        let table = dataset().table(name);
        warehouse.ensure_dataset(&dataset(), "US").await.unwrap();
        warehouse.create_table(&table, &[], None).await.unwrap();
        (warehouse, table)
    }

    fn stored(warehouse: &LocalWarehouse, table: &TableRef) -> Vec<Value> {
        std::fs::read_to_string(warehouse.rows_path(table))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn insert(insert_id: &str, row: Value) -> InsertRow {
        InsertRow {
            insert_id: insert_id.into(),
            row: row.as_object().unwrap().clone(),
        }
    }

    #[tokio::test]
    async fn streamed_rows_upsert_by_insert_id() {
        let dir = tempfile::tempdir().unwrap();
        let (warehouse, table) = table_with_rows(dir.path(), "events").await;

        warehouse
            .insert_rows(&table, &[insert("a", json!({"id": "a"})), insert("b", json!({"id": "b"}))])
            .await
            .unwrap();
        warehouse
            .insert_rows(&table, &[insert("b", json!({"id": "b"})), insert("c", json!({"id": "c"}))])
            .await
            .unwrap();

        assert_eq!(stored(&warehouse, &table).len(), 3);
    }

    #[tokio::test]
    async fn later_row_with_same_key_replaces_earlier_one() {
        let dir = tempfile::tempdir().unwrap();
        let (warehouse, table) = table_with_rows(dir.path(), "users").await;

        warehouse
            .insert_rows(&table, &[insert("[1]", json!({"id": 1, "name": "old"}))])
            .await
            .unwrap();
        warehouse
            .insert_rows(&table, &[insert("[2]", json!({"id": 2, "name": "other"}))])
            .await
            .unwrap();
        warehouse
            .insert_rows(&table, &[insert("[1]", json!({"id": 1, "name": "new"}))])
            .await
            .unwrap();

        assert_eq!(
            stored(&warehouse, &table),
            vec![
                json!({"id": 1, "name": "new"}),
                json!({"id": 2, "name": "other"})
            ]
        );
    }

    #[tokio::test]
    async fn same_key_within_one_call_keeps_the_last_row() {
        let dir = tempfile::tempdir().unwrap();
        let (warehouse, table) = table_with_rows(dir.path(), "users").await;

        warehouse
            .insert_rows(
                &table,
                &[
                    insert("[1]", json!({"id": 1, "name": "old"})),
                    insert("[1]", json!({"id": 1, "name": "new"})),
                ],
            )
            .await
            .unwrap();

        assert_eq!(stored(&warehouse, &table), vec![json!({"id": 1, "name": "new"})]);
    }

    #[tokio::test]
    async fn keyed_load_jobs_merge() {
        let dir = tempfile::tempdir().unwrap();
        let (warehouse, table) = table_with_rows(dir.path(), "users").await;
        let job = |rows: &str| LoadJob {
            job_id: Uuid::new_v4(),
            columns: Vec::new(),
            rows: rows.as_bytes().to_vec(),
            row_count: rows.lines().count(),
            merge_key: vec!["id".into()],
        };

        warehouse
            .load_rows(&table, &job("{\"id\":1,\"v\":1}\n{\"id\":2,\"v\":1}\n"))
            .await
            .unwrap();
        warehouse
            .load_rows(&table, &job("{\"id\":1,\"v\":2}\n{\"v\":3}\n"))
            .await
            .unwrap();

        assert_eq!(
            stored(&warehouse, &table),
            vec![
                json!({"id": 1, "v": 2}),
                json!({"id": 2, "v": 1}),
                json!({"v": 3})
            ]
        );
    }

    #[tokio::test]
    async fn failed_append_is_rolled_back_before_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (warehouse, table) = table_with_rows(dir.path(), "users").await;
        let first = LoadJob {
            job_id: Uuid::new_v4(),
            columns: Vec::new(),
            rows: b"{\"id\":1}\n".to_vec(),
            row_count: 1,
            merge_key: Vec::new(),
        };
        warehouse.load_rows(&table, &first).await.unwrap();

        let job = LoadJob {
            job_id: Uuid::new_v4(),
            columns: Vec::new(),
            rows: b"{\"id\":2}\n{\"id\":3}\n".to_vec(),
            row_count: 2,
            merge_key: Vec::new(),
        };
        warehouse.seen.lock().await.tear_next_append = Some(5);
        assert!(warehouse.load_rows(&table, &job).await.is_err());
        assert_eq!(stored(&warehouse, &table), vec![json!({"id": 1})]);

        warehouse.load_rows(&table, &job).await.unwrap();
        assert_eq!(
            stored(&warehouse, &table),
            vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]
        );
    }
}
