use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::debug;

use crate::error::{Result, StrataError};
use crate::storage::filter::sql_literal;
use crate::storage::{ResourcePool, VectorEntry, VectorIndex, VectorMatch};

const VECTORS_TABLE: &str = "chunk_vectors";

/// Chunk embeddings in a LanceDB table, one row per chunk
pub struct LanceVectorIndex {
    table: Table,
    dimensions: usize,
    pool: ResourcePool,
}

impl LanceVectorIndex {
    /// Connect to the database at `path`, creating the table on first use.
    pub async fn open(path: &Path, dimensions: usize, pool: ResourcePool) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| StrataError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to list tables: {e}")))?;

        let table = if names.iter().any(|n| n == VECTORS_TABLE) {
            connection
                .open_table(VECTORS_TABLE)
                .execute()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to open vectors table: {e}")))?
        } else {
            let schema = Self::schema(dimensions)?;
            let batch = Self::to_batch(&[], dimensions, schema.clone())?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            debug!(dimensions, "Creating vectors table");
            connection
                .create_table(VECTORS_TABLE, Box::new(batches))
                .execute()
                .await
                .map_err(|e| {
                    StrataError::Storage(format!("Failed to create vectors table: {e}"))
                })?
        };

        Ok(Self {
            table,
            dimensions,
            pool,
        })
    }

    fn schema(dimensions: usize) -> Result<Arc<Schema>> {
        let size = i32::try_from(dimensions)
            .map_err(|_| StrataError::Config(format!("{dimensions} dimensions is too many")))?;
        Ok(Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("project_id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), size),
                false,
            ),
            Field::new(
                "updated_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ])))
    }

    fn to_batch(entries: &[VectorEntry], dimensions: usize, schema: Arc<Schema>) -> Result<RecordBatch> {
        let size = i32::try_from(dimensions)
            .map_err(|_| StrataError::Config(format!("{dimensions} dimensions is too many")))?;
        let chunk_ids: Vec<&str> = entries.iter().map(|e| e.chunk_id.as_str()).collect();
        let project_ids: Vec<&str> = entries.iter().map(|e| e.project_id.as_str()).collect();
        let vectors: Vec<Option<Vec<Option<f32>>>> = entries
            .iter()
            .map(|e| Some(e.vector.iter().map(|&v| Some(v)).collect()))
            .collect();
        let updated_at: Vec<i64> = entries
            .iter()
            .map(|e| e.updated_at.timestamp_micros())
            .collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(project_ids)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(vectors, size)),
                Arc::new(TimestampMicrosecondArray::from(updated_at).with_timezone("UTC")),
            ],
        )
        .map_err(|e| StrataError::Storage(format!("Failed to build record batch: {e}")))
    }

    fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| StrataError::Storage(format!("Failed to get {name} column")))
    }

    fn batch_to_entry(batch: &RecordBatch, row: usize) -> Result<VectorEntry> {
        let chunk_ids = Self::string_column(batch, "chunk_id")?;
        let project_ids = Self::string_column(batch, "project_id")?;
        let vectors = batch
            .column_by_name("vector")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| StrataError::Storage("Failed to get vector column".to_string()))?;
        let updated = batch
            .column_by_name("updated_at")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMicrosecondArray>())
            .ok_or_else(|| StrataError::Storage("Failed to get updated_at column".to_string()))?;

        let values = vectors.value(row);
        let values = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| StrataError::Storage("Failed to get vector values".to_string()))?;
        let updated_at = Utc
            .timestamp_micros(updated.value(row))
            .single()
            .ok_or_else(|| StrataError::Storage("Invalid updated_at timestamp".to_string()))?;

        Ok(VectorEntry {
            chunk_id: chunk_ids.value(row).to_string(),
            project_id: project_ids.value(row).to_string(),
            vector: (0..values.len()).map(|i| values.value(i)).collect(),
            updated_at,
        })
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(StrataError::Validation(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    fn id_filter(chunk_id: &str) -> String {
        format!("chunk_id = '{}'", sql_literal(chunk_id))
    }

    async fn query_one(&self, chunk_id: &str) -> Result<Option<VectorEntry>> {
        let stream = self
            .table
            .query()
            .only_if(Self::id_filter(chunk_id))
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to query vector: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to collect query results: {e}")))?;

        match batches.iter().find(|b| b.num_rows() > 0) {
            Some(batch) => Ok(Some(Self::batch_to_entry(batch, 0)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        self.check_dimensions(&entry.vector)?;
        self.pool
            .run("vector.upsert", async {
                self.table
                    .delete(&Self::id_filter(&entry.chunk_id))
                    .await
                    .map_err(|e| StrataError::Storage(format!("Failed to replace vector: {e}")))?;

                let schema = Self::schema(self.dimensions)?;
                let batch =
                    Self::to_batch(std::slice::from_ref(entry), self.dimensions, schema.clone())?;
                let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
                self.table
                    .add(Box::new(batches))
                    .execute()
                    .await
                    .map_err(|e| StrataError::Storage(format!("Failed to insert vector: {e}")))?;
                Ok(())
            })
            .await
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<VectorEntry>> {
        self.pool
            .run("vector.get", self.query_one(chunk_id))
            .await
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("vector.delete", async {
                let exists = self.query_one(chunk_id).await?.is_some();
                if exists {
                    self.table
                        .delete(&Self::id_filter(chunk_id))
                        .await
                        .map_err(|e| {
                            StrataError::Storage(format!("Failed to delete vector: {e}"))
                        })?;
                }
                Ok(exists)
            })
            .await
    }

    async fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        self.check_dimensions(vector)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.pool
            .run("vector.nearest", async {
                let stream = self
                    .table
                    .query()
                    .nearest_to(vector)
                    .map_err(|e| {
                        StrataError::Storage(format!("Failed to create vector query: {e}"))
                    })?
                    .only_if(format!("project_id = '{}'", sql_literal(project_id)))
                    .limit(limit)
                    .execute()
                    .await
                    .map_err(|e| StrataError::Storage(format!("Failed to execute search: {e}")))?;

                let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(|e| {
                    StrataError::Storage(format!("Failed to collect search results: {e}"))
                })?;

                let mut matches = Vec::new();
                for batch in &batches {
                    let chunk_ids = Self::string_column(batch, "chunk_id")?;
                    let project_ids = Self::string_column(batch, "project_id")?;
                    let distances = batch
                        .column_by_name("_distance")
                        .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                        .ok_or_else(|| {
                            StrataError::Storage("Failed to get _distance column".to_string())
                        })?;
                    for row in 0..batch.num_rows() {
                        matches.push(VectorMatch {
                            chunk_id: chunk_ids.value(row).to_string(),
                            project_id: project_ids.value(row).to_string(),
                            distance: distances.value(row),
                        });
                    }
                }
                matches.sort_by(|a, b| {
                    a.distance
                        .total_cmp(&b.distance)
                        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
                });
                Ok(matches)
            })
            .await
    }

    async fn count(&self) -> Result<usize> {
        self.pool
            .run("vector.count", async {
                self.table
                    .count_rows(None)
                    .await
                    .map_err(|e| StrataError::Storage(format!("Failed to count vectors: {e}")))
            })
            .await
    }
}
