//! Per-namespace flat vector index with exact cosine search.
//!
//! Each namespace (one docset) holds `{vector, metadata}` records keyed
//! by vector id and persists as a single JSON file under `vectors/`. The
//! first upsert locks the namespace dimensionality; later vectors (and
//! query vectors) must match or the operation fails with
//! [`VectorStoreError::DimensionMismatch`].
//!
//! Search is a brute-force cosine scan — exact, not approximate — which
//! is sufficient at the target per-docset scale.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::VectorStoreError;

/// Denormalised metadata carried with each vector so search can return
/// without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub docset_id: String,
    pub page_id: String,
    pub chunk_id: String,
    pub url: String,
    pub title: Option<String>,
    pub heading: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// A search hit: the record's id, metadata, and cosine score.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceFile {
    vectors: Vec<VectorRecord>,
    dimensions: Option<usize>,
}

#[derive(Debug, Default)]
struct Namespace {
    dimensions: Option<usize>,
    records: Vec<VectorRecord>,
    by_id: HashMap<String, usize>,
}

impl Namespace {
    fn from_file(file: NamespaceFile) -> Self {
        let by_id = file
            .vectors
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Namespace {
            dimensions: file.dimensions,
            records: file.vectors,
            by_id,
        }
    }

    fn to_file(&self) -> NamespaceFile {
        NamespaceFile {
            vectors: self.records.clone(),
            dimensions: self.dimensions,
        }
    }
}

pub struct VectorStore {
    dir: PathBuf,
    namespaces: Mutex<HashMap<String, Namespace>>,
}

impl VectorStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Load the namespace file if present, else initialise an empty index
    /// with dimensions unknown.
    pub async fn init(&self, namespace: &str) -> Result<(), VectorStoreError> {
        let mut namespaces = self.namespaces.lock().await;
        if namespaces.contains_key(namespace) {
            return Ok(());
        }
        let ns = match std::fs::read_to_string(self.file_path(namespace)) {
            Ok(content) => Namespace::from_file(serde_json::from_str(&content)?),
            Err(_) => Namespace::default(),
        };
        namespaces.insert(namespace.to_string(), ns);
        Ok(())
    }

    /// Insert or replace records by id, then persist the namespace file.
    pub async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut namespaces = self.namespaces.lock().await;
        let ns = self.load_entry(&mut namespaces, namespace)?;

        for record in records {
            let dims = *ns.dimensions.get_or_insert(record.vector.len());
            if record.vector.len() != dims {
                return Err(VectorStoreError::DimensionMismatch {
                    namespace: namespace.to_string(),
                    expected: dims,
                    got: record.vector.len(),
                });
            }
            match ns.by_id.get(&record.id) {
                Some(&idx) => ns.records[idx] = record,
                None => {
                    ns.by_id.insert(record.id.clone(), ns.records.len());
                    ns.records.push(record);
                }
            }
        }

        self.persist(namespace, ns)
    }

    /// Exact cosine search: score every stored vector, keep those at or
    /// above `min_score`, and return the top `top_k` sorted descending.
    pub async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>, VectorStoreError> {
        let mut namespaces = self.namespaces.lock().await;
        let ns = self.load_entry(&mut namespaces, namespace)?;

        let Some(dims) = ns.dimensions else {
            return Ok(Vec::new());
        };
        if query.len() != dims {
            return Err(VectorStoreError::DimensionMismatch {
                namespace: namespace.to_string(),
                expected: dims,
                got: query.len(),
            });
        }

        let mut hits: Vec<VectorHit> = ns
            .records
            .iter()
            .map(|r| VectorHit {
                id: r.id.clone(),
                score: cosine_similarity(query, &r.vector),
                metadata: r.metadata.clone(),
            })
            .filter(|h| h.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), VectorStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut namespaces = self.namespaces.lock().await;
        let ns = self.load_entry(&mut namespaces, namespace)?;

        let remove: std::collections::HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        ns.records.retain(|r| !remove.contains(r.id.as_str()));
        ns.by_id = ns
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        self.persist(namespace, ns)
    }

    /// Drop every record in the namespace and remove its file.
    pub async fn clear(&self, namespace: &str) -> Result<(), VectorStoreError> {
        let mut namespaces = self.namespaces.lock().await;
        namespaces.remove(namespace);
        let path = self.file_path(namespace);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub async fn count(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.lock().await;
        namespaces.get(namespace).map(|ns| ns.records.len()).unwrap_or(0)
    }

    pub async fn dimensions(&self, namespace: &str) -> Option<usize> {
        let namespaces = self.namespaces.lock().await;
        namespaces.get(namespace).and_then(|ns| ns.dimensions)
    }

    fn load_entry<'a>(
        &self,
        namespaces: &'a mut HashMap<String, Namespace>,
        namespace: &str,
    ) -> Result<&'a mut Namespace, VectorStoreError> {
        if !namespaces.contains_key(namespace) {
            let ns = match std::fs::read_to_string(self.file_path(namespace)) {
                Ok(content) => Namespace::from_file(serde_json::from_str(&content)?),
                Err(_) => Namespace::default(),
            };
            namespaces.insert(namespace.to_string(), ns);
        }
        Ok(namespaces.get_mut(namespace).expect("namespace just inserted"))
    }

    fn persist(&self, namespace: &str, ns: &Namespace) -> Result<(), VectorStoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_path(namespace);
        std::fs::write(path, serde_json::to_string(&ns.to_file())?)?;
        Ok(())
    }

    fn file_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_namespace(namespace)))
    }
}

fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Cosine similarity `dot(a,b) / (‖a‖·‖b‖)`, returning 0 when either
/// operand has zero norm. Vectors are expected but not required to be
/// unit norm; the store does not normalise.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
