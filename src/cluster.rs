//! Near-duplicate clustering.
//!
//! Articles with a stored vector (for the configured model) and an id
//! greater than the floor are compared pairwise; every pair closer than the
//! threshold (cosine distance) is merged into the same set with a
//! disjoint-set forest. Chains A~B, B~C therefore always end up in one set
//! even when A and C are far apart. Only sets with two or more members are
//! emitted, each sorted ascending; storage is never modified.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_distance};

/// Disjoint-set forest over dense indices.
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DuplicateSet(pub Vec<i64>);

/// Group `(id, vector)` pairs whose cosine distance is below `threshold`.
pub fn cluster(items: &[(i64, Vec<f32>)], threshold: f64) -> Vec<DuplicateSet> {
    let mut sorted: Vec<&(i64, Vec<f32>)> = items.iter().collect();
    sorted.sort_by_key(|(id, _)| *id);

    let mut sets = DisjointSet::new(sorted.len());
    let mut matched = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        for j in (i + 1)..sorted.len() {
            if cosine_distance(&sorted[i].1, &sorted[j].1) < threshold {
                sets.union(i, j);
                matched[i] = true;
                matched[j] = true;
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
    for (i, item) in sorted.iter().enumerate() {
        if matched[i] {
            groups.entry(sets.find(i)).or_default().push(item.0);
        }
    }

    let mut result: Vec<DuplicateSet> = groups
        .into_values()
        .map(|mut ids| {
            ids.sort_unstable();
            DuplicateSet(ids)
        })
        .collect();
    result.sort_by_key(|set| set.0.first().copied());
    result
}

/// Load vectors for `model` with id greater than `min_id`.
pub async fn load_vectors(
    pool: &SqlitePool,
    model: &str,
    min_id: i64,
) -> Result<Vec<(i64, Vec<f32>)>> {
    let rows = sqlx::query(
        r#"
        SELECT article_id, dims, embedding
        FROM article_embeddings
        WHERE model = ? AND article_id > ?
        ORDER BY article_id
        "#,
    )
    .bind(model)
    .bind(min_id)
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: i64 = row.get("article_id");
        let dims: i64 = row.get("dims");
        let blob: Vec<u8> = row.get("embedding");
        let vector = blob_to_vec(&blob);
        if vector.is_empty() || vector.len() as i64 != dims {
            warn!(article_id = id, dims, len = vector.len(), "skipping malformed vector");
            continue;
        }
        items.push((id, vector));
    }
    Ok(items)
}

/// `newsroom cluster`: print the duplicate sets as a JSON array.
pub async fn run_cluster(
    config: &Config,
    threshold: Option<f64>,
    min_id: Option<i64>,
) -> Result<()> {
    let threshold = threshold.unwrap_or(config.cluster.threshold);
    let min_id = min_id.unwrap_or(config.cluster.min_id);
    let model = config.embedding.model_label();

    let pool = db::connect(config).await?;
    let items = load_vectors(&pool, &model, min_id).await?;
    let sets = cluster(&items, threshold);
    info!(
        articles = items.len(),
        sets = sets.len(),
        threshold,
        min_id,
        "duplicate clustering finished"
    );

    println!("{}", serde_json::to_string(&sets)?);
    pool.close().await;
    Ok(())
}
