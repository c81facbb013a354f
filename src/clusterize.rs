use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use futures::{StreamExt, stream};
use tracing::{info, warn};

use crate::engines::Executor;

/// Cluster many seed addresses, at most `parallelism` at a time.
///
/// Seeds already covered by an earlier cluster are skipped. Each cluster is
/// identified by its lexicographically smallest member. Seeds whose cluster
/// job fails are logged and left out.
pub async fn clusterize(executor: &Executor, seeds: &[String], parallelism: usize) -> BTreeMap<String, Vec<String>> {
    let assigned: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
    let mut unique: Vec<&String> = seeds.iter().collect();
    unique.sort();
    unique.dedup();

    stream::iter(unique)
        .map(|seed| {
            let assigned = &assigned;
            async move {
                if assigned.lock().unwrap_or_else(|e| e.into_inner()).contains_key(seed) {
                    return;
                }
                let cluster = match executor.cluster(seed).await {
                    Ok(cluster) => cluster,
                    Err(e) => {
                        warn!("Skipping {seed}: {e}");
                        return;
                    }
                };
                let Some(id) = cluster.addresses.iter().map(|a| a.address.as_str()).min() else {
                    return;
                };
                let mut assigned = assigned.lock().unwrap_or_else(|e| e.into_inner());
                for member in &cluster.addresses {
                    let slot = assigned.entry(member.address.clone()).or_insert_with(|| id.to_string());
                    if id < slot.as_str() {
                        *slot = id.to_string();
                    }
                }
                info!(
                    "Clusters: {}, addresses processed: {}",
                    count_clusters(&assigned),
                    assigned.len()
                );
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect::<Vec<()>>()
        .await;

    let assigned = assigned.into_inner().unwrap_or_else(|e| e.into_inner());
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (address, id) in assigned {
        grouped.entry(id).or_default().push(address);
    }
    for members in grouped.values_mut() {
        members.sort();
    }
    grouped
}

fn count_clusters(assigned: &HashMap<String, String>) -> usize {
    let mut ids: Vec<&String> = assigned.values().collect();
    ids.sort();
    ids.dedup();
    ids.len()
}
