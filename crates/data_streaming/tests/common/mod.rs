use anyhow::Result;
use data_streaming::{MemoryShardStore, SavableStream, ShardEntry, Source, Utf8Materializer};
use std::sync::Arc;

/// Builds a text source whose record at position `i` of `shard` is keyed
/// `{shard}/{i:05}` and carries a "txt" part `{name}:{shard}:{i}` plus a
/// "meta" part `meta:{i}`. Sources built with the same shard layout share
/// record keys position by position, which is what inner matching expects.
pub fn build_source(name: &str, shards: &[(&str, u64)]) -> Source {
    let mut store = MemoryShardStore::new();
    for (shard, count) in shards {
        store.insert(
            *shard,
            (0..*count)
                .map(|i| {
                    ShardEntry::new(format!("{shard}/{i:05}"))
                        .with_part("txt", format!("{name}:{shard}:{i}").into_bytes())
                        .with_part("meta", format!("meta:{i}").into_bytes())
                })
                .collect(),
        );
    }
    Source::new(name, store.shard_infos(), Arc::new(store))
        .with_materializer(Arc::new(Utf8Materializer))
}

/// Drains one worker slot to the end, failing on the first propagated error.
pub fn collect_worker<S: SavableStream>(stream: &mut S, worker: usize) -> Result<Vec<S::Item>> {
    stream.iter_worker(worker).collect()
}
