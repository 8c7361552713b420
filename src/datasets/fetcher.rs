//! Placeholder dataset fetcher (C7 support). Ported from
//! `dataset_manager/fetcher.py`'s stand-in implementation; swap with a real
//! downloader when one exists.

/// Fetch a dataset's bytes by id. Always succeeds with placeholder content;
/// a real deployment would replace this with a network or blob-store call.
pub async fn fetch_dataset(ds_id: &str) -> anyhow::Result<Vec<u8>> {
    Ok(format!("PARQUET_BYTES_FOR::{ds_id}").into_bytes())
}
