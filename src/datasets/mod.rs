/// Per-session durable list of dataset ids and load status.
pub mod cache;
/// Placeholder byte source for datasets fetched in `API`/`HYBRID` mode.
pub mod fetcher;
/// Places dataset bytes where the sandbox expects to find them.
pub mod staging;

pub use cache::{DatasetEntry, DatasetStatus};
pub use staging::{load_pending_datasets, stage_dataset_into_sandbox, DatasetFetcher, StagedDataset};
