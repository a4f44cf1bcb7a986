use crate::currency::CurrencyFamily;
use crate::storage::{ChainSnapshot, StateKey, StorageError};

use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Repository for per-wallet chain state persistence
#[async_trait::async_trait]
pub trait ChainStateRepository: Send + Sync {
	async fn save(&self, key: &StateKey, snapshot: &ChainSnapshot) -> Result<(), StorageError>;
	async fn load(&self, key: &StateKey) -> Result<Option<ChainSnapshot>, StorageError>;
	async fn delete(&self, key: &StateKey) -> Result<(), StorageError>;
	async fn clear_family(&self, family: CurrencyFamily) -> Result<(), StorageError>;
}

/// File-based implementation of ChainStateRepository
///
/// Layout: `<data_dir>/<family>/<network>/wallet_state_<wallet_id>.bin` plus a `.meta.json`
/// sidecar holding the synced height and save time.
pub struct FileChainStateRepository {
	data_dir: PathBuf,
}

impl FileChainStateRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}

	fn family_dir(&self, family: CurrencyFamily) -> PathBuf {
		self.data_dir.join(family.as_str())
	}

	fn wallet_dir(&self, key: &StateKey) -> PathBuf {
		self.family_dir(key.family).join(key.network.as_str())
	}

	fn get_state_filename(&self, key: &StateKey) -> PathBuf {
		self.wallet_dir(key)
			.join(format!("wallet_state_{}.bin", key.wallet_id))
	}

	fn get_metadata_filename(&self, key: &StateKey) -> PathBuf {
		self.wallet_dir(key)
			.join(format!("wallet_state_{}.meta.json", key.wallet_id))
	}
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
	match tokio::fs::remove_file(path).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}

#[async_trait::async_trait]
impl ChainStateRepository for FileChainStateRepository {
	async fn save(&self, key: &StateKey, snapshot: &ChainSnapshot) -> Result<(), StorageError> {
		tokio::fs::create_dir_all(self.wallet_dir(key)).await?;

		let metadata = serde_json::json!({
			"sync_height": snapshot.height,
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});
		let metadata = serde_json::to_string_pretty(&metadata)
			.map_err(|e| StorageError::Encode(format!("Failed to encode metadata: {}", e)))?;
		tokio::fs::write(self.get_metadata_filename(key), metadata).await?;

		let state_bytes = bincode::serialize(snapshot)
			.map_err(|e| StorageError::Encode(format!("Failed to serialize chain state: {}", e)))?;

		// Replace atomically: write a temp file, then rename over the old one.
		let filename = self.get_state_filename(key);
		let tmp = filename.with_extension("bin.tmp");
		tokio::fs::write(&tmp, &state_bytes).await?;
		tokio::fs::rename(&tmp, &filename).await?;

		debug!(
			"Saved chain state to {:?} at height {}",
			filename, snapshot.height
		);
		Ok(())
	}

	async fn load(&self, key: &StateKey) -> Result<Option<ChainSnapshot>, StorageError> {
		let filename = self.get_state_filename(key);

		let state_bytes = match tokio::fs::read(&filename).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};

		let snapshot: ChainSnapshot = bincode::deserialize(&state_bytes).map_err(|e| {
			StorageError::Decode(format!("Failed to deserialize chain state: {}", e))
		})?;

		info!(
			"Loaded chain state from {:?} at height {}",
			filename, snapshot.height
		);
		Ok(Some(snapshot))
	}

	async fn delete(&self, key: &StateKey) -> Result<(), StorageError> {
		remove_if_exists(&self.get_state_filename(key)).await?;
		remove_if_exists(&self.get_metadata_filename(key)).await?;
		info!("Removed chain state for {} wallet", key.family);
		Ok(())
	}

	async fn clear_family(&self, family: CurrencyFamily) -> Result<(), StorageError> {
		let dir = self.family_dir(family);
		match tokio::fs::remove_dir_all(&dir).await {
			Ok(()) => {
				info!("Cleared all {} chain state in {:?}", family, dir);
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::currency::NetworkKind;
	use crate::engine::UnspentOutput;

	fn key(family: CurrencyFamily, wallet_id: &str) -> StateKey {
		StateKey {
			family,
			network: NetworkKind::TestNet,
			wallet_id: wallet_id.to_string(),
		}
	}

	fn snapshot(height: u64, value: u64) -> ChainSnapshot {
		ChainSnapshot {
			height,
			utxos: vec![UnspentOutput {
				txid: "aa".repeat(32),
				vout: 0,
				value,
			}],
			records: Vec::new(),
		}
	}

	#[tokio::test]
	async fn save_then_load_restores_snapshot() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileChainStateRepository::new(dir.path().to_path_buf());
		let key = key(CurrencyFamily::Bitcoin, "w1");

		assert!(repo.load(&key).await.unwrap().is_none());

		repo.save(&key, &snapshot(42, 1_000)).await.unwrap();
		let loaded = repo.load(&key).await.unwrap().unwrap();
		assert_eq!(loaded.height, 42);
		assert_eq!(loaded.balance(), 1_000);

		let meta = std::fs::read_to_string(repo.get_metadata_filename(&key)).unwrap();
		let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
		assert_eq!(meta["sync_height"], 42);
	}

	#[tokio::test]
	async fn clear_family_leaves_other_families() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileChainStateRepository::new(dir.path().to_path_buf());
		let btc_a = key(CurrencyFamily::Bitcoin, "a");
		let btc_b = key(CurrencyFamily::Bitcoin, "b");
		let dust = key(CurrencyFamily::Midnight, "a");

		for k in [&btc_a, &btc_b, &dust] {
			repo.save(k, &snapshot(1, 5)).await.unwrap();
		}

		repo.clear_family(CurrencyFamily::Bitcoin).await.unwrap();
		assert!(repo.load(&btc_a).await.unwrap().is_none());
		assert!(repo.load(&btc_b).await.unwrap().is_none());
		assert!(repo.load(&dust).await.unwrap().is_some());

		// Clearing twice is fine.
		repo.clear_family(CurrencyFamily::Bitcoin).await.unwrap();
	}

	#[tokio::test]
	async fn delete_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileChainStateRepository::new(dir.path().to_path_buf());
		let key = key(CurrencyFamily::Midnight, "w");
		repo.delete(&key).await.unwrap();
		repo.save(&key, &snapshot(3, 9)).await.unwrap();
		repo.delete(&key).await.unwrap();
		assert!(repo.load(&key).await.unwrap().is_none());
	}
}
