use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use tokio::sync::{
	Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

use relay_domain::segmentation::EpisodeKey;

const PRUNE_THRESHOLD: usize = 1_024;

/// Write serialization for segmentation. Incremental writes hold the definition lock shared and
/// their key lock exclusively; a full re-scan holds the definition lock exclusively.
#[derive(Default)]
pub(crate) struct KeyLocks {
	definitions: Mutex<HashMap<String, Arc<RwLock<()>>>>,
	keys: Mutex<HashMap<(String, EpisodeKey), Arc<AsyncMutex<()>>>>,
}
impl KeyLocks {
	pub(crate) async fn definition_shared(&self, definition_name: &str) -> OwnedRwLockReadGuard<()> {
		self.definition_lock(definition_name).read_owned().await
	}

	pub(crate) async fn definition_exclusive(
		&self,
		definition_name: &str,
	) -> OwnedRwLockWriteGuard<()> {
		self.definition_lock(definition_name).write_owned().await
	}

	pub(crate) async fn key(&self, definition_name: &str, key: &EpisodeKey) -> OwnedMutexGuard<()> {
		let lock = {
			let mut keys = self.keys.lock().unwrap_or_else(|err| err.into_inner());

			if keys.len() > PRUNE_THRESHOLD {
				keys.retain(|_, lock| Arc::strong_count(lock) > 1);
			}

			keys.entry((definition_name.to_string(), key.clone())).or_default().clone()
		};

		lock.lock_owned().await
	}

	fn definition_lock(&self, definition_name: &str) -> Arc<RwLock<()>> {
		let mut definitions = self.definitions.lock().unwrap_or_else(|err| err.into_inner());

		definitions.entry(definition_name.to_string()).or_default().clone()
	}
}
