//! Small persister for serde-serializable state, mirroring
//! `garage_util::persister::Persister`: load/save a single named JSON file
//! under the node's data directory. Used to persist the cluster roster's
//! derived peer list and any other small piece of runtime state across
//! restarts.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

pub struct Persister<T> {
	path: PathBuf,
	_marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Persister<T> {
	pub fn new(base_dir: &Path, name: &str) -> Self {
		Self {
			path: base_dir.join(name),
			_marker: PhantomData,
		}
	}

	pub fn load(&self) -> Result<T, Error> {
		let data = std::fs::read(&self.path)
			.map_err(|e| Error::Message(format!("cannot read {}: {}", self.path.display(), e)))?;
		serde_json::from_slice(&data)
			.map_err(|e| Error::Message(format!("cannot parse {}: {}", self.path.display(), e)))
	}

	pub async fn load_async(&self) -> Result<T, Error> {
		let data = tokio::fs::read(&self.path)
			.await
			.map_err(|e| Error::Message(format!("cannot read {}: {}", self.path.display(), e)))?;
		serde_json::from_slice(&data)
			.map_err(|e| Error::Message(format!("cannot parse {}: {}", self.path.display(), e)))
	}

	pub fn save(&self, value: &T) -> Result<(), Error> {
		let data = serde_json::to_vec_pretty(value)
			.map_err(|e| Error::Message(format!("cannot serialize: {}", e)))?;
		std::fs::write(&self.path, data)
			.map_err(|e| Error::Message(format!("cannot write {}: {}", self.path.display(), e)))
	}

	pub async fn save_async(&self, value: &T) -> Result<(), Error> {
		let data = serde_json::to_vec_pretty(value)
			.map_err(|e| Error::Message(format!("cannot serialize: {}", e)))?;
		tokio::fs::write(&self.path, data)
			.await
			.map_err(|e| Error::Message(format!("cannot write {}: {}", self.path.display(), e)))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use serde::Deserialize;

	#[derive(Serialize, Deserialize, PartialEq, Debug)]
	struct Sample {
		x: u32,
	}

	#[test]
	fn round_trips() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let p: Persister<Sample> = Persister::new(&dir, "sample.json");
		assert!(p.load().is_err());
		p.save(&Sample { x: 42 }).unwrap();
		assert_eq!(p.load().unwrap(), Sample { x: 42 });
	}
}
