//! An JSON file-backed implementation of the [`Backend`][super::Backend] trait.
//!
//! Wraps a [`InMemoryBackend`][super::memory::InMemoryBackend] instance, persisting
//! updates to a JSON file on disk that can be reloaded across restarts.
use crate::backend::memory::InMemoryBackend;
use crate::backend::{Backend, DynamicRecord, LookupOptions, Services, Writable};
use crate::error::Error;
use crate::request::RequestState;
use crate::zones::Zones;
use std::io::ErrorKind;
use tokio::fs::File;
use tokio::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use trust_dns_server::client::rr::LowerName;

/// An file-backed service backend. After each update a JSON file-on disk is updated with the
/// new data. This file can be reloaded across restarts to avoid losing state.
///
/// Wraps a [`InMemoryBackend`][super::memory::InMemoryBackend], operating the same way except
/// for maintaining state beyond in-memory.
#[derive(Default, Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct FileBackend {
    backend: InMemoryBackend,
    path: String,
}

impl FileBackend {
    /// Save the state of the backend as JSON to the configured path, or return an Error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] if a service can't be serialized to JSON.
    ///
    /// Returns [`Error::IO`] if the serialized state can't be written to the backing file path.
    pub async fn save(&self) -> Result<(), Error> {
        let data = serde_json::to_string_pretty(&self.backend)?;
        let mut output_file = File::create(&self.path).await?;
        output_file.write_all(data.as_bytes()).await?;
        output_file.flush().await?;
        Ok(())
    }

    /// Load a [`FileBackend`] serving `zones` from the JSON state located at the given path, or
    /// return an Error. A missing file is created holding the state of `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] if the JSON state file is invalid.
    ///
    /// Returns [`Error::IO`] if the path can't be opened or read.
    pub async fn try_from_file(p: &str, zones: Zones, seed: &InMemoryBackend) -> Result<Self, Error> {
        let contents = match File::open(p).await {
            Ok(mut f) => {
                let mut buf = vec![];
                f.read_to_end(&mut buf).await?;
                buf
            }
            Err(err) => match err.kind() {
                ErrorKind::NotFound => Self::write_state(File::create(&p).await?, seed).await?,
                _ => return Err(Error::IO(err)),
            },
        };

        let mut backend: InMemoryBackend = serde_json::from_slice(&contents)?;
        backend.set_zones(zones);
        Ok(Self {
            path: p.to_string(),
            backend,
        })
    }

    async fn write_state(mut f: File, state: &InMemoryBackend) -> io::Result<Vec<u8>> {
        let data = serde_json::to_string_pretty(state)?;
        let bytes = data.as_bytes();
        f.write_all(bytes).await?;
        f.flush().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait::async_trait]
impl Backend for FileBackend {
    async fn services(
        &self,
        state: &RequestState,
        exact: bool,
        opt: &LookupOptions,
    ) -> Result<Services, Error> {
        self.backend.services(state, exact, opt).await
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_writable_mut(&mut self) -> Option<&mut dyn Writable> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Writable for FileBackend {
    fn zones(&self) -> &Zones {
        self.backend.zones()
    }

    async fn create(&mut self, record: DynamicRecord) -> Result<(), Error> {
        self.backend.create(record).await?;
        self.save().await
    }

    async fn upsert(&mut self, record: DynamicRecord) -> Result<(), Error> {
        self.backend.upsert(record).await?;
        self.save().await
    }

    async fn delete(&mut self, record: &DynamicRecord) -> Result<(), Error> {
        self.backend.delete(record).await?;
        self.save().await
    }

    async fn update(&mut self, record: DynamicRecord) -> Result<(), Error> {
        self.backend.update(record).await?;
        self.save().await
    }

    fn exists(&self, record: &DynamicRecord) -> bool {
        self.backend.exists(record)
    }

    fn exists_by_name(&self, zone: &LowerName, name: &LowerName) -> bool {
        self.backend.exists_by_name(zone, name)
    }
}
