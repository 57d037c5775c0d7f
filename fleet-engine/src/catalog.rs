use fleet_common::{FleetError, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

pub type PayloadLoader = Arc<dyn Fn() -> std::io::Result<Vec<u8>> + Send + Sync>;

/// Where a resource's bytes come from.
#[derive(Clone)]
pub enum ResourceSource {
    File(PathBuf),
    /// Payload bundled with the controller; assumed immutable for the process lifetime.
    Embedded { name: String, loader: PayloadLoader },
}

impl ResourceSource {
    pub fn embedded_bytes(name: impl Into<String>, bytes: &'static [u8]) -> Self {
        ResourceSource::Embedded {
            name: name.into(),
            loader: Arc::new(move || Ok(bytes.to_vec())),
        }
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            ResourceSource::File(path) => tokio::fs::read(path).await,
            ResourceSource::Embedded { loader, .. } => loader(),
        }
    }

    fn is_immutable(&self) -> bool {
        matches!(self, ResourceSource::Embedded { .. })
    }
}

impl fmt::Debug for ResourceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceSource::File(path) => f.debug_tuple("File").field(path).finish(),
            ResourceSource::Embedded { name, .. } => {
                f.debug_struct("Embedded").field("name", name).finish()
            }
        }
    }
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Upload location of a resource body.
pub fn remote_path(resource_dir: &str, name: &str) -> String {
    format!("{}/{}", resource_dir, name)
}

/// Checksum cache file: plain decimal CRC32 text.
pub fn checksum_path(resource_dir: &str, name: &str) -> String {
    format!("{}/.crc/{}.crc", resource_dir, name)
}

pub fn checksum_dir(resource_dir: &str) -> String {
    format!("{}/.crc", resource_dir)
}

/// A named artifact plus its per-host synchronization flags.
///
/// `deployed` implies `uploaded`: a checksum change clears both.
#[derive(Debug, Clone)]
pub struct ManagedResource {
    name: String,
    deploy_dir: String,
    unzip_on_deploy: bool,
    required: bool,
    source: ResourceSource,
    embedded_checksum: Arc<OnceLock<u32>>,
    uploaded_checksum: Option<u32>,
    deployed: bool,
}

impl ManagedResource {
    pub fn new(name: impl Into<String>, source: ResourceSource, deploy_dir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deploy_dir: deploy_dir.into().trim_end_matches('/').to_string(),
            unzip_on_deploy: false,
            required: true,
            source,
            embedded_checksum: Arc::new(OnceLock::new()),
            uploaded_checksum: None,
            deployed: false,
        }
    }

    pub fn unzip(mut self, unzip: bool) -> Self {
        self.unzip_on_deploy = unzip;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deploy_dir(&self) -> &str {
        &self.deploy_dir
    }

    pub fn unzip_on_deploy(&self) -> bool {
        self.unzip_on_deploy
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn source(&self) -> &ResourceSource {
        &self.source
    }

    pub fn uploaded(&self) -> bool {
        self.uploaded_checksum.is_some()
    }

    pub fn uploaded_checksum(&self) -> Option<u32> {
        self.uploaded_checksum
    }

    pub fn deployed(&self) -> bool {
        self.deployed
    }

    /// Reads the body and returns it with its CRC32.
    ///
    /// Embedded payloads hash once; files hash on every call so local edits are seen.
    pub async fn load(&self) -> Result<(Vec<u8>, u32)> {
        let bytes = self
            .source
            .read()
            .await
            .map_err(|e| FleetError::resource(&self.name, format!("read failed: {}", e)))?;
        let crc = if self.source.is_immutable() {
            *self.embedded_checksum.get_or_init(|| checksum(&bytes))
        } else {
            checksum(&bytes)
        };
        Ok((bytes, crc))
    }

    /// Whether the last upload still matches `local_checksum`.
    pub fn is_current(&self, local_checksum: u32) -> bool {
        self.uploaded_checksum == Some(local_checksum)
    }

    pub(crate) fn mark_uploaded(&mut self, crc: u32) {
        if self.uploaded_checksum != Some(crc) {
            self.deployed = false;
        }
        self.uploaded_checksum = Some(crc);
    }

    pub(crate) fn mark_deployed(&mut self) {
        if self.uploaded() {
            self.deployed = true;
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.uploaded_checksum = None;
        self.deployed = false;
    }
}

/// Versioned set of local artifacts to put on a host.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    resources: Vec<ManagedResource>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resource: ManagedResource) -> Result<()> {
        if resource.name.is_empty() || resource.name.contains('/') {
            return Err(FleetError::config(format!(
                "invalid resource name '{}'",
                resource.name
            )));
        }
        if self.resources.iter().any(|r| r.name == resource.name) {
            return Err(FleetError::config(format!(
                "duplicate resource '{}'",
                resource.name
            )));
        }
        self.resources.push(resource);
        Ok(())
    }

    pub fn with_file(
        mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        deploy_dir: impl Into<String>,
        unzip: bool,
    ) -> Result<Self> {
        self.add(ManagedResource::new(name, ResourceSource::File(path.into()), deploy_dir).unzip(unzip))?;
        Ok(self)
    }

    pub fn with_embedded(
        mut self,
        name: impl Into<String>,
        bytes: &'static [u8],
        deploy_dir: impl Into<String>,
        unzip: bool,
    ) -> Result<Self> {
        let name = name.into();
        let source = ResourceSource::embedded_bytes(name.clone(), bytes);
        self.add(ManagedResource::new(name, source, deploy_dir).unzip(unzip))?;
        Ok(self)
    }

    pub fn resources(&self) -> &[ManagedResource] {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut [ManagedResource] {
        &mut self.resources
    }

    pub fn get(&self, name: &str) -> Option<&ManagedResource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// A copy with all upload/deploy flags cleared, for a new host.
    pub fn fresh(&self) -> Self {
        let mut copy = self.clone();
        for r in copy.resources.iter_mut() {
            r.invalidate();
        }
        copy
    }

    pub fn names(&self) -> HashSet<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn all_deployed(&self) -> bool {
        self.resources.iter().all(|r| r.deployed)
    }
}
