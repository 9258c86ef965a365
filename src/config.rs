//! Server configuration and component factory
//!
//! `ServerConfig` is the validated form of the command-line arguments.
//! `ComponentFactory` turns it into object stores and a membership provider,
//! so the binary and the integration tests build nodes the same way.

use crate::cluster::{LocalMembership, MembershipProvider, ObjectStoreMembership, PartitionScheme};
use crate::store::{CloudRouting, PatternStore, StoreConfig};
use crate::{CloudProvider, Error, Result};

use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "unknown environment '{}'; expected development, staging or production",
                other
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of project ids, or every project
///
/// Parsed from `*` (all projects), an empty string (no projects) or a comma
/// separated list of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectSelection {
    All,
    Only(BTreeSet<u64>),
}

impl ProjectSelection {
    pub fn none() -> Self {
        Self::Only(BTreeSet::new())
    }

    pub fn contains(&self, project_id: u64) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(&project_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Only(ids) if ids.is_empty())
    }
}

impl Default for ProjectSelection {
    fn default() -> Self {
        Self::All
    }
}

impl FromStr for ProjectSelection {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let value = value.trim();
        if value == "*" {
            return Ok(Self::All);
        }

        let mut ids = BTreeSet::new();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let id = part
                .parse::<u64>()
                .map_err(|_| format!("invalid project id '{}'", part))?;
            ids.insert(id);
        }
        Ok(Self::Only(ids))
    }
}

impl fmt::Display for ProjectSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Only(ids) => {
                let ids: Vec<String> = ids.iter().map(u64::to_string).collect();
                f.write_str(&ids.join(","))
            }
        }
    }
}

/// Which coordination backend tracks cluster membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorKind {
    /// In-process coordinator; only peers in the same process are visible
    Memory,
    /// Registrations and the metadata version pointer live in the cloud bucket
    ObjectStore,
}

impl FromStr for CoordinatorKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "object-store" | "object_store" => Ok(Self::ObjectStore),
            other => Err(format!(
                "unknown coordinator '{}'; expected memory or object-store",
                other
            )),
        }
    }
}

/// Validated configuration of one pattern server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub environment: Environment,
    pub ip: String,
    pub rpc_port: u16,
    pub http_port: u16,
    pub coordinator: CoordinatorKind,
    pub coordinator_ttl: Duration,
    /// Root directory of the disk tier
    pub disk_dir: PathBuf,
    pub cloud_provider: CloudProvider,
    /// Primary bucket (or directory for the local provider)
    pub bucket: String,
    /// Secondary bucket holding models of selected projects
    pub models_bucket: Option<String>,
    pub models_bucket_projects: ProjectSelection,
    /// Projects this node loads metadata for
    pub project_ids: ProjectSelection,
    pub chunk_cache_size: u64,
    pub event_info_cache_size: u64,
    pub partition_scheme: PartitionScheme,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            ip: "127.0.0.1".to_string(),
            rpc_port: 8100,
            http_port: 8101,
            coordinator: CoordinatorKind::Memory,
            coordinator_ttl: Duration::from_secs(10),
            disk_dir: PathBuf::from("/tmp/patternserve"),
            cloud_provider: CloudProvider::Local,
            bucket: "/tmp/patternserve-cloud".to_string(),
            models_bucket: None,
            models_bucket_projects: ProjectSelection::none(),
            project_ids: ProjectSelection::All,
            chunk_cache_size: 5,
            event_info_cache_size: 10,
            partition_scheme: PartitionScheme::Project,
        }
    }
}

impl ServerConfig {
    /// Reject configurations a node cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.ip.trim().is_empty() {
            return Err(Error::Config("ip is required".to_string()));
        }
        if self.rpc_port == 0 {
            return Err(Error::Config("rpc port is required".to_string()));
        }
        if self.http_port == 0 {
            return Err(Error::Config("http port is required".to_string()));
        }
        if self.rpc_port == self.http_port {
            return Err(Error::Config(
                "rpc and http ports must differ".to_string(),
            ));
        }
        if self.disk_dir.as_os_str().is_empty() {
            return Err(Error::Config("disk directory is required".to_string()));
        }
        if self.bucket.trim().is_empty() {
            return Err(Error::Config("bucket is required".to_string()));
        }
        if !self.models_bucket_projects.is_empty() && self.models_bucket.is_none() {
            return Err(Error::Config(
                "models bucket projects given without a models bucket".to_string(),
            ));
        }
        if self.chunk_cache_size == 0 || self.event_info_cache_size == 0 {
            return Err(Error::Config(
                "cache sizes must be at least 1".to_string(),
            ));
        }
        if self.coordinator_ttl < Duration::from_secs(1) {
            return Err(Error::Config(
                "coordinator ttl must be at least one second".to_string(),
            ));
        }
        if self.coordinator == CoordinatorKind::ObjectStore && self.cloud_provider == CloudProvider::Local {
            return Err(Error::Config(
                "the object-store coordinator needs conditional writes, which the local provider lacks"
                    .to_string(),
            ));
        }
        if self.coordinator == CoordinatorKind::Memory && !self.environment.is_development() {
            return Err(Error::Config(format!(
                "the in-process coordinator cannot be used in {}",
                self.environment
            )));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            event_info_cache_size: self.event_info_cache_size,
            chunk_cache_size: self.chunk_cache_size,
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the cloud object store for a bucket
    ///
    /// Credentials come from the provider's usual environment variables
    /// (`AWS_*` for S3, `GOOGLE_*` for GCS). `S3_ENDPOINT` points S3 at a
    /// compatible service such as MinIO.
    pub fn create_object_store(
        provider: CloudProvider,
        bucket: &str,
    ) -> Result<Arc<dyn ObjectStore>> {
        match provider {
            CloudProvider::Memory => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            CloudProvider::Local => {
                info!(dir = %bucket, "Using local directory as cloud tier");
                Self::create_disk_store(Path::new(bucket))
            }
            CloudProvider::Aws => {
                info!(bucket = %bucket, "Using S3 object store");
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }
                Ok(Arc::new(builder.build()?))
            }
            CloudProvider::Gcp => {
                info!(bucket = %bucket, "Using GCS object store");
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Create the disk tier rooted at `dir`, creating the directory if needed
    pub fn create_disk_store(dir: &Path) -> Result<Arc<dyn ObjectStore>> {
        std::fs::create_dir_all(dir)?;
        Ok(Arc::new(LocalFileSystem::new_with_prefix(dir)?))
    }

    /// Cloud routing for the configured primary and secondary buckets
    pub fn create_cloud_routing(config: &ServerConfig) -> Result<CloudRouting> {
        let primary = Self::create_object_store(config.cloud_provider, &config.bucket)?;
        let routing = CloudRouting::new(primary);

        match &config.models_bucket {
            Some(bucket) => {
                let secondary = Self::create_object_store(config.cloud_provider, bucket)?;
                info!(
                    bucket = %bucket,
                    projects = %config.models_bucket_projects,
                    "Routing selected projects to models bucket"
                );
                Ok(routing.with_secondary(secondary, config.models_bucket_projects.clone()))
            }
            None => Ok(routing),
        }
    }

    /// Create the tiered pattern store of a node over `cloud`
    pub fn create_pattern_store(config: &ServerConfig, cloud: CloudRouting) -> Result<PatternStore> {
        let disk = Self::create_disk_store(&config.disk_dir)?;
        Ok(PatternStore::new(disk, cloud, config.store_config()))
    }

    /// Create the membership provider
    ///
    /// The object-store coordinator shares the primary bucket with the
    /// artifacts, under the `cluster/` prefix.
    pub fn create_membership(
        config: &ServerConfig,
        cloud: &CloudRouting,
    ) -> Result<Arc<dyn MembershipProvider>> {
        match config.coordinator {
            CoordinatorKind::Memory => {
                info!("Using in-process membership (development mode)");
                Ok(Arc::new(LocalMembership::new()))
            }
            CoordinatorKind::ObjectStore => {
                info!("Using object store membership");
                Ok(Arc::new(ObjectStoreMembership::new(
                    cloud.primary(),
                    "cluster",
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_selection_parsing() {
        assert_eq!("*".parse::<ProjectSelection>().unwrap(), ProjectSelection::All);
        assert!("".parse::<ProjectSelection>().unwrap().is_empty());

        let some: ProjectSelection = "3, 1,2".parse().unwrap();
        assert!(some.contains(1));
        assert!(some.contains(3));
        assert!(!some.contains(4));
        assert_eq!(some.to_string(), "1,2,3");

        assert!("1,x".parse::<ProjectSelection>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let config = ServerConfig {
            ip: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ServerConfig {
            bucket: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            models_bucket_projects: "7".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            environment: Environment::Production,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_object_store_coordinator_needs_conditional_writes() {
        let config = ServerConfig {
            coordinator: CoordinatorKind::ObjectStore,
            cloud_provider: CloudProvider::Local,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ServerConfig {
            coordinator: CoordinatorKind::ObjectStore,
            cloud_provider: CloudProvider::Memory,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_disk_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        ComponentFactory::create_disk_store(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
