use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod db;
pub mod enqueue;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod sources;
pub mod store;
pub mod telemetry;
pub mod worker;

/// Static description of a catalog product, owned by its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub vendor: &'static str,
    pub category: Category,
    pub description: &'static str,
    pub icon_url: &'static str,
    pub website_url: &'static str,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub category: String,
    pub description: String,
    pub icon_url: String,
    pub website_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn from_descriptor(descriptor: &ProductDescriptor, now: DateTime<Utc>) -> Self {
        Product {
            id: descriptor.id.to_owned(),
            name: descriptor.name.to_owned(),
            vendor: descriptor.vendor.to_owned(),
            category: descriptor.category.as_str().to_owned(),
            description: descriptor.description.to_owned(),
            icon_url: descriptor.icon_url.to_owned(),
            website_url: descriptor.website_url.to_owned(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One downloadable artifact as produced by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: String,
    pub platform: Platform,
    pub arch: Arch,
    pub download_url: String,
    pub checksum: Option<Checksum>,
    pub file_size: i64,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub value: String,
    pub algorithm: String,
}

impl Checksum {
    pub fn sha256(value: impl Into<String>) -> Self {
        Checksum {
            value: value.into(),
            algorithm: "sha256".into(),
        }
    }
}

/// A persisted version row. Unique on `(product_id, version, platform, architecture)`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProductVersion {
    pub id: Uuid,
    pub product_id: String,
    pub version: String,
    pub platform: String,
    pub architecture: String,
    pub download_url: String,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub file_size: i64,
    pub filename: String,
    pub is_latest: bool,
    pub etag: Option<String>,
    pub last_fetched: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductVersion {
    /// Builds a fresh row for `record`. `is_latest` always starts false;
    /// only promotion sets it.
    pub fn from_record(product_id: &str, record: VersionRecord, now: DateTime<Utc>) -> Self {
        let (checksum, checksum_type) = match record.checksum {
            Some(c) => (Some(c.value), Some(c.algorithm)),
            None => (None, None),
        };
        ProductVersion {
            id: Uuid::new_v4(),
            product_id: product_id.to_owned(),
            version: record.version,
            platform: record.platform.as_str().to_owned(),
            architecture: record.arch.as_str().to_owned(),
            download_url: record.download_url,
            checksum,
            checksum_type,
            file_size: record.file_size,
            filename: record.filename,
            is_latest: false,
            etag: None,
            last_fetched: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn group(&self) -> (&str, &str) {
        (&self.platform, &self.architecture)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FetchJob {
    pub id: Uuid,
    pub product_id: String,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "fetch_job_status", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Os,
    App,
    Tool,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Os => "os",
            Category::App => "app",
            Category::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    Windows,
    Linux,
    Macos,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    X86,
    Arm,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::X86 => "386",
            Arch::Arm => "arm",
        }
    }
}
