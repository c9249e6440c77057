use super::{find_checksum, FetchContext, HttpClient, Source, SourceError};
use crate::{Arch, Category, Checksum, Platform, ProductDescriptor, VersionRecord};
use anyhow::{Context, Error};
use async_trait::async_trait;
use regex::Regex;
use tracing::*;

const ISO_INDEX_URL: &str = "https://cdimage.debian.org/debian-cd/current/amd64/iso-cd/";

pub struct Debian {
    descriptor: ProductDescriptor,
    http: HttpClient,
    iso_re: Regex,
    version_re: Regex,
}

impl Debian {
    pub fn new(http: HttpClient) -> Result<Self, Error> {
        Ok(Debian {
            descriptor: ProductDescriptor {
                id: "debian",
                name: "Debian",
                vendor: "Debian Project",
                category: Category::Os,
                description: "The universal operating system",
                icon_url: "",
                website_url: "https://www.debian.org/",
            },
            http,
            iso_re: Regex::new(r#"href="(debian-[^"]*\.iso)""#).context("invalid ISO pattern")?,
            version_re: Regex::new(r"debian-([0-9]+\.[0-9]+(?:\.[0-9]+)?)")
                .context("invalid version pattern")?,
        })
    }

    /// `(version, arch, filename)` for each image, first listed wins per version and arch.
    fn images(&self, listing: &str) -> Vec<(String, Arch, String)> {
        let mut images: Vec<(String, Arch, String)> = Vec::new();
        for captures in self.iso_re.captures_iter(listing) {
            let filename = &captures[1];
            let Some(version) = self.version_re.captures(filename) else {
                continue;
            };
            let version = &version[1];
            let arch = if filename.contains("i386") {
                Arch::X86
            } else {
                Arch::Amd64
            };
            if images.iter().any(|(v, a, _)| v == version && *a == arch) {
                continue;
            }
            images.push((version.to_owned(), arch, filename.to_owned()));
        }
        images
    }
}

#[async_trait]
impl Source for Debian {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        let listing = self.http.get_text(cx, ISO_INDEX_URL).await?;
        let images = self.images(&listing);
        if images.is_empty() {
            return Err(SourceError::Empty);
        }

        let sums_url = format!("{ISO_INDEX_URL}SHA256SUMS");
        let sums = match self.http.get_text(cx, &sums_url).await {
            Ok(sums) => sums,
            Err(SourceError::Cancelled) => return Err(SourceError::Cancelled),
            Err(err) => {
                debug!(message = "No checksums published", error = %err);
                String::new()
            }
        };

        let mut records = Vec::with_capacity(images.len());
        for (version, arch, filename) in images {
            cx.check()?;
            let url = format!("{ISO_INDEX_URL}{filename}");
            records.push(VersionRecord {
                version,
                platform: Platform::Linux,
                arch,
                file_size: self.http.content_length(cx, &url).await,
                checksum: find_checksum(&sums, &filename).map(Checksum::sha256),
                download_url: url,
                filename,
            });
        }
        Ok(records)
    }
}
