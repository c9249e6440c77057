use super::{find_checksum, FetchContext, HttpClient, Source, SourceError};
use crate::{Arch, Category, Checksum, Platform, ProductDescriptor, VersionRecord};
use anyhow::{Context, Error};
use async_trait::async_trait;
use regex::Regex;
use tracing::*;

const RELEASES_URL: &str = "https://releases.ubuntu.com/";

/// Releases that are listed on the mirror but no longer worth tracking.
const SKIPPED_RELEASES: &[&str] = &[
    "14.04", "16.04", "18.04", "19.04", "19.10", "21.04", "21.10",
];

/// Scrapes the release index, then every release directory for its ISO images.
pub struct Ubuntu {
    descriptor: ProductDescriptor,
    http: HttpClient,
    release_re: Regex,
    iso_re: Regex,
}

impl Ubuntu {
    pub fn new(http: HttpClient) -> Result<Self, Error> {
        Ok(Ubuntu {
            descriptor: ProductDescriptor {
                id: "ubuntu",
                name: "Ubuntu",
                vendor: "Canonical",
                category: Category::Os,
                description: "Debian-based Linux distribution for desktops and servers",
                icon_url: "",
                website_url: "https://ubuntu.com/",
            },
            http,
            release_re: Regex::new(r#"href="([0-9]+\.[0-9]+(?:\.[0-9]+)?)/?""#)
                .context("invalid release pattern")?,
            iso_re: Regex::new(r#"href="(ubuntu-[^"]*\.iso)""#).context("invalid ISO pattern")?,
        })
    }

    fn releases(&self, index: &str) -> Vec<String> {
        let mut releases: Vec<String> = Vec::new();
        for captures in self.release_re.captures_iter(index) {
            let release = &captures[1];
            if SKIPPED_RELEASES.contains(&release) || releases.iter().any(|r| r == release) {
                continue;
            }
            releases.push(release.to_owned());
        }
        releases
    }

    /// One image per architecture, desktop images preferred over server images.
    fn images(&self, listing: &str) -> Vec<(Arch, String)> {
        let mut images: Vec<(Arch, String)> = Vec::new();
        for captures in self.iso_re.captures_iter(listing) {
            let filename = &captures[1];
            let arch = image_arch(filename);
            match images.iter_mut().find(|(a, _)| *a == arch) {
                Some(existing) => {
                    if !existing.1.contains("desktop") && filename.contains("desktop") {
                        existing.1 = filename.to_owned();
                    }
                }
                None => images.push((arch, filename.to_owned())),
            }
        }
        images
    }

    async fn release(
        &self,
        cx: &FetchContext,
        release: &str,
    ) -> Result<Vec<VersionRecord>, SourceError> {
        let base = format!("{RELEASES_URL}{release}/");
        let listing = self.http.get_text(cx, &base).await?;
        let images = self.images(&listing);
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let sums = match self.http.get_text(cx, &format!("{base}SHA256SUMS")).await {
            Ok(sums) => sums,
            Err(SourceError::Cancelled) => return Err(SourceError::Cancelled),
            Err(err) => {
                debug!(message = "No checksums for release", release, error = %err);
                String::new()
            }
        };

        let mut records = Vec::with_capacity(images.len());
        for (arch, filename) in images {
            let url = format!("{base}{filename}");
            records.push(VersionRecord {
                version: release.to_owned(),
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

fn image_arch(filename: &str) -> Arch {
    if filename.contains("i386") {
        Arch::X86
    } else if filename.contains("arm64") {
        Arch::Arm64
    } else {
        Arch::Amd64
    }
}

#[async_trait]
impl Source for Ubuntu {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        let index = self.http.get_text(cx, RELEASES_URL).await?;

        let mut records = Vec::new();
        for release in self.releases(&index) {
            cx.check()?;
            match self.release(cx, &release).await {
                Ok(mut found) => records.append(&mut found),
                Err(SourceError::Cancelled) => return Err(SourceError::Cancelled),
                Err(err) => {
                    warn!(message = "Skipping release", release = %release, error = %err);
                }
            }
        }

        if records.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(records)
    }
}
