use super::http::header_length;
use super::{extract_filename, FetchContext, HttpClient, Source, SourceError};
use crate::{Arch, Category, Platform, ProductDescriptor, VersionRecord};
use anyhow::{Context, Error};
use async_trait::async_trait;
use regex::Regex;
use tracing::*;

/// Tried in order. The release page itself only links torrents.
const MIRRORS: &[&str] = &[
    "https://mirror.rackspace.com/archlinux/iso/latest/archlinux-x86_64.iso",
    "https://mirrors.kernel.org/archlinux/iso/latest/archlinux-x86_64.iso",
];

pub struct ArchLinux {
    descriptor: ProductDescriptor,
    http: HttpClient,
    version_re: Regex,
}

impl ArchLinux {
    pub fn new(http: HttpClient) -> Result<Self, Error> {
        Ok(ArchLinux {
            descriptor: ProductDescriptor {
                id: "arch",
                name: "Arch Linux",
                vendor: "Arch Linux",
                category: Category::Os,
                description: "Lightweight rolling-release Linux distribution",
                icon_url: "",
                website_url: "https://archlinux.org/",
            },
            http,
            version_re: Regex::new(r"archlinux-([0-9]{4}\.[0-9]{2}\.[0-9]{2})")
                .context("invalid version pattern")?,
        })
    }

    /// Dated release from a redirect target, `latest` when the mirror does not redirect.
    fn version(&self, final_url: &str) -> String {
        self.version_re
            .captures(final_url)
            .map(|captures| captures[1].to_owned())
            .unwrap_or_else(|| "latest".to_owned())
    }
}

#[async_trait]
impl Source for ArchLinux {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        for mirror in MIRRORS {
            let response = match self.http.head(cx, mirror).await {
                Ok(response) => response,
                Err(SourceError::Cancelled) => return Err(SourceError::Cancelled),
                Err(err) => {
                    debug!(message = "Mirror unavailable", mirror, error = %err);
                    continue;
                }
            };

            let final_url = response.url().as_str();
            let version = self.version(final_url);
            let filename = if version == "latest" {
                extract_filename(mirror)
            } else {
                extract_filename(final_url)
            };

            return Ok(vec![VersionRecord {
                version,
                platform: Platform::Linux,
                arch: Arch::Amd64,
                download_url: (*mirror).to_owned(),
                checksum: None,
                file_size: header_length(&response).unwrap_or(0),
                filename,
            }]);
        }

        Err(SourceError::Unavailable(
            "no working Arch Linux mirror found".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn version_from_redirect_target() {
        let source = ArchLinux::new(HttpClient::new(Duration::from_secs(1)).unwrap()).unwrap();

        assert_eq!(
            source.version("https://mirror.example.org/iso/2025.06.01/archlinux-2025.06.01-x86_64.iso"),
            "2025.06.01"
        );
        assert_eq!(source.version(MIRRORS[0]), "latest");
    }
}
