//! Products whose installers are attached to GitHub releases.

use super::{FetchContext, HttpClient, Source, SourceError};
use crate::{Arch, Category, Platform, ProductDescriptor, VersionRecord};
use anyhow::{Context, Error};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: i64,
}

/// Asset name pattern for one platform/architecture.
struct Rule {
    platform: Platform,
    arch: Arch,
    pattern: Regex,
}

pub struct GithubRelease {
    descriptor: ProductDescriptor,
    repo: &'static str,
    rules: Vec<Rule>,
    http: HttpClient,
}

impl GithubRelease {
    fn new(
        descriptor: ProductDescriptor,
        repo: &'static str,
        rules: &[(Platform, Arch, &str)],
        http: HttpClient,
    ) -> Result<Self, Error> {
        let rules = rules
            .iter()
            .map(|&(platform, arch, pattern)| -> Result<Rule, Error> {
                Ok(Rule {
                    platform,
                    arch,
                    pattern: Regex::new(pattern)
                        .with_context(|| format!("invalid asset pattern for {}", descriptor.id))?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GithubRelease {
            descriptor,
            repo,
            rules,
            http,
        })
    }

    /// First asset matching each rule. Rules without a match are left out.
    fn match_assets(&self, release: &Release) -> Vec<VersionRecord> {
        let version = release.tag_name.trim_start_matches('v');
        self.rules
            .iter()
            .filter_map(|rule| {
                let asset = release
                    .assets
                    .iter()
                    .find(|asset| rule.pattern.is_match(&asset.name))?;
                Some(VersionRecord {
                    version: version.to_owned(),
                    platform: rule.platform,
                    arch: rule.arch,
                    download_url: asset.browser_download_url.clone(),
                    checksum: None,
                    file_size: asset.size,
                    filename: asset.name.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Source for GithubRelease {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        let url = format!("https://api.github.com/repos/{}/releases/latest", self.repo);
        let release: Release = self.http.get_json(cx, &url).await?;

        let records = self.match_assets(&release);
        if records.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(records)
    }
}

pub(crate) fn releases(http: &HttpClient) -> Result<Vec<GithubRelease>, Error> {
    use Arch::*;
    use Platform::*;

    Ok(vec![
        GithubRelease::new(
            ProductDescriptor {
                id: "telegram",
                name: "Telegram Desktop",
                vendor: "Telegram",
                category: Category::App,
                description: "Desktop client for the Telegram messenger",
                icon_url: "",
                website_url: "https://desktop.telegram.org/",
            },
            "telegramdesktop/tdesktop",
            &[
                (Windows, Amd64, r"^tsetup-x64\.[0-9.]+\.exe$"),
                (Windows, X86, r"^tsetup\.[0-9.]+\.exe$"),
                (Macos, Amd64, r"^tsetup\.[0-9.]+\.dmg$"),
                (Linux, Amd64, r"^tsetup\.[0-9.]+\.tar\.xz$"),
            ],
            http.clone(),
        )?,
        GithubRelease::new(
            ProductDescriptor {
                id: "nextcloud",
                name: "Nextcloud Desktop",
                vendor: "Nextcloud",
                category: Category::App,
                description: "File synchronisation client for Nextcloud",
                icon_url: "",
                website_url: "https://nextcloud.com/install/",
            },
            "nextcloud-releases/desktop",
            &[
                (Windows, Amd64, r"-x64\.msi$"),
                (Macos, Amd64, r"^Nextcloud-[0-9.]+\.pkg$"),
                (Linux, Amd64, r"-x86_64\.AppImage$"),
            ],
            http.clone(),
        )?,
        GithubRelease::new(
            ProductDescriptor {
                id: "brave",
                name: "Brave",
                vendor: "Brave Software",
                category: Category::App,
                description: "Privacy-focused web browser",
                icon_url: "",
                website_url: "https://brave.com/",
            },
            "brave/brave-browser",
            &[
                (Windows, Amd64, r"^BraveBrowserSetup\.exe$"),
                (Windows, X86, r"^brave-v.*-win32-ia32\.zip$"),
                (Macos, Amd64, r"^Brave-Browser-universal\.dmg$"),
                (Linux, Amd64, r"^brave-browser_.*_amd64\.deb$"),
            ],
            http.clone(),
        )?,
        GithubRelease::new(
            ProductDescriptor {
                id: "notepadplusplus",
                name: "Notepad++",
                vendor: "Don Ho",
                category: Category::Tool,
                description: "Source code editor for Windows",
                icon_url: "",
                website_url: "https://notepad-plus-plus.org/",
            },
            "notepad-plus-plus/notepad-plus-plus",
            &[
                (Windows, Amd64, r"Installer\.x64\.exe$"),
                (Windows, X86, r"^npp\.[0-9.]+\.Installer\.exe$"),
            ],
            http.clone(),
        )?,
        GithubRelease::new(
            ProductDescriptor {
                id: "powershell",
                name: "PowerShell",
                vendor: "Microsoft",
                category: Category::Tool,
                description: "Cross-platform shell and scripting language",
                icon_url: "",
                website_url: "https://learn.microsoft.com/powershell/",
            },
            "PowerShell/PowerShell",
            &[
                (Windows, Amd64, r"^PowerShell-.*-win-x64\.msi$"),
                (Windows, X86, r"^PowerShell-.*-win-x86\.msi$"),
                (Macos, Amd64, r"^powershell-.*-osx-x64\.pkg$"),
                (Macos, Arm64, r"^powershell-.*-osx-arm64\.pkg$"),
                (Linux, Amd64, r"^powershell_.*\.deb_amd64\.deb$"),
            ],
            http.clone(),
        )?,
    ])
}
