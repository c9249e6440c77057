//! Vendors that publish a version API next to stable "latest" download links.

use super::table::{resolve, Download};
use super::{FetchContext, HttpClient, Source, SourceError};
use crate::{Arch, Category, Platform, ProductDescriptor, VersionRecord};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

const FIREFOX_VERSIONS_URL: &str = "https://product-details.mozilla.org/1.0/firefox_versions.json";
const CHROME_VERSIONS_URL: &str =
    "https://versionhistory.googleapis.com/v1/chrome/platforms/win/channels/stable/versions";
const VSCODE_UPDATE_URL: &str =
    "https://update.code.visualstudio.com/api/update/win32-x64-user/stable/latest";

pub struct Firefox {
    descriptor: ProductDescriptor,
    http: HttpClient,
}

impl Firefox {
    pub fn new(http: HttpClient) -> Self {
        Firefox {
            descriptor: ProductDescriptor {
                id: "firefox",
                name: "Firefox",
                vendor: "Mozilla",
                category: Category::App,
                description: "Open source web browser",
                icon_url: "",
                website_url: "https://www.mozilla.org/firefox/",
            },
            http,
        }
    }
}

const FIREFOX_DOWNLOADS: &[Download] = &[
    Download::new(
        Platform::Windows,
        Arch::Amd64,
        "https://download.mozilla.org/?product=firefox-latest&os=win64&lang=en-US",
    )
    .named("Firefox Setup.exe"),
    Download::new(
        Platform::Windows,
        Arch::X86,
        "https://download.mozilla.org/?product=firefox-latest&os=win&lang=en-US",
    )
    .named("Firefox Setup.exe"),
    Download::new(
        Platform::Macos,
        Arch::Amd64,
        "https://download.mozilla.org/?product=firefox-latest&os=osx&lang=en-US",
    )
    .named("Firefox.dmg"),
    Download::new(
        Platform::Linux,
        Arch::Amd64,
        "https://download.mozilla.org/?product=firefox-latest&os=linux64&lang=en-US",
    )
    .named("firefox.tar.bz2"),
];

fn firefox_version(versions: &HashMap<String, serde_json::Value>) -> Result<String, SourceError> {
    versions
        .get("LATEST_FIREFOX_VERSION")
        .and_then(|value| value.as_str())
        .filter(|version| !version.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| SourceError::Parse {
            what: "Firefox versions",
            reason: "LATEST_FIREFOX_VERSION missing".into(),
        })
}

#[async_trait]
impl Source for Firefox {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        let versions: HashMap<String, serde_json::Value> =
            self.http.get_json(cx, FIREFOX_VERSIONS_URL).await?;
        let version = firefox_version(&versions)?;
        resolve(&self.http, cx, &version, FIREFOX_DOWNLOADS).await
    }
}

pub struct Chrome {
    descriptor: ProductDescriptor,
    http: HttpClient,
}

impl Chrome {
    pub fn new(http: HttpClient) -> Self {
        Chrome {
            descriptor: ProductDescriptor {
                id: "chrome",
                name: "Google Chrome",
                vendor: "Google",
                category: Category::App,
                description: "Web browser from Google",
                icon_url: "",
                website_url: "https://www.google.com/chrome/",
            },
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChromeVersions {
    #[serde(default)]
    versions: Vec<ChromeVersion>,
}

#[derive(Debug, Deserialize)]
struct ChromeVersion {
    version: String,
}

const CHROME_DOWNLOADS: &[Download] = &[
    Download::new(
        Platform::Windows,
        Arch::Amd64,
        "https://dl.google.com/chrome/install/googlechromestandaloneenterprise64.msi",
    ),
    Download::new(
        Platform::Windows,
        Arch::X86,
        "https://dl.google.com/chrome/install/googlechromestandaloneenterprise.msi",
    ),
    Download::new(
        Platform::Macos,
        Arch::Amd64,
        "https://dl.google.com/chrome/mac/stable/GGRO/googlechrome.dmg",
    ),
    Download::new(
        Platform::Linux,
        Arch::Amd64,
        "https://dl.google.com/linux/direct/google-chrome-stable_current_amd64.deb",
    ),
];

#[async_trait]
impl Source for Chrome {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        let history: ChromeVersions = self.http.get_json(cx, CHROME_VERSIONS_URL).await?;
        // Newest first.
        let latest = history.versions.into_iter().next().ok_or(SourceError::Empty)?;
        resolve(&self.http, cx, &latest.version, CHROME_DOWNLOADS).await
    }
}

pub struct VsCode {
    descriptor: ProductDescriptor,
    http: HttpClient,
}

impl VsCode {
    pub fn new(http: HttpClient) -> Self {
        VsCode {
            descriptor: ProductDescriptor {
                id: "vscode",
                name: "Visual Studio Code",
                vendor: "Microsoft",
                category: Category::Tool,
                description: "Source code editor",
                icon_url: "",
                website_url: "https://code.visualstudio.com/",
            },
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VsCodeRelease {
    name: String,
}

const VSCODE_DOWNLOADS: &[Download] = &[
    Download::new(
        Platform::Windows,
        Arch::Amd64,
        "https://update.code.visualstudio.com/latest/win32-x64-user/stable",
    )
    .named("VSCodeUserSetup.exe"),
    Download::new(
        Platform::Windows,
        Arch::X86,
        "https://update.code.visualstudio.com/latest/win32-user/stable",
    )
    .named("VSCodeUserSetup.exe"),
    Download::new(
        Platform::Macos,
        Arch::Amd64,
        "https://update.code.visualstudio.com/latest/darwin/stable",
    )
    .named("VSCode-darwin.zip"),
    Download::new(
        Platform::Linux,
        Arch::Amd64,
        "https://update.code.visualstudio.com/latest/linux-x64/stable",
    )
    .named("code.tar.gz"),
];

#[async_trait]
impl Source for VsCode {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        let release: VsCodeRelease = self.http.get_json(cx, VSCODE_UPDATE_URL).await?;
        if release.name.is_empty() {
            return Err(SourceError::Parse {
                what: "VS Code release",
                reason: "empty version name".into(),
            });
        }
        resolve(&self.http, cx, &release.name, VSCODE_DOWNLOADS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firefox_version_comes_from_latest_key() {
        let versions: HashMap<String, serde_json::Value> = serde_json::from_str(
            r#"{
                "FIREFOX_ESR": "128.5.1esr",
                "LATEST_FIREFOX_VERSION": "133.0.3",
                "FIREFOX_NIGHTLY": "135.0a1"
            }"#,
        )
        .unwrap();

        assert_eq!(firefox_version(&versions).unwrap(), "133.0.3");
    }

    #[test]
    fn firefox_version_missing_is_a_parse_error() {
        let versions: HashMap<String, serde_json::Value> =
            serde_json::from_str(r#"{"FIREFOX_ESR": "128.5.1esr"}"#).unwrap();

        assert!(matches!(
            firefox_version(&versions),
            Err(SourceError::Parse { .. })
        ));
    }

    #[test]
    fn chrome_history_tolerates_missing_versions() {
        let history: ChromeVersions = serde_json::from_str("{}").unwrap();
        assert!(history.versions.is_empty());

        let history: ChromeVersions = serde_json::from_str(
            r#"{"versions": [{"name": "x", "version": "131.0.6778.205"}], "nextPageToken": ""}"#,
        )
        .unwrap();
        assert_eq!(history.versions[0].version, "131.0.6778.205");
    }

    #[test]
    fn windows_downloads_cover_both_architectures() {
        for table in [FIREFOX_DOWNLOADS, CHROME_DOWNLOADS, VSCODE_DOWNLOADS] {
            let windows: Vec<_> = table
                .iter()
                .filter(|d| d.platform == Platform::Windows)
                .map(|d| d.arch)
                .collect();
            assert_eq!(windows, vec![Arch::Amd64, Arch::X86]);
        }
    }
}
