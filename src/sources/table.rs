//! Products published under stable, unversioned URLs.

use super::{extract_filename, FetchContext, HttpClient, Source, SourceError};
use crate::{Arch, Category, Platform, ProductDescriptor, VersionRecord};
use async_trait::async_trait;

/// One fixed download location.
#[derive(Debug, Clone, Copy)]
pub struct Download {
    pub platform: Platform,
    pub arch: Arch,
    pub url: &'static str,
    /// Used when the URL does not end in a meaningful file name.
    pub filename: Option<&'static str>,
}

impl Download {
    pub const fn new(platform: Platform, arch: Arch, url: &'static str) -> Self {
        Download {
            platform,
            arch,
            url,
            filename: None,
        }
    }

    pub const fn named(self, filename: &'static str) -> Self {
        Download {
            filename: Some(filename),
            ..self
        }
    }

    fn filename(&self) -> String {
        match self.filename {
            Some(name) => name.to_owned(),
            None => extract_filename(self.url),
        }
    }
}

/// Turns a download table into records for `version`, sizing each file with a HEAD request.
pub(crate) async fn resolve(
    http: &HttpClient,
    cx: &FetchContext,
    version: &str,
    downloads: &[Download],
) -> Result<Vec<VersionRecord>, SourceError> {
    let mut records = Vec::with_capacity(downloads.len());
    for download in downloads {
        cx.check()?;
        records.push(VersionRecord {
            version: version.to_owned(),
            platform: download.platform,
            arch: download.arch,
            download_url: download.url.to_owned(),
            checksum: None,
            file_size: http.content_length(cx, download.url).await,
            filename: download.filename(),
        });
    }
    cx.check()?;
    Ok(records)
}

/// A product whose version label never changes between fetches.
pub struct FixedSource {
    descriptor: ProductDescriptor,
    version: &'static str,
    downloads: &'static [Download],
    http: HttpClient,
}

impl FixedSource {
    pub fn new(
        descriptor: ProductDescriptor,
        version: &'static str,
        downloads: &'static [Download],
        http: HttpClient,
    ) -> Self {
        FixedSource {
            descriptor,
            version,
            downloads,
            http,
        }
    }
}

#[async_trait]
impl Source for FixedSource {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        if self.downloads.is_empty() {
            return Err(SourceError::Empty);
        }
        resolve(&self.http, cx, self.version, self.downloads).await
    }
}

const KALI: ProductDescriptor = ProductDescriptor {
    id: "kali",
    name: "Kali Linux",
    vendor: "Offensive Security",
    category: Category::Os,
    description: "Debian-based distribution for penetration testing",
    icon_url: "",
    website_url: "https://www.kali.org/",
};

const KALI_DOWNLOADS: &[Download] = &[Download::new(
    Platform::Linux,
    Arch::Amd64,
    "https://cdimage.kali.org/kali-2025.2/kali-linux-2025.2-installer-amd64.iso",
)];

const WINDOWS: ProductDescriptor = ProductDescriptor {
    id: "windows",
    name: "Windows 11",
    vendor: "Microsoft",
    category: Category::Os,
    description: "Installation media for Microsoft Windows 11",
    icon_url: "",
    website_url: "https://www.microsoft.com/software-download/windows11",
};

const WINDOWS_DOWNLOADS: &[Download] = &[Download::new(
    Platform::Windows,
    Arch::Amd64,
    "https://go.microsoft.com/fwlink/?LinkId=691209",
)
.named("MediaCreationToolW11.exe")];

const TERMIUS: ProductDescriptor = ProductDescriptor {
    id: "termius",
    name: "Termius",
    vendor: "Termius Corporation",
    category: Category::Tool,
    description: "SSH client for desktop and mobile",
    icon_url: "",
    website_url: "https://termius.com/",
};

const TERMIUS_DOWNLOADS: &[Download] = &[
    Download::new(
        Platform::Windows,
        Arch::Amd64,
        "https://autoupdate.termius.com/windows/Termius.exe",
    ),
    Download::new(
        Platform::Macos,
        Arch::Amd64,
        "https://autoupdate.termius.com/mac/Termius.dmg",
    ),
    Download::new(
        Platform::Linux,
        Arch::Amd64,
        "https://autoupdate.termius.com/linux/Termius.AppImage",
    ),
];

const WHATSAPP: ProductDescriptor = ProductDescriptor {
    id: "whatsapp",
    name: "WhatsApp",
    vendor: "Meta",
    category: Category::App,
    description: "Desktop client for WhatsApp messaging",
    icon_url: "",
    website_url: "https://www.whatsapp.com/download",
};

const WHATSAPP_DOWNLOADS: &[Download] = &[
    Download::new(
        Platform::Windows,
        Arch::Amd64,
        "https://apps.microsoft.com/detail/whatsapp/9NKSQGP7F2NH",
    )
    .named("WhatsApp.msix"),
    Download::new(
        Platform::Macos,
        Arch::Amd64,
        "https://web.whatsapp.com/desktop/mac_native/release",
    )
    .named("WhatsApp.dmg"),
];

const TAILSCALE: ProductDescriptor = ProductDescriptor {
    id: "tailscale",
    name: "Tailscale",
    vendor: "Tailscale Inc.",
    category: Category::Tool,
    description: "WireGuard-based mesh VPN",
    icon_url: "",
    website_url: "https://tailscale.com/download",
};

const TAILSCALE_DOWNLOADS: &[Download] = &[
    Download::new(
        Platform::Windows,
        Arch::Amd64,
        "https://pkgs.tailscale.com/stable/tailscale-setup-latest.exe",
    ),
    Download::new(
        Platform::Macos,
        Arch::Amd64,
        "https://pkgs.tailscale.com/stable/Tailscale-latest-macos.pkg",
    ),
    Download::new(
        Platform::Linux,
        Arch::Amd64,
        "https://pkgs.tailscale.com/stable/tailscale_latest_amd64.deb",
    ),
];

pub(crate) fn fixed(http: &HttpClient) -> Vec<FixedSource> {
    vec![
        FixedSource::new(KALI, "2025.2", KALI_DOWNLOADS, http.clone()),
        FixedSource::new(WINDOWS, "Windows 11", WINDOWS_DOWNLOADS, http.clone()),
        FixedSource::new(TERMIUS, "latest", TERMIUS_DOWNLOADS, http.clone()),
        FixedSource::new(WHATSAPP, "latest", WHATSAPP_DOWNLOADS, http.clone()),
        FixedSource::new(TAILSCALE, "latest", TAILSCALE_DOWNLOADS, http.clone()),
    ]
}
