//! Command line parsing and the frozen runtime configuration.
//!
//! The binary takes flag-style verbs (--list, --download, --galaxy-install
//! PRODUCT, ...) plus options, mirrored into a plain [`Config`] value that
//! is built once in main and then only read. Nothing in the crate consults
//! a global; everything receives `&Config` (or the few fields it needs).
//!
//! Default directories follow the XDG conventions:
//! - cache:  $XDG_CACHE_HOME/gog_client  (fallback ~/.cache/gog_client)
//! - config: $XDG_CONFIG_HOME/gog_client (fallback ~/.config/gog_client)
//! - downloads: current directory unless --directory is given

use std::path::PathBuf;

use clap::Parser;

use crate::blacklist::Blacklist;

// Language bitmask values. The regex column matches the spellings the
// service uses across product documents and depot manifests.
pub const LANGUAGE_EN: u32 = 1 << 0;
pub const LANGUAGE_DE: u32 = 1 << 1;
pub const LANGUAGE_FR: u32 = 1 << 2;
pub const LANGUAGE_PL: u32 = 1 << 3;
pub const LANGUAGE_RU: u32 = 1 << 4;
pub const LANGUAGE_CN: u32 = 1 << 5;
pub const LANGUAGE_CZ: u32 = 1 << 6;
pub const LANGUAGE_ES: u32 = 1 << 7;
pub const LANGUAGE_HU: u32 = 1 << 8;
pub const LANGUAGE_IT: u32 = 1 << 9;
pub const LANGUAGE_JP: u32 = 1 << 10;
pub const LANGUAGE_TR: u32 = 1 << 11;
pub const LANGUAGE_PT: u32 = 1 << 12;
pub const LANGUAGE_KO: u32 = 1 << 13;
pub const LANGUAGE_NL: u32 = 1 << 14;
pub const LANGUAGE_SV: u32 = 1 << 15;
pub const LANGUAGE_NO: u32 = 1 << 16;
pub const LANGUAGE_DA: u32 = 1 << 17;
pub const LANGUAGE_FI: u32 = 1 << 18;
pub const LANGUAGE_PT_BR: u32 = 1 << 19;
pub const LANGUAGE_SK: u32 = 1 << 20;
pub const LANGUAGE_BL: u32 = 1 << 21;
pub const LANGUAGE_UK: u32 = 1 << 22;

pub const PLATFORM_WINDOWS: u32 = 1 << 0;
pub const PLATFORM_MAC: u32 = 1 << 1;
pub const PLATFORM_LINUX: u32 = 1 << 2;

pub const ARCH_X86: u32 = 1 << 0;
pub const ARCH_X64: u32 = 1 << 1;

// Include-filter bits, one per file-kind family member.
pub const INCLUDE_BASE_INSTALLER: u32 = 1 << 0;
pub const INCLUDE_BASE_EXTRA: u32 = 1 << 1;
pub const INCLUDE_BASE_PATCH: u32 = 1 << 2;
pub const INCLUDE_BASE_LANGPACK: u32 = 1 << 3;
pub const INCLUDE_DLC_INSTALLER: u32 = 1 << 4;
pub const INCLUDE_DLC_EXTRA: u32 = 1 << 5;
pub const INCLUDE_DLC_PATCH: u32 = 1 << 6;
pub const INCLUDE_DLC_LANGPACK: u32 = 1 << 7;
pub const INCLUDE_DLC: u32 =
    INCLUDE_DLC_INSTALLER | INCLUDE_DLC_EXTRA | INCLUDE_DLC_PATCH | INCLUDE_DLC_LANGPACK;
pub const INCLUDE_BASE: u32 =
    INCLUDE_BASE_INSTALLER | INCLUDE_BASE_EXTRA | INCLUDE_BASE_PATCH | INCLUDE_BASE_LANGPACK;
pub const INCLUDE_ALL: u32 = INCLUDE_BASE | INCLUDE_DLC;

/// One row of an option table: bitmask value, short code, display name and
/// the regex accepted on the command line / in wire documents.
pub struct OptionDef {
    pub id: u32,
    pub code: &'static str,
    pub name: &'static str,
    pub pattern: &'static str,
}

pub const LANGUAGES: &[OptionDef] = &[
    OptionDef { id: LANGUAGE_EN, code: "en", name: "English", pattern: "en|eng|english|en[_-]US" },
    OptionDef { id: LANGUAGE_DE, code: "de", name: "German", pattern: "de|deu|ger|german|de[_-]DE" },
    OptionDef { id: LANGUAGE_FR, code: "fr", name: "French", pattern: "fr|fra|fre|french|fr[_-]FR" },
    OptionDef { id: LANGUAGE_PL, code: "pl", name: "Polish", pattern: "pl|pol|polish|pl[_-]PL" },
    OptionDef { id: LANGUAGE_RU, code: "ru", name: "Russian", pattern: "ru|rus|russian|ru[_-]RU" },
    OptionDef { id: LANGUAGE_CN, code: "cn", name: "Chinese", pattern: "cn|zh|zho|chi|chinese|zh[_-](CN|Hans)" },
    OptionDef { id: LANGUAGE_CZ, code: "cz", name: "Czech", pattern: "cz|cs|ces|cze|czech|cs[_-]CZ" },
    OptionDef { id: LANGUAGE_ES, code: "es", name: "Spanish", pattern: "es|spa|spanish|es[_-]ES" },
    OptionDef { id: LANGUAGE_HU, code: "hu", name: "Hungarian", pattern: "hu|hun|hungarian|hu[_-]HU" },
    OptionDef { id: LANGUAGE_IT, code: "it", name: "Italian", pattern: "it|ita|italian|it[_-]IT" },
    OptionDef { id: LANGUAGE_JP, code: "jp", name: "Japanese", pattern: "jp|ja|jpn|japanese|ja[_-]JP" },
    OptionDef { id: LANGUAGE_TR, code: "tr", name: "Turkish", pattern: "tr|tur|turkish|tr[_-]TR" },
    OptionDef { id: LANGUAGE_PT, code: "pt", name: "Portuguese", pattern: "pt|por|portuguese|pt[_-]PT" },
    OptionDef { id: LANGUAGE_KO, code: "ko", name: "Korean", pattern: "ko|kor|korean|ko[_-]KR" },
    OptionDef { id: LANGUAGE_NL, code: "nl", name: "Dutch", pattern: "nl|nld|dut|dutch|nl[_-]NL" },
    OptionDef { id: LANGUAGE_SV, code: "sv", name: "Swedish", pattern: "sv|swe|swedish|sv[_-]SE" },
    OptionDef { id: LANGUAGE_NO, code: "no", name: "Norwegian", pattern: "no|nor|norwegian|nb[_-]NO|nn[_-]NO" },
    OptionDef { id: LANGUAGE_DA, code: "da", name: "Danish", pattern: "da|dan|danish|da[_-]DK" },
    OptionDef { id: LANGUAGE_FI, code: "fi", name: "Finnish", pattern: "fi|fin|finnish|fi[_-]FI" },
    OptionDef { id: LANGUAGE_PT_BR, code: "br", name: "Brazilian Portuguese", pattern: "br|pt_br|pt-br|ptbr|brazilian_portuguese" },
    OptionDef { id: LANGUAGE_SK, code: "sk", name: "Slovak", pattern: "sk|slk|slo|slovak|sk[_-]SK" },
    OptionDef { id: LANGUAGE_BL, code: "bl", name: "Bulgarian", pattern: "bl|bg|bul|bulgarian|bg[_-]BG" },
    OptionDef { id: LANGUAGE_UK, code: "uk", name: "Ukrainian", pattern: "uk|ukr|ukrainian|uk[_-]UA" },
];

pub const PLATFORMS: &[OptionDef] = &[
    OptionDef { id: PLATFORM_WINDOWS, code: "win", name: "Windows", pattern: "w|win|windows" },
    OptionDef { id: PLATFORM_MAC, code: "mac", name: "Mac", pattern: "m|mac|osx" },
    OptionDef { id: PLATFORM_LINUX, code: "linux", name: "Linux", pattern: "l|lin|linux" },
];

pub const GALAXY_ARCHS: &[OptionDef] = &[
    OptionDef { id: ARCH_X86, code: "32", name: "32-bit", pattern: "32|x86|32bit|32-bit" },
    OptionDef { id: ARCH_X64, code: "64", name: "64-bit", pattern: "64|x64|64bit|64-bit" },
];

pub const INCLUDE_OPTIONS: &[OptionDef] = &[
    OptionDef { id: INCLUDE_BASE_INSTALLER, code: "bi", name: "Base game installers", pattern: "bi|basegame_installers" },
    OptionDef { id: INCLUDE_BASE_EXTRA, code: "be", name: "Base game extras", pattern: "be|basegame_extras" },
    OptionDef { id: INCLUDE_BASE_PATCH, code: "bp", name: "Base game patches", pattern: "bp|basegame_patches" },
    OptionDef { id: INCLUDE_BASE_LANGPACK, code: "bl", name: "Base game language packs", pattern: "bl|basegame_languagepacks|basegame_langpacks" },
    OptionDef { id: INCLUDE_DLC_INSTALLER, code: "di", name: "DLC installers", pattern: "di|dlc_installers" },
    OptionDef { id: INCLUDE_DLC_EXTRA, code: "de", name: "DLC extras", pattern: "de|dlc_extras" },
    OptionDef { id: INCLUDE_DLC_PATCH, code: "dp", name: "DLC patches", pattern: "dp|dlc_patches" },
    OptionDef { id: INCLUDE_DLC_LANGPACK, code: "dl", name: "DLC language packs", pattern: "dl|dlc_languagepacks|dlc_langpacks" },
    OptionDef { id: INCLUDE_DLC, code: "d", name: "DLCs", pattern: "d|dlc|dlcs" },
    OptionDef { id: INCLUDE_BASE, code: "b", name: "Basegame", pattern: "b|bg|basegame" },
    OptionDef { id: INCLUDE_BASE_INSTALLER | INCLUDE_DLC_INSTALLER, code: "i", name: "All installers", pattern: "i|installers" },
    OptionDef { id: INCLUDE_BASE_EXTRA | INCLUDE_DLC_EXTRA, code: "e", name: "All extras", pattern: "e|extras" },
    OptionDef { id: INCLUDE_BASE_PATCH | INCLUDE_DLC_PATCH, code: "p", name: "All patches", pattern: "p|patches" },
    OptionDef { id: INCLUDE_BASE_LANGPACK | INCLUDE_DLC_LANGPACK, code: "l", name: "All language packs", pattern: "l|languagepacks|langpacks" },
];

/// Resolves a comma separated option string ("en,de", "w+l", "all") to the
/// OR of matching bitmask values. "all" selects every row.
pub fn option_value(input: &str, table: &[OptionDef]) -> u32 {
    let mut value = 0u32;
    for token in input.split(|c| c == ',' || c == '+') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.eq_ignore_ascii_case("all") {
            for def in table {
                value |= def.id;
            }
            continue;
        }
        for def in table {
            let re = regex::Regex::new(&format!("^(?i:{})$", def.pattern)).expect("option pattern");
            if re.is_match(token) {
                value |= def.id;
                break;
            }
        }
    }
    value
}

/// Ordered bitmask list for priority options ("fr,en" keeps order).
pub fn option_priority(input: &str, table: &[OptionDef]) -> Vec<u32> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let v = option_value(token, table);
        if v != 0 {
            out.push(v);
        }
    }
    out
}

/// Lowercase display name for the first platform bit set, or None.
pub fn platform_code(platform: u32) -> Option<&'static str> {
    PLATFORMS.iter().find(|d| platform & d.id == d.id).map(|d| {
        match d.id {
            PLATFORM_WINDOWS => "windows",
            PLATFORM_MAC => "mac",
            PLATFORM_LINUX => "linux",
            _ => unreachable!(),
        }
    })
}

/// Galaxy platform name used in content-system URLs.
pub fn galaxy_platform_name(platform: u32) -> &'static str {
    if platform & PLATFORM_LINUX != 0 {
        "linux"
    } else if platform & PLATFORM_MAC != 0 {
        "osx"
    } else {
        "windows"
    }
}

/// Regex alternation matching the configured language in depot documents.
pub fn language_regex(language: u32) -> String {
    LANGUAGES
        .iter()
        .find(|d| d.id == language)
        .map(|d| d.pattern.to_string())
        .unwrap_or_else(|| LANGUAGES[0].pattern.to_string())
}

/// Arch token used in depot osBitness arrays.
pub fn galaxy_arch_code(arch: u32) -> &'static str {
    GALAXY_ARCHS
        .iter()
        .find(|d| d.id == arch)
        .map(|d| d.code)
        .unwrap_or("64")
}

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "gog_client", version, about = "Download your GOG game library")]
pub struct Args {
    /// Login and store a refresh token
    #[arg(long)]
    pub login: bool,
    /// List games
    #[arg(long)]
    pub list: bool,
    /// List format: games, details, json, tags, userdata, wishlist, transform
    #[arg(long, default_value = "games")]
    pub list_format: String,
    /// Download selected files
    #[arg(long)]
    pub download: bool,
    /// Verify downloaded files with sidecar XML and restream bad chunks
    #[arg(long)]
    pub repair: bool,
    /// Show per-file status codes (OK/ND/MD5/FS)
    #[arg(long)]
    pub check_status: bool,
    /// Only compare file sizes when checking status
    #[arg(long)]
    pub size_only: bool,
    /// Refresh the game details cache
    #[arg(long)]
    pub update_cache: bool,
    /// Use the game details cache
    #[arg(long)]
    pub use_cache: bool,
    /// Minutes the cache stays fresh
    #[arg(long, default_value_t = 2880)]
    pub cache_valid: i64,
    /// Check account notifications
    #[arg(long)]
    pub update_check: bool,
    /// Walk the download directory and list files not in the current plan.
    /// Optional regex limits which files are considered.
    #[arg(long, value_name = "REGEX", num_args = 0..=1, default_missing_value = ".*")]
    pub check_orphans: Option<String>,
    /// Delete orphaned files instead of listing them
    #[arg(long)]
    pub delete_orphans: bool,
    /// Install a product from the content system: PRODUCT_ID[/BUILD_INDEX]
    #[arg(long, value_name = "PRODUCT")]
    pub galaxy_install: Option<String>,
    /// Show builds for a product: PRODUCT_ID[/BUILD_INDEX]
    #[arg(long, value_name = "PRODUCT")]
    pub galaxy_show_builds: Option<String>,
    /// Download files by id: "gamename/fileid[,gamename/fileid...]"
    #[arg(long, default_value = "")]
    pub download_file: String,
    /// Output filename for --download-file
    #[arg(long, short = 'o', default_value = "")]
    pub output_file: String,
    /// Upload cloud saves for a product
    #[arg(long, value_name = "PRODUCT")]
    pub cloud_upload: Option<String>,
    /// Download cloud saves for a product
    #[arg(long, value_name = "PRODUCT")]
    pub cloud_download: Option<String>,
    /// List remote cloud saves for a product
    #[arg(long, value_name = "PRODUCT")]
    pub cloud_show: Option<String>,
    /// List local cloud saves for a product
    #[arg(long, value_name = "PRODUCT")]
    pub cloud_show_local: Option<String>,
    /// Delete remote cloud saves for a product
    #[arg(long, value_name = "PRODUCT")]
    pub cloud_delete: Option<String>,
    /// Upload and download whichever side is newer
    #[arg(long, value_name = "PRODUCT")]
    pub cloud_sync: Option<String>,
    /// Force cloud operations even when timestamps disagree
    #[arg(long)]
    pub cloud_force: bool,

    /// Regex filter over game slugs for download/list/repair
    #[arg(long, default_value = "")]
    pub game: String,
    /// Only games flagged as updated
    #[arg(long)]
    pub updated: bool,
    /// Include hidden products in the listing
    #[arg(long)]
    pub include_hidden_products: bool,
    /// Comma separated account tag ids
    #[arg(long, default_value = "")]
    pub tags: String,
    /// Select what to download/list/repair (bi,be,bp,bl,di,de,dp,dl,...)
    #[arg(long, default_value = "all")]
    pub include: String,
    /// Deselect kinds from --include
    #[arg(long, default_value = "")]
    pub exclude: String,
    /// Installer platforms (w+l, all, ...)
    #[arg(long, default_value = "w+l")]
    pub platform: String,
    /// Installer languages (en, en+de, all, ...)
    #[arg(long, default_value = "en")]
    pub language: String,
    /// Keep only the best file per platform priority list ("l,w")
    #[arg(long, default_value = "")]
    pub platform_priority: String,
    /// Keep only the best file per language priority list ("fr,en")
    #[arg(long, default_value = "")]
    pub language_priority: String,

    /// Download directory
    #[arg(long, default_value = ".")]
    pub directory: String,
    /// Don't create kind subdirectories
    #[arg(long)]
    pub no_subdirectories: bool,
    /// Subdirectory template for games
    #[arg(long, default_value = "%gamename%")]
    pub subdir_game: String,
    /// Subdirectory for installers
    #[arg(long, default_value = "")]
    pub subdir_installers: String,
    /// Subdirectory for extras
    #[arg(long, default_value = "extras")]
    pub subdir_extras: String,
    /// Subdirectory for patches
    #[arg(long, default_value = "patches")]
    pub subdir_patches: String,
    /// Subdirectory for language packs
    #[arg(long, default_value = "languagepacks")]
    pub subdir_language_packs: String,
    /// Subdirectory template for DLC content
    #[arg(long, default_value = "dlc/%dlcname%")]
    pub subdir_dlc: String,
    /// Subdirectory for content-system installs
    #[arg(long, default_value = "%gamename%")]
    pub subdir_galaxy_install: String,
    /// Wine prefix holding the Windows user profile (cloud saves)
    #[arg(long, default_value = "")]
    pub wine_prefix: String,
    /// Override the cache directory
    #[arg(long)]
    pub cache_directory: Option<String>,
    /// Override the sidecar XML directory
    #[arg(long)]
    pub xml_directory: Option<String>,

    /// Number of download workers
    #[arg(long, default_value_t = 4)]
    pub threads: u32,
    /// Number of product-detail fetch workers
    #[arg(long, default_value_t = 4)]
    pub info_threads: u32,
    /// Maximum retries for a failed transfer
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
    /// Milliseconds to wait between requests
    #[arg(long, default_value_t = 0)]
    pub wait: u64,
    /// Connection timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
    /// Abort transfers below RATE bytes/sec for --low-speed-timeout seconds
    #[arg(long, default_value_t = 200)]
    pub low_speed_rate: u64,
    /// Seconds a transfer may stay below the low speed rate
    #[arg(long, default_value_t = 30)]
    pub low_speed_timeout: u64,
    /// Limit download rate (kB/s, 0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub limit_rate: u64,
    /// Progress refresh interval in milliseconds
    #[arg(long, default_value_t = 100)]
    pub progress_interval: u64,
    /// Don't verify TLS certificates
    #[arg(long)]
    pub insecure: bool,
    /// Path to a CA certificate bundle in PEM format
    #[arg(long, default_value = "")]
    pub cacert: String,
    /// Override the User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Don't adjust permissions of sensitive files
    #[arg(long)]
    pub respect_umask: bool,
    /// Don't use colors in messages
    #[arg(long)]
    pub no_color: bool,

    /// Don't fetch remote XML when deciding resume/skip
    #[arg(long)]
    pub no_remote_xml: bool,
    /// Create sidecar XML after successful downloads
    #[arg(long)]
    pub automatic_xml_creation: bool,
    /// Chunk size in MB when creating sidecar XML
    #[arg(long, default_value_t = 10)]
    pub chunk_size: u64,
    /// Trust API file sizes for extras instead of Content-Length probes
    #[arg(long)]
    pub trust_api_for_extras: bool,
    /// Don't coalesce identical installer paths across languages
    #[arg(long)]
    pub no_duplicate_handling: bool,
    /// Save serial keys when downloading
    #[arg(long)]
    pub save_serials: bool,
    /// Save changelogs when downloading
    #[arg(long)]
    pub save_changelogs: bool,
    /// Save product JSON documents when downloading
    #[arg(long)]
    pub save_product_json: bool,
    /// Save game logos when downloading
    #[arg(long)]
    pub save_logo: bool,
    /// Save game icons when downloading
    #[arg(long)]
    pub save_icon: bool,
    /// Skip the free disk space check
    #[arg(long)]
    pub no_free_space_check: bool,
    /// Append a per-file result line to gog_client-report.log
    #[arg(long)]
    pub report: bool,

    /// Galaxy platform for --galaxy-install (w, m, l)
    #[arg(long, default_value = "w")]
    pub galaxy_platform: String,
    /// Galaxy language for --galaxy-install
    #[arg(long, default_value = "en")]
    pub galaxy_language: String,
    /// Galaxy arch for --galaxy-install (32, 64)
    #[arg(long, default_value = "x64")]
    pub galaxy_arch: String,
    /// CDN priority, highest first
    #[arg(long, default_value = "edgecast,akamai_edgecast_proxy,fastly")]
    pub galaxy_cdn_priority: String,
    /// Resolve and download dependency depots as well
    #[arg(long)]
    pub galaxy_no_dependencies: bool,

    /// Legacy API token for id-addressed downloads of delisted files
    #[arg(long, default_value = "")]
    pub api_token: String,
    /// Legacy API secret paired with --api-token
    #[arg(long, default_value = "")]
    pub api_secret: String,
}

/// Per-verb directory layout options.
#[derive(Clone, Debug, Default)]
pub struct DirectoryConfig {
    pub use_subdirectories: bool,
    pub directory: String,
    pub wine_prefix: String,
    pub game_subdir: String,
    pub installers_subdir: String,
    pub extras_subdir: String,
    pub patches_subdir: String,
    pub language_pack_subdir: String,
    pub dlc_subdir: String,
    pub galaxy_install_subdir: String,
}

/// Download selection options, separable from the rest so per-game config
/// overrides can swap them wholesale.
#[derive(Clone, Debug, Default)]
pub struct DownloadConfig {
    pub include: u32,
    pub platform: u32,
    pub language: u32,
    pub platform_priority: Vec<u32>,
    pub language_priority: Vec<u32>,
    pub galaxy_platform: u32,
    pub galaxy_language: u32,
    pub galaxy_arch: u32,
    pub galaxy_cdn_priority: Vec<String>,
    pub galaxy_dependencies: bool,
    pub remote_xml: bool,
    pub automatic_xml_creation: bool,
    pub save_serials: bool,
    pub save_changelogs: bool,
    pub save_product_json: bool,
    pub save_logo: bool,
    pub save_icon: bool,
    pub duplicate_handler: bool,
    pub delete_orphans: bool,
    pub free_space_check: bool,
}

/// Transport options handed to HttpClient.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub verify_peer: bool,
    pub ca_bundle: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub low_speed_rate: u64,
    pub low_speed_timeout: u64,
    pub limit_rate_kbps: u64,
    pub retries: u32,
    pub wait_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            verify_peer: true,
            ca_bundle: String::new(),
            user_agent: default_user_agent(),
            connect_timeout_secs: 10,
            low_speed_rate: 200,
            low_speed_timeout: 30,
            limit_rate_kbps: 0,
            retries: 3,
            wait_ms: 0,
        }
    }
}

pub fn default_user_agent() -> String {
    format!("gog_client/{}", env!("CARGO_PKG_VERSION"))
}

/// The frozen runtime configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub args: Args,
    pub dl: DownloadConfig,
    pub dirs: DirectoryConfig,
    pub http: HttpConfig,

    pub cache_dir: PathBuf,
    pub xml_dir: PathBuf,
    pub config_dir: PathBuf,
    pub token_path: PathBuf,
    pub report_path: PathBuf,

    pub blacklist: Blacklist,
    pub ignorelist: Blacklist,
    pub gamehasdlc: Blacklist,

    pub color: bool,
    pub respect_umask: bool,
    pub threads: u32,
    pub info_threads: u32,
    pub retries: u32,
    pub progress_interval_ms: u64,
    pub chunk_size: u64,
    pub cache_valid_minutes: i64,
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(fallback))
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn cache_home() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache")
}

pub fn config_home() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

impl Config {
    /// Builds the frozen configuration from parsed arguments, loading the
    /// blacklist/ignorelist pattern files if present.
    pub fn from_args(args: Args) -> Config {
        let cache_dir = args
            .cache_directory
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| cache_home().join("gog_client"));
        let xml_dir = args
            .xml_directory
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| cache_dir.join("xml"));
        let config_dir = config_home().join("gog_client");

        let dl = DownloadConfig {
            include: option_value(&args.include, INCLUDE_OPTIONS)
                & !option_value(&args.exclude, INCLUDE_OPTIONS),
            platform: option_value(&args.platform, PLATFORMS),
            language: option_value(&args.language, LANGUAGES),
            platform_priority: option_priority(&args.platform_priority, PLATFORMS),
            language_priority: option_priority(&args.language_priority, LANGUAGES),
            galaxy_platform: option_value(&args.galaxy_platform, PLATFORMS),
            galaxy_language: option_value(&args.galaxy_language, LANGUAGES),
            galaxy_arch: option_value(&args.galaxy_arch, GALAXY_ARCHS),
            galaxy_cdn_priority: args
                .galaxy_cdn_priority
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            galaxy_dependencies: !args.galaxy_no_dependencies,
            remote_xml: !args.no_remote_xml,
            automatic_xml_creation: args.automatic_xml_creation,
            save_serials: args.save_serials,
            save_changelogs: args.save_changelogs,
            save_product_json: args.save_product_json,
            save_logo: args.save_logo,
            save_icon: args.save_icon,
            duplicate_handler: !args.no_duplicate_handling,
            delete_orphans: args.delete_orphans,
            free_space_check: !args.no_free_space_check,
        };

        let dirs = DirectoryConfig {
            use_subdirectories: !args.no_subdirectories,
            directory: args.directory.clone(),
            wine_prefix: args.wine_prefix.clone(),
            game_subdir: args.subdir_game.clone(),
            installers_subdir: args.subdir_installers.clone(),
            extras_subdir: args.subdir_extras.clone(),
            patches_subdir: args.subdir_patches.clone(),
            language_pack_subdir: args.subdir_language_packs.clone(),
            dlc_subdir: args.subdir_dlc.clone(),
            galaxy_install_subdir: args.subdir_galaxy_install.clone(),
        };

        let http = HttpConfig {
            verify_peer: !args.insecure,
            ca_bundle: args.cacert.clone(),
            user_agent: args.user_agent.clone().unwrap_or_else(default_user_agent),
            connect_timeout_secs: args.timeout,
            low_speed_rate: args.low_speed_rate,
            low_speed_timeout: args.low_speed_timeout,
            limit_rate_kbps: args.limit_rate,
            retries: args.retries,
            wait_ms: args.wait,
        };

        let blacklist = Blacklist::from_file(&config_dir.join("blacklist.txt"));
        let ignorelist = Blacklist::from_file(&config_dir.join("ignorelist.txt"));
        let gamehasdlc = Blacklist::from_file(&config_dir.join("game_has_dlc.txt"));

        Config {
            color: !args.no_color,
            respect_umask: args.respect_umask,
            threads: args.threads.max(1),
            info_threads: args.info_threads.max(1),
            retries: args.retries,
            progress_interval_ms: args.progress_interval.clamp(1, 10_000),
            chunk_size: args.chunk_size.max(1) << 20,
            cache_valid_minutes: args.cache_valid,
            token_path: config_dir.join("galaxy_tokens.json"),
            report_path: PathBuf::from("gog_client-report.log"),
            cache_dir,
            xml_dir,
            config_dir,
            blacklist,
            ignorelist,
            gamehasdlc,
            dl,
            dirs,
            http,
            args,
        }
    }

    /// Applies `<config>/<gamename>.conf` overrides onto a copy of the
    /// download configuration. Unknown keys are ignored.
    pub fn game_specific(&self, gamename: &str) -> DownloadConfig {
        let mut dl = self.dl.clone();
        let path = self.config_dir.join(format!("{}.conf", gamename));
        let Ok(bytes) = std::fs::read(&path) else {
            return dl;
        };
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            log::warn!("failed to parse game specific config {}", path.display());
            return dl;
        };
        if let Some(v) = json.get("language").and_then(|v| v.as_u64()) {
            dl.language = v as u32;
        }
        if let Some(v) = json.get("platform").and_then(|v| v.as_u64()) {
            dl.platform = v as u32;
        }
        if let Some(v) = json.get("include-dlcs").and_then(|v| v.as_bool()) {
            if v {
                dl.include |= INCLUDE_DLC;
            } else {
                dl.include &= !INCLUDE_DLC;
            }
        }
        dl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_value_matches_aliases() {
        assert_eq!(option_value("w", PLATFORMS), PLATFORM_WINDOWS);
        assert_eq!(option_value("w+l", PLATFORMS), PLATFORM_WINDOWS | PLATFORM_LINUX);
        assert_eq!(option_value("windows,mac", PLATFORMS), PLATFORM_WINDOWS | PLATFORM_MAC);
        assert_eq!(option_value("en", LANGUAGES), LANGUAGE_EN);
        assert_eq!(option_value("en-US", LANGUAGES), LANGUAGE_EN);
        assert_eq!(option_value("x64", GALAXY_ARCHS), ARCH_X64);
    }

    #[test]
    fn option_value_all_selects_everything() {
        let all = option_value("all", PLATFORMS);
        assert_eq!(all, PLATFORM_WINDOWS | PLATFORM_MAC | PLATFORM_LINUX);
    }

    #[test]
    fn include_families_expand() {
        assert_eq!(option_value("i", INCLUDE_OPTIONS), INCLUDE_BASE_INSTALLER | INCLUDE_DLC_INSTALLER);
        assert_eq!(option_value("d", INCLUDE_OPTIONS), INCLUDE_DLC);
        assert_eq!(option_value("all", INCLUDE_OPTIONS), INCLUDE_ALL);
    }

    #[test]
    fn priority_preserves_order() {
        let prio = option_priority("fr,en", LANGUAGES);
        assert_eq!(prio, vec![LANGUAGE_FR, LANGUAGE_EN]);
    }

    #[test]
    fn exclude_subtracts_from_include() {
        let args = Args {
            include: "all".into(),
            exclude: "e".into(),
            ..Default::default()
        };
        let include = option_value(&args.include, INCLUDE_OPTIONS)
            & !option_value(&args.exclude, INCLUDE_OPTIONS);
        assert_eq!(include & INCLUDE_BASE_EXTRA, 0);
        assert_eq!(include & INCLUDE_DLC_EXTRA, 0);
        assert_ne!(include & INCLUDE_BASE_INSTALLER, 0);
    }

    #[test]
    fn galaxy_platform_names() {
        assert_eq!(galaxy_platform_name(PLATFORM_LINUX), "linux");
        assert_eq!(galaxy_platform_name(PLATFORM_MAC), "osx");
        assert_eq!(galaxy_platform_name(PLATFORM_WINDOWS), "windows");
    }
}
