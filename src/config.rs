use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::reconcile::SyncMode;

pub const DATABASE_FILE_NAME: &str = "haunted-housewarming.db";

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackend {
    /// Keep uploads as data URLs inside the records.
    Inline,
    /// Write uploads under `<data-dir>/blobs` and serve them through signed URLs.
    Disk,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "housewarming",
    about = "Housewarming fundraiser backend: funds, pledges, guestbook and gallery",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server (default).
    Run,

    /// Create the data directory and database, and seed the default funds.
    Init,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "HOST",
        value_name = "HOST",
        default_value = "127.0.0.1"
    )]
    pub host: String,

    #[arg(
        long,
        global = true,
        env = "PORT",
        value_name = "PORT",
        default_value_t = 3000
    )]
    pub port: u16,

    #[arg(
        long = "api-prefix",
        global = true,
        env = "API_PREFIX",
        value_name = "PATH",
        default_value = "/api",
        value_parser = parse_api_prefix
    )]
    pub api_prefix: String,

    #[arg(
        long = "venmo-username",
        global = true,
        env = "VENMO_USERNAME",
        value_name = "NAME",
        default_value = "Anibee-Zingalis"
    )]
    pub venmo_username: String,

    #[arg(
        long,
        global = true,
        env = "DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Defaults to `<data-dir>/haunted-housewarming.db`.
    #[arg(long, global = true, env = "DATABASE_PATH", value_name = "PATH")]
    pub database_path: Option<PathBuf>,

    /// Allowed browser origin; CORS stays off when empty.
    #[arg(
        long = "cors-origin",
        global = true,
        env = "CORS_ORIGIN",
        value_name = "ORIGIN",
        default_value = ""
    )]
    pub cors_origin: String,

    #[arg(
        long = "sync-mode",
        global = true,
        env = "SYNC_MODE",
        value_name = "MODE",
        default_value = "remote-required",
        value_enum
    )]
    pub sync_mode: SyncMode,

    /// Upstream record API base URL. When empty, SQLite is the durable backend.
    #[arg(
        long = "upstream-url",
        global = true,
        env = "UPSTREAM_URL",
        value_name = "URL",
        default_value = ""
    )]
    pub upstream_url: String,

    #[arg(
        long = "upstream-api-key",
        global = true,
        env = "UPSTREAM_API_KEY",
        value_name = "KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub upstream_api_key: String,

    #[arg(
        long = "upstream-timeout-ms",
        global = true,
        env = "UPSTREAM_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(100..=60000)
    )]
    pub upstream_timeout_ms: u64,

    /// Static gallery manifest merged into gallery reads in `remote-with-seed` mode.
    #[arg(
        long = "gallery-manifest",
        global = true,
        env = "GALLERY_MANIFEST",
        value_name = "PATH"
    )]
    pub gallery_manifest: Option<PathBuf>,

    #[arg(
        long = "blob-backend",
        global = true,
        env = "BLOB_BACKEND",
        value_name = "BACKEND",
        default_value = "disk",
        value_enum
    )]
    pub blob_backend: BlobBackend,

    /// HMAC key for signed blob URLs. A random key is used per process when empty.
    #[arg(
        long = "blob-signing-key",
        global = true,
        env = "BLOB_SIGNING_KEY",
        value_name = "KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub blob_signing_key: String,

    #[arg(
        long = "signed-url-ttl-secs",
        global = true,
        env = "SIGNED_URL_TTL_SECS",
        value_name = "SECS",
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(60..=86400)
    )]
    pub signed_url_ttl_secs: u64,

    /// Origin prepended to signed blob URLs; relative URLs when empty.
    #[arg(
        long = "public-base-url",
        global = true,
        env = "PUBLIC_BASE_URL",
        value_name = "ORIGIN",
        default_value = ""
    )]
    pub public_base_url: String,
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DATABASE_FILE_NAME))
    }

    pub fn upstream_url(&self) -> Option<&str> {
        Some(self.upstream_url.trim()).filter(|u| !u.is_empty())
    }

    pub fn upstream_api_key(&self) -> Option<String> {
        Some(self.upstream_api_key.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    pub fn cors_origin(&self) -> Option<&str> {
        Some(self.cors_origin.trim()).filter(|o| !o.is_empty())
    }

    /// Base for blob URLs: public origin (possibly empty) followed by the API prefix.
    pub fn blob_url_base(&self) -> String {
        format!(
            "{}{}",
            self.public_base_url.trim().trim_end_matches('/'),
            self.api_prefix
        )
    }
}

/// `/api`, `api/` and `/api/` all normalize to `/api`; `/` alone means no prefix.
fn parse_api_prefix(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.contains(['?', '#', ' ', '*', ':']) {
        return Err(format!("invalid api prefix: {raw:?}"));
    }
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    Ok(format!("/{trimmed}"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["housewarming"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.api_prefix, "/api");
        assert_eq!(cli.config.venmo_username, "Anibee-Zingalis");
        assert_eq!(cli.config.sync_mode, SyncMode::RemoteRequired);
        assert_eq!(cli.config.upstream_timeout_ms, 5000);
        assert_eq!(cli.config.blob_backend, BlobBackend::Disk);
        assert_eq!(cli.config.signed_url_ttl_secs, 3600);
        assert_eq!(cli.config.upstream_url(), None);
        assert_eq!(cli.config.cors_origin(), None);
    }

    #[test]
    fn database_path_defaults_under_data_dir() {
        let cli = Cli::try_parse_from(["housewarming", "--data-dir", "/srv/party"]).unwrap();
        assert_eq!(
            cli.config.database_path(),
            PathBuf::from("/srv/party/haunted-housewarming.db")
        );

        let cli = Cli::try_parse_from([
            "housewarming",
            "--data-dir",
            "/srv/party",
            "--database-path",
            "/tmp/x.db",
        ])
        .unwrap();
        assert_eq!(cli.config.database_path(), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn parses_sync_modes() {
        for (raw, mode) in [
            ("local-only", SyncMode::LocalOnly),
            ("remote-required", SyncMode::RemoteRequired),
            ("remote-with-seed", SyncMode::RemoteWithSeed),
        ] {
            let cli = Cli::try_parse_from(["housewarming", "--sync-mode", raw]).unwrap();
            assert_eq!(cli.config.sync_mode, mode);
        }
        assert!(Cli::try_parse_from(["housewarming", "--sync-mode", "both"]).is_err());
    }

    #[test]
    fn normalizes_api_prefix() {
        for (raw, want) in [("/api/", "/api"), ("v1", "/v1"), ("/", "")] {
            let cli = Cli::try_parse_from(["housewarming", "--api-prefix", raw]).unwrap();
            assert_eq!(cli.config.api_prefix, want);
        }
        assert!(Cli::try_parse_from(["housewarming", "--api-prefix", "/a?b"]).is_err());
    }

    #[test]
    fn rejects_invalid_upstream_timeout_ms() {
        let err = Cli::try_parse_from(["housewarming", "--upstream-timeout-ms", "10"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--upstream-timeout-ms"));
        assert!(msg.contains("100..=60000"));
    }

    #[test]
    fn rejects_invalid_signed_url_ttl_secs() {
        let err = Cli::try_parse_from(["housewarming", "--signed-url-ttl-secs", "5"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--signed-url-ttl-secs"));
        assert!(msg.contains("60..=86400"));
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["housewarming", "init", "--data-dir", "/tmp/hw"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Init)));
        assert_eq!(cli.config.data_dir, PathBuf::from("/tmp/hw"));
    }

    #[test]
    fn blob_url_base_joins_origin_and_prefix() {
        let cli = Cli::try_parse_from([
            "housewarming",
            "--public-base-url",
            "https://party.example/",
        ])
        .unwrap();
        assert_eq!(cli.config.blob_url_base(), "https://party.example/api");
    }
}
