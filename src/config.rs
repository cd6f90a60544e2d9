//! # Configuration
//!
//! INI-syntax config file loading (§1, §6): `[Repository]`, `[Settings]`,
//! `[S3]`, `[SFTP]` sections. `REKKORD_CONFIG_FILE` overrides the default
//! search path. This module is a thin pass-through to the typed settings the
//! core (`store::`, `chunker::ChunkerParams`) consumes — it carries no
//! content-addressing logic of its own.

use std::env;
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::chunker::ChunkerParams;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum RepositoryUrl {
    Local(PathBuf),
    S3(String),
    Sftp(String),
}

impl RepositoryUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix("file://") {
            return Ok(RepositoryUrl::Local(PathBuf::from(rest)));
        }
        if let Some(rest) = raw.strip_prefix("s3:") {
            return Ok(RepositoryUrl::S3(rest.to_string()));
        }
        if raw.starts_with("ssh://") {
            return Ok(RepositoryUrl::Sftp(raw.to_string()));
        }
        if raw.starts_with('/') || raw.starts_with('.') {
            return Ok(RepositoryUrl::Local(PathBuf::from(raw)));
        }
        Err(Error::Config(format!("unrecognized repository url '{raw}'")))
    }
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub root: String,
    pub identity_file: String,
}

/// Plan-server coordinates for `AgentLoop` (§4.11), read from `[Link]`.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub url: String,
    pub api_key: String,
}

/// Everything the core needs to open a repository, outside of key material.
#[derive(Debug, Clone)]
pub struct Config {
    pub repository: RepositoryUrl,
    pub threads: Option<usize>,
    pub chunker: ChunkerParams,
    pub s3: Option<S3Settings>,
    pub sftp: Option<SftpSettings>,
    /// `[Protection] KeyFile` — where the repository's sealed key file
    /// lives on disk (§4.2, §6 key-file format).
    pub key_file: Option<PathBuf>,
    pub link: Option<LinkSettings>,
}

/// `REKKORD_CONFIG_FILE` env override, else the standard search path.
fn config_search_paths() -> Vec<PathBuf> {
    if let Ok(explicit) = env::var("REKKORD_CONFIG_FILE") {
        return vec![PathBuf::from(explicit)];
    }

    let mut paths = vec![PathBuf::from("/etc/rekkord.ini")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/rekkord.ini"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("rekkord.ini"));
    }
    paths.push(PathBuf::from("rekkord.ini"));
    paths
}

pub fn load_config() -> Result<Config> {
    let search = config_search_paths();
    for path in &search {
        if path.exists() {
            return load_config_from(path);
        }
    }
    Err(Error::not_found(format!(
        "no config file found; searched {}",
        search
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let ini = Ini::load_from_file(path)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

    let repository_raw = ini
        .section(Some("Repository"))
        .and_then(|s| s.get("Url"))
        .ok_or_else(|| Error::Config("[Repository] Url is required".into()))?;
    let repository = RepositoryUrl::parse(repository_raw)?;

    let threads = ini
        .section(Some("Settings"))
        .and_then(|s| s.get("Threads"))
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| Error::Config(format!("invalid Threads value '{v}'")))
        })
        .transpose()?;

    let chunker = parse_chunker(&ini)?;
    let s3 = parse_s3(&ini)?;
    let sftp = parse_sftp(&ini)?;
    let key_file = ini
        .section(Some("Protection"))
        .and_then(|s| s.get("KeyFile"))
        .map(PathBuf::from);
    let link = parse_link(&ini)?;

    validate(&repository, &s3, &sftp)?;

    Ok(Config {
        repository,
        threads,
        chunker,
        s3,
        sftp,
        key_file,
        link,
    })
}

fn parse_link(ini: &Ini) -> Result<Option<LinkSettings>> {
    let Some(section) = ini.section(Some("Link")) else {
        return Ok(None);
    };

    let url = section
        .get("Url")
        .map(str::to_string)
        .ok_or_else(|| Error::Config("[Link] Url is required".into()))?;
    let api_key = section
        .get("ApiKey")
        .map(str::to_string)
        .ok_or_else(|| Error::Config("[Link] ApiKey is required".into()))?;

    Ok(Some(LinkSettings { url, api_key }))
}

fn parse_chunker(ini: &Ini) -> Result<ChunkerParams> {
    let mut params = ChunkerParams::default();
    if let Some(section) = ini.section(Some("Settings")) {
        if let Some(v) = section.get("MinChunk") {
            params.min_chunk = parse_size(v)?;
        }
        if let Some(v) = section.get("AvgChunk") {
            params.avg_chunk = parse_size(v)?;
        }
        if let Some(v) = section.get("MaxChunk") {
            params.max_chunk = parse_size(v)?;
        }
    }
    Ok(params)
}

fn parse_size(raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|_| Error::Config(format!("invalid chunk size '{raw}'")))
}

fn parse_s3(ini: &Ini) -> Result<Option<S3Settings>> {
    let Some(section) = ini.section(Some("S3")) else {
        return Ok(None);
    };

    let get = |key: &str| -> Result<String> {
        section
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| Error::Config(format!("[S3] {key} is required")))
    };

    Ok(Some(S3Settings {
        endpoint: get("Endpoint")?,
        bucket: get("Bucket")?,
        region: section.get("Region").map(str::to_string),
        access_key: get("AccessKey")?,
        secret_key: get("SecretKey")?,
    }))
}

fn parse_sftp(ini: &Ini) -> Result<Option<SftpSettings>> {
    let Some(section) = ini.section(Some("SFTP")) else {
        return Ok(None);
    };

    let get = |key: &str| -> Result<String> {
        section
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| Error::Config(format!("[SFTP] {key} is required")))
    };

    let port = section
        .get("Port")
        .map(|v| v.parse::<u16>())
        .transpose()
        .map_err(|_| Error::Config("invalid [SFTP] Port".into()))?
        .unwrap_or(22);

    Ok(Some(SftpSettings {
        host: get("Host")?,
        port,
        user: get("User")?,
        root: get("Root")?,
        identity_file: get("IdentityFile")?,
    }))
}

fn validate(
    repository: &RepositoryUrl,
    s3: &Option<S3Settings>,
    sftp: &Option<SftpSettings>,
) -> Result<()> {
    match repository {
        RepositoryUrl::S3(_) if s3.is_none() => {
            Err(Error::Config("repository url is s3: but no [S3] section is configured".into()))
        }
        RepositoryUrl::Sftp(_) if sftp.is_none() => {
            Err(Error::Config("repository url is ssh:// but no [SFTP] section is configured".into()))
        }
        _ => Ok(()),
    }
}

/// Writes a template config at `path` with a local repository, matching the
/// minimal `BaseConfig` an operator edits by hand after `rekkord setup`.
pub fn init_config(path: &Path, repo_path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::Config(format!(
            "config file already exists: {}",
            path.display()
        )));
    }

    let mut ini = Ini::new();
    ini.with_section(Some("Repository"))
        .set("Url", format!("file://{}", repo_path.display()));
    ini.with_section(Some("Settings"))
        .set("Threads", "0")
        .set("MinChunk", "524288")
        .set("AvgChunk", "1048576")
        .set("MaxChunk", "8388608");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    ini.write_to_file(path)
        .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_url() {
        match RepositoryUrl::parse("file:///srv/repo").unwrap() {
            RepositoryUrl::Local(p) => assert_eq!(p, PathBuf::from("/srv/repo")),
            _ => panic!("expected local"),
        }
    }

    #[test]
    fn parses_s3_url() {
        assert!(matches!(
            RepositoryUrl::parse("s3:https://s3.example.com/bucket").unwrap(),
            RepositoryUrl::S3(_)
        ));
    }

    #[test]
    fn parses_ssh_url() {
        assert!(matches!(
            RepositoryUrl::parse("ssh://user@host/path").unwrap(),
            RepositoryUrl::Sftp(_)
        ));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(RepositoryUrl::parse("ftp://nope").is_err());
    }

    #[test]
    fn loads_minimal_ini() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rekkord.ini");
        init_config(&path, &dir.path().join("repo")).unwrap();
        let config = load_config_from(&path).unwrap();
        assert!(matches!(config.repository, RepositoryUrl::Local(_)));
        assert_eq!(config.chunker.avg_chunk, 1024 * 1024);
    }

    #[test]
    fn s3_url_without_section_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rekkord.ini");
        let mut ini = Ini::new();
        ini.with_section(Some("Repository"))
            .set("Url", "s3:https://example.com/bucket");
        ini.write_to_file(&path).unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
