//! SFTP-backed `ObjectStore`, backed by the `ssh2` crate (§6
//! `ssh://user@host/path`). A fresh session is opened per call; the core
//! doesn't keep long-lived connections alive across saves.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex;

use ssh2::Session;

use crate::config::SftpSettings;
use crate::error::{Error, Result};
use crate::store::ObjectStore;

pub struct SftpStore {
    settings: SftpSettings,
    session: Mutex<Session>,
}

impl SftpStore {
    pub fn new(settings: SftpSettings) -> Result<Self> {
        let session = connect(&settings)?;
        Ok(SftpStore {
            settings,
            session: Mutex::new(session),
        })
    }

    fn full_path(&self, path: &str) -> std::path::PathBuf {
        Path::new(&self.settings.root).join(path)
    }
}

fn connect(settings: &SftpSettings) -> Result<Session> {
    let tcp = TcpStream::connect((settings.host.as_str(), settings.port))
        .map_err(Error::Io)?;
    let mut session = Session::new().map_err(|e| Error::Config(format!("ssh session: {e}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

    session
        .userauth_pubkey_file(
            &settings.user,
            None,
            Path::new(&settings.identity_file),
            None,
        )
        .map_err(|e| Error::Auth(format!("ssh authentication failed: {e}")))?;

    Ok(session)
}

impl ObjectStore for SftpStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let session = self.session.lock().unwrap();
        let sftp = session
            .sftp()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            mkdir_p(&sftp, parent);
        }

        let mut remote = sftp
            .create(&full)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        remote.write_all(bytes)?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let session = self.session.lock().unwrap();
        let sftp = session
            .sftp()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        let mut remote = sftp.open(&self.full_path(path)).map_err(|e| {
            if e.to_string().contains("No such file") {
                Error::not_found(path)
            } else {
                Error::Io(std::io::Error::other(e.to_string()))
            }
        })?;

        let mut buf = Vec::new();
        remote.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let session = self.session.lock().unwrap();
        let sftp = session
            .sftp()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(sftp.stat(&self.full_path(path)).is_ok())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let session = self.session.lock().unwrap();
        let sftp = session
            .sftp()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        let mut out = Vec::new();
        list_recursive(&sftp, &self.full_path(prefix), &self.settings.root, &mut out);
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let session = self.session.lock().unwrap();
        let sftp = session
            .sftp()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        sftp.unlink(&self.full_path(path))
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
    }

    fn url(&self) -> String {
        format!(
            "ssh://{}@{}{}",
            self.settings.user, self.settings.host, self.settings.root
        )
    }
}

fn mkdir_p(sftp: &ssh2::Sftp, path: &Path) {
    let mut acc = std::path::PathBuf::new();
    for component in path.components() {
        acc.push(component);
        let _ = sftp.mkdir(&acc, 0o755);
    }
}

fn list_recursive(sftp: &ssh2::Sftp, dir: &Path, root: &str, out: &mut Vec<String>) {
    let Ok(entries) = sftp.readdir(dir) else {
        return;
    };
    for (path, stat) in entries {
        if stat.is_dir() {
            list_recursive(sftp, &path, root, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}
