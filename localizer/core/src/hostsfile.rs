//! Block-scoped editing of the system hosts file.
//!
//! The editor owns a single section of the file, delimited by sentinel
//! comment lines. Everything outside that section is preserved byte-for-byte
//! on every save, so user edits and other tools' entries survive us.
//!
//! ```text
//! ###start-hostfile
//! ###{"blockName":"localizer","last_modified_at":"..."}
//! 127.0.0.2 api api.demo api.demo.svc api.demo.svc.cluster.local
//! ###end-hostfile
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marks the first line of the owned section.
pub const START_SENTINEL: &str = "###start-hostfile";
/// Marks the last line of the owned section.
pub const END_SENTINEL: &str = "###end-hostfile";

#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("'{0}' is not a valid dns name")]
    InvalidHostname(String),

    #[error("failed to parse hosts block metadata, is the file corrupted?")]
    CorruptMetadata(#[source] serde_json::Error),

    #[error("failed to read or write the hosts file")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    #[serde(rename = "blockName")]
    block_name: String,
    #[serde(rename = "last_modified_at")]
    last_modified: DateTime<Utc>,
}

/// An editor for one named block of a hosts file.
///
/// Two locks are involved: a content mutex guarding the in-memory entry map,
/// and a save mutex serializing file I/O so concurrent savers never
/// interleave writes. `save` only snapshots under the content lock, so edits
/// may continue while a previous save drains.
pub struct HostsFile {
    path: PathBuf,
    block_name: String,
    now: fn() -> DateTime<Utc>,
    entries: Mutex<BTreeMap<IpAddr, Vec<String>>>,
    save_lock: tokio::sync::Mutex<()>,
}

impl HostsFile {
    pub fn new(path: impl AsRef<Path>, block_name: impl Into<String>) -> Self {
        Self::with_clock(path, block_name, Utc::now)
    }

    /// Like [`HostsFile::new`] with an injectable clock, so tests can assert
    /// byte-exact output.
    pub fn with_clock(
        path: impl AsRef<Path>,
        block_name: impl Into<String>,
        now: fn() -> DateTime<Utc>,
    ) -> Self {
        let block_name = {
            let name = block_name.into();
            if name.is_empty() {
                "localizer".to_string()
            } else {
                name
            }
        };

        Self {
            path: path.as_ref().to_path_buf(),
            block_name,
            now,
            entries: Mutex::new(BTreeMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reads the backing file and loads the owned block into memory.
    pub async fn load(&self) -> Result<(), HostsError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        self.load_contents(&contents)
    }

    /// Parses `contents` and replaces the in-memory map with the entries of
    /// the owned block. Foreign blocks and out-of-block lines are ignored.
    pub fn load_contents(&self, contents: &str) -> Result<(), HostsError> {
        let mut parsed = BTreeMap::new();

        let mut lines = contents.split('\n');
        while let Some(line) = lines.next() {
            if first_token(line) != Some(START_SENTINEL) {
                continue;
            }

            let meta = parse_metadata(lines.next().unwrap_or_default())?;
            let ours = meta.block_name == self.block_name;

            for line in lines.by_ref() {
                if first_token(line) == Some(END_SENTINEL) {
                    break;
                }
                if !ours {
                    continue;
                }

                let mut chunks = line.split_whitespace();
                let Some(ip) = chunks.next().and_then(|c| c.parse::<IpAddr>().ok()) else {
                    continue;
                };
                let hosts: Vec<String> = chunks.map(str::to_string).collect();
                if hosts.is_empty() {
                    continue;
                }
                parsed.insert(ip, hosts);
            }
        }

        *self.entries.lock() = parsed;
        Ok(())
    }

    /// Maps `hostnames` to `ip`, replacing any prior entry for that address.
    ///
    /// Every hostname is validated first; an invalid name fails the whole
    /// call without mutating state.
    pub fn add_hosts(&self, ip: IpAddr, hostnames: &[String]) -> Result<(), HostsError> {
        for host in hostnames {
            if !is_dns_name(host) {
                return Err(HostsError::InvalidHostname(host.clone()));
            }
        }

        self.entries.lock().insert(ip, hostnames.to_vec());
        Ok(())
    }

    /// Drops the entry for `ip`, if any.
    pub fn remove_address(&self, ip: IpAddr) {
        self.entries.lock().remove(&ip);
    }

    /// Returns the hostnames currently mapped to `ip`.
    pub fn hostnames(&self, ip: IpAddr) -> Option<Vec<String>> {
        self.entries.lock().get(&ip).cloned()
    }

    /// Re-reads the backing file, replaces the owned block with freshly
    /// generated contents, and writes the result back. Lines outside the
    /// block are preserved verbatim; a file without the block gets one
    /// appended at the end.
    pub async fn save(&self) -> Result<(), HostsError> {
        let _io = self.save_lock.lock().await;

        // Re-read so edits made outside our block since load are kept.
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let merged = self.splice(&contents)?;
        tokio::fs::write(&self.path, merged).await?;
        Ok(())
    }

    /// Renders the full file contents with the owned block replaced.
    pub fn splice(&self, contents: &str) -> Result<String, HostsError> {
        let block = self.render_block();

        let mut out: Vec<String> = Vec::new();
        let mut wrote_block = false;

        let mut lines = contents.split('\n');
        while let Some(line) = lines.next() {
            if first_token(line) != Some(START_SENTINEL) {
                out.push(line.to_string());
                continue;
            }

            let meta_line = lines.next().unwrap_or_default();
            let meta = parse_metadata(meta_line)?;
            if meta.block_name != self.block_name {
                // A foreign block: copy it through untouched.
                out.push(line.to_string());
                out.push(meta_line.to_string());
                for line in lines.by_ref() {
                    out.push(line.to_string());
                    if first_token(line) == Some(END_SENTINEL) {
                        break;
                    }
                }
                continue;
            }

            // Replace our block, discarding its old contents.
            for line in lines.by_ref() {
                if first_token(line) == Some(END_SENTINEL) {
                    break;
                }
            }
            out.extend(block.iter().cloned());
            wrote_block = true;
        }

        if !wrote_block {
            // Keep a trailing newline trailing.
            let trailing_newline = matches!(out.last(), Some(last) if last.is_empty());
            if trailing_newline {
                out.pop();
            }
            out.extend(block.iter().cloned());
            if trailing_newline || contents.is_empty() {
                out.push(String::new());
            }
        }

        Ok(out.join("\n"))
    }

    /// Renders the owned block, one line per entry in ascending address
    /// order. The ordering is load-bearing: output must be deterministic.
    fn render_block(&self) -> Vec<String> {
        let metadata = Metadata {
            block_name: self.block_name.clone(),
            last_modified: (self.now)(),
        };
        let metadata =
            serde_json::to_string(&metadata).expect("hosts block metadata always serializes");

        let mut block = vec![START_SENTINEL.to_string(), format!("###{metadata}")];
        for (ip, hosts) in self.entries.lock().iter() {
            block.push(format!("{} {}", ip, hosts.join(" ")));
        }
        block.push(END_SENTINEL.to_string());
        block
    }
}

fn first_token(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

fn parse_metadata(line: &str) -> Result<Metadata, HostsError> {
    let raw = line.replacen("###", "", 1);
    serde_json::from_str(&raw).map_err(HostsError::CorruptMetadata)
}

/// Whether `name` is a syntactically valid DNS name.
pub fn is_dns_name(name: &str) -> bool {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    let label = LABEL
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap());

    !name.is_empty() && name.len() <= 253 && name.split('.').all(|part| label.is_match(part))
}
