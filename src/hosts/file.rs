//! Hosts file persistence.
//!
//! The pool is stored as versioned JSON and replaced atomically on save
//! (write to a temporary file, then rename).

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{P2pError, P2pResult};
use crate::wire::NetworkAddress;

/// Current hosts file format version.
const FORMAT_VERSION: u32 = 1;

/// On-disk form of the host pool.
#[derive(Debug, Serialize, Deserialize)]
struct HostsFile {
    version: u32,
    hosts: Vec<HostRecord>,
}

/// One persisted address record.
#[derive(Debug, Serialize, Deserialize)]
struct HostRecord {
    ip: IpAddr,
    port: u16,
    services: u64,
    timestamp: u32,
}

impl From<&NetworkAddress> for HostRecord {
    fn from(addr: &NetworkAddress) -> Self {
        Self {
            ip: addr.ip,
            port: addr.port,
            services: addr.services,
            timestamp: addr.timestamp,
        }
    }
}

impl From<HostRecord> for NetworkAddress {
    fn from(record: HostRecord) -> Self {
        Self {
            ip: record.ip,
            port: record.port,
            services: record.services,
            timestamp: record.timestamp,
        }
    }
}

/// Read the persisted address list. A missing file reads as empty.
pub async fn load(path: &Path) -> P2pResult<Vec<NetworkAddress>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(path).await?;
    let file: HostsFile = serde_json::from_str(&contents)
        .map_err(|e| P2pError::FileSystem(format!("malformed hosts file: {}", e)))?;

    if file.version != FORMAT_VERSION {
        return Err(P2pError::FileSystem(format!(
            "unsupported hosts file version {}",
            file.version
        )));
    }

    Ok(file.hosts.into_iter().map(NetworkAddress::from).collect())
}

/// Write the address list, replacing the file atomically.
pub async fn save(path: &Path, addrs: &[NetworkAddress]) -> P2pResult<()> {
    let file = HostsFile {
        version: FORMAT_VERSION,
        hosts: addrs.iter().map(HostRecord::from).collect(),
    };
    let contents = serde_json::to_string_pretty(&file)
        .map_err(|e| P2pError::FileSystem(format!("encoding hosts file: {}", e)))?;

    let temp_path = path.with_extension("tmp");
    let mut temp = fs::File::create(&temp_path).await?;
    temp.write_all(contents.as_bytes()).await?;
    temp.sync_all().await?;
    drop(temp);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn addr(s: &str, timestamp: u32) -> NetworkAddress {
        let socket: std::net::SocketAddr = s.parse().unwrap();
        let mut addr = NetworkAddress::from_socket(socket, 1);
        addr.timestamp = timestamp;
        addr
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.json");

        let original = vec![
            addr("203.0.113.1:7333", 100),
            addr("[2001:db8::1]:7333", 200),
        ];
        save(&path, &original).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded[1].timestamp, 200);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let loaded = load(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            load(&path).await,
            Err(P2pError::FileSystem(_))
        ));
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.json");

        save(&path, &[addr("203.0.113.1:7333", 1)]).await.unwrap();
        save(&path, &[addr("203.0.113.2:7333", 2)]).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].port, 7333);
        assert_eq!(loaded[0].ip, "203.0.113.2".parse::<IpAddr>().unwrap());
    }
}
