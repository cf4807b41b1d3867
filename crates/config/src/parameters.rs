//! Parameters for the data stream server.

use ds_types::{GroupId, PeerAddress};
use serde::{Deserialize, Serialize};
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tracing::info;

/// Operational parameters of a data stream server.
///
/// Every field has a default, so a config file only names what it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// The consensus group this server stores streams for.
    pub group_id: GroupId,
    /// Listen address for clients. Connections here run the primary role.
    pub client_address: SocketAddr,
    /// Listen address for packets forwarded by other primaries.
    pub peer_address: SocketAddr,
    /// Data stream addresses of the other group members.
    pub replicas: Vec<PeerAddress>,
    /// Largest accepted value of the 4-byte header length prefix.
    pub max_header_len: usize,
    /// Largest accepted data length of a single packet.
    pub max_data_len: u64,
    /// Deadline for each replica forward call.
    #[serde(with = "humantime_serde")]
    pub replica_timeout: Duration,
    /// Deadline for each consensus submission.
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,
    /// How many leader redirects a close may follow before failing.
    pub max_redirects: usize,
    /// Initial capacity of a connection's receive buffer.
    pub read_buffer_capacity: usize,
}

impl Parameters {
    /// Default upper bound on a header record.
    pub const DEFAULT_MAX_HEADER_LEN: usize = 1024;
    /// Default upper bound on one packet's data (64 MiB).
    pub const DEFAULT_MAX_DATA_LEN: u64 = 64 * 1024 * 1024;

    /// Log every parameter.
    pub fn tracing(&self) {
        info!("Data stream group id set to {}", self.group_id);
        info!("Client address set to {}", self.client_address);
        info!("Peer address set to {}", self.peer_address);
        info!("Replicas set to {:?}", self.replicas);
        info!("Max header length set to {} B", self.max_header_len);
        info!("Max data length set to {} B", self.max_data_len);
        info!("Replica timeout set to {} ms", self.replica_timeout.as_millis());
        info!("Commit timeout set to {} ms", self.commit_timeout.as_millis());
        info!("Max leader redirects set to {}", self.max_redirects);
        info!("Read buffer capacity set to {} B", self.read_buffer_capacity);
    }
}

impl Default for Parameters {
    fn default() -> Self {
        let localhost = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Self {
            group_id: GroupId::default(),
            client_address: localhost,
            peer_address: localhost,
            replicas: Vec::new(),
            max_header_len: Self::DEFAULT_MAX_HEADER_LEN,
            max_data_len: Self::DEFAULT_MAX_DATA_LEN,
            replica_timeout: Duration::from_secs(10),
            commit_timeout: Duration::from_secs(30),
            max_redirects: 5,
            read_buffer_capacity: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigTrait;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
group_id: "group-1"
replicas: ["127.0.0.1:7001", "127.0.0.1:7002"]
replica_timeout: 2s
max_redirects: 3
"#;
        let params: Parameters = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(params.group_id, GroupId::new("group-1"));
        assert_eq!(params.replicas.len(), 2);
        assert_eq!(params.replica_timeout, Duration::from_secs(2));
        assert_eq!(params.max_redirects, 3);
        assert_eq!(params.commit_timeout, Duration::from_secs(30));
        assert_eq!(params.max_header_len, Parameters::DEFAULT_MAX_HEADER_LEN);
    }

    #[test]
    fn test_store_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("parameters.yaml");
        let params = Parameters {
            group_id: GroupId::new("roundtrip"),
            commit_timeout: Duration::from_millis(1500),
            ..Default::default()
        };

        params.store_path(&path).expect("store");
        let loaded = Parameters::load_from_path(&path).expect("load");
        assert_eq!(loaded, params);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Parameters::load_from_path(dir.path().join("absent.yaml")).is_err());
    }
}
