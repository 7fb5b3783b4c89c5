//! State shared by the listener, tap-sync and bootstrap

use chrono::{DateTime, Utc};

use crate::identity::NodeIdentity;
use crate::peer::{PeerDirectory, PeerRecord};
use crate::public_addr::{PublicAddressResolver, PublicAddresses};
use crate::store::PeerStore;

/// Everything a node needs to describe itself and reach its directory
#[derive(Debug)]
pub struct NodeContext {
    pub identity: NodeIdentity,
    /// Port advertised in the local record
    pub port: u16,
    pub store: PeerStore,
    pub public: PublicAddressResolver,
}

impl NodeContext {
    pub fn new(
        identity: NodeIdentity,
        port: u16,
        store: PeerStore,
        public: PublicAddressResolver,
    ) -> Self {
        Self {
            identity,
            port,
            store,
            public,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// The local record as of `now`, with current public addresses
    pub async fn self_record(&self, now: DateTime<Utc>) -> PeerRecord {
        let addrs = self.public.current().await;
        self.record_with(addrs, now)
    }

    fn record_with(&self, addrs: PublicAddresses, now: DateTime<Utc>) -> PeerRecord {
        let mut record = PeerRecord {
            node_id: self.identity.node_id.clone(),
            role: self.identity.role,
            ipv4: addrs.ipv4,
            ipv6: addrs.ipv6,
            port: self.port,
            last_seen: String::new(),
        };
        record.touch(now);
        record
    }

    /// Write a fresh local record into the store and return the result
    pub async fn refresh_self(&self) -> PeerDirectory {
        let record = self.self_record(Utc::now()).await;
        self.store
            .update(move |dir| {
                dir.upsert(record);
                dir.clone()
            })
            .await
    }

    /// Bump only the local record's `last_seen`, inserting it if missing
    ///
    /// Never waits on a public address lookup: a missing record is rebuilt
    /// from whatever addresses are already cached.
    pub async fn touch_self(&self) -> PeerDirectory {
        let now = Utc::now();
        let addrs = self
            .public
            .cached()
            .await
            .unwrap_or_else(PublicAddresses::unknown);
        let fallback = self.record_with(addrs, now);
        let node_id = self.identity.node_id.clone();
        self.store
            .update(move |dir| {
                match dir.get_mut(&node_id) {
                    Some(record) => record.touch(now),
                    None => {
                        dir.upsert(fallback);
                    }
                }
                dir.clone()
            })
            .await
    }

    /// Peers other than this node seen in the last hour
    pub async fn active_peer_count(&self) -> usize {
        self.store.active_peer_count(self.node_id()).await
    }
}
