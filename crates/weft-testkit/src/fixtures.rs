//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: deterministic identities,
//! pre-built covalue cores, and wired node pairs.

use weft_core::{
    AgentId, AgentSecret, CoValueCore, CoValueHeader, CoValueKind, MapOp, PrincipalId, Ruleset,
    SessionId, WritePrivacy,
};
use weft_node::LocalNode;
use weft_sync::{connected_peer_pair, PeerId, PeerRole};

/// A deterministic identity for multi-party tests.
pub struct TestParty {
    pub secret: AgentSecret,
    pub id: PrincipalId,
    pub session: SessionId,
}

/// Build a party from a single seed byte.
pub fn party(seed: u8) -> TestParty {
    let secret = AgentSecret::from_seed(&[seed; 32]);
    let id = PrincipalId::Agent(AgentId::of(&secret));
    let session = SessionId::with_nonce(id.clone(), [seed; 8]);
    TestParty { secret, id, session }
}

/// Several distinct parties.
pub fn parties(count: u8) -> Vec<TestParty> {
    (1..=count).map(party).collect()
}

/// A plain (unsafeAllowAll) map core with `count` numbered transactions.
pub fn plain_map_core(owner: &TestParty, count: usize) -> CoValueCore {
    let mut core = CoValueCore::new(CoValueHeader::new(
        CoValueKind::Map,
        Ruleset::UnsafeAllowAll,
        None,
        1,
    ));
    for n in 0..count {
        core.make_transaction(
            &owner.session,
            owner.secret.signer(),
            n as i64,
            vec![MapOp::set(format!("k{n}"), serde_json::json!(n))],
            WritePrivacy::Trusting,
        )
        .expect("local append cannot fail");
    }
    core
}

/// Wire two nodes together over crossed in-memory channels.
///
/// `server` sees `client` as a client peer and vice versa, matching a
/// browser-tab-to-sync-server topology.
pub async fn connect(client: &LocalNode, client_name: &str, server: &LocalNode, server_name: &str) {
    let (client_side, server_side) = connected_peer_pair(
        PeerId::new(client_name),
        PeerRole::Client,
        PeerId::new(server_name),
        PeerRole::Server,
    );
    client.add_peer(client_side).await;
    server.add_peer(server_side).await;
}

/// Give spawned peer loops a chance to drain their queues.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
