//! A trivial key/value state machine, used the same way the teacher crate's
//! `memstore` uses its `ClientRequest`/`ClientResponse`/`MemStoreStateMachine`
//! trio: just enough application logic to exercise `apply`/`snapshot`/
//! `restore` in tests.

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use raft::storage::Fsm;
use raft::storage::FsmSnapshot;

/// The only command this demo state machine understands: set `key` to
/// `value`, returning whatever `key` previously held.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Response {
    pub previous: Option<String>,
}

/// An in-memory key/value store driven entirely through committed log
/// entries.
#[derive(Default)]
pub struct MemFsm {
    state: RwLock<std::collections::BTreeMap<String, String>>,
}

#[async_trait]
impl Fsm for MemFsm {
    type Response = Response;
    type Snapshot = MemFsmSnapshot;

    async fn apply(&self, data: &[u8]) -> Result<Self::Response> {
        let cmd: Command = serde_json::from_slice(data).context("decoding command")?;
        let previous = self.state.write().await.insert(cmd.key, cmd.value);
        Ok(Response { previous })
    }

    async fn snapshot(&self) -> Result<Self::Snapshot> {
        let data = serde_json::to_vec(&*self.state.read().await).context("encoding state machine snapshot")?;
        Ok(MemFsmSnapshot { data })
    }

    async fn restore(&self, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).await.context("reading snapshot")?;
        let restored = serde_json::from_slice(&buf).context("decoding state machine snapshot")?;
        *self.state.write().await = restored;
        Ok(())
    }
}

impl MemFsm {
    /// A point-in-time copy of the key/value map, for test assertions.
    pub async fn state(&self) -> std::collections::BTreeMap<String, String> {
        self.state.read().await.clone()
    }
}

/// A point-in-time copy of the key/value map, already serialized — taken
/// under the state machine's read lock so concurrent `apply` calls (there
/// are none, by contract, but future state machines may relax this) cannot
/// observe a torn snapshot.
pub struct MemFsmSnapshot {
    data: Vec<u8>,
}

#[async_trait]
impl FsmSnapshot for MemFsmSnapshot {
    async fn persist(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        sink.write_all(&self.data).await.context("writing snapshot bytes")
    }
}
