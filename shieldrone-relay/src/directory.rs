use crate::link::{LinkError, NodeSource};
use crate::models::RemoteNode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectoryError {
    #[error("node lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("node lookup failed: {0}")]
    Fault(#[from] LinkError),
}

/// Resolves the paired nodes reachable right now. Never cached.
#[derive(Clone)]
pub struct NodeDirectory {
    source: Arc<dyn NodeSource>,
    wait: Duration,
}

impl NodeDirectory {
    pub fn new(source: Arc<dyn NodeSource>, wait: Duration) -> Self {
        Self { source, wait }
    }

    /// An empty list is a valid answer, distinct from a timeout or a fault.
    pub async fn reachable_nodes(&self) -> Result<Vec<RemoteNode>, DirectoryError> {
        let nodes = match tokio::time::timeout(self.wait, self.source.connected_nodes()).await {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(e)) => {
                warn!("[directory] {}", e);
                return Err(DirectoryError::Fault(e));
            }
            Err(_) => {
                warn!("[directory] no answer within {:?}", self.wait);
                return Err(DirectoryError::Timeout(self.wait));
            }
        };

        let reachable: Vec<RemoteNode> = nodes.into_iter().filter(|n| n.reachable).collect();
        debug!("[directory] {} reachable node(s)", reachable.len());
        Ok(reachable)
    }
}
