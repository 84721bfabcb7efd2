//! Stream key layout: `{ns}:global`, `{ns}:threads:{thread}`, `{ns}:inbox:{agent}`.
//!
//! Thread and agent ids are free-form, so their segment is percent-encoded.
//! Plain ids (`[A-Za-z0-9._~-]`) appear unchanged.

use swarm_transport::StreamKey;
use urlencoding::encode;

use crate::domain::{AgentId, SwarmError, SwarmResult};

#[derive(Debug, Clone)]
pub struct StreamKeys {
    namespace: String,
}

impl StreamKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn global(&self) -> SwarmResult<StreamKey> {
        self.key(format!("{}:global", self.namespace))
    }

    pub fn thread(&self, thread_id: &str) -> SwarmResult<StreamKey> {
        self.key(format!("{}:threads:{}", self.namespace, encode(thread_id)))
    }

    pub fn inbox(&self, agent_id: &AgentId) -> SwarmResult<StreamKey> {
        self.key(format!("{}:inbox:{}", self.namespace, encode(agent_id.as_str())))
    }

    fn key(&self, raw: String) -> SwarmResult<StreamKey> {
        StreamKey::new(raw.clone()).map_err(|e| SwarmError::transport(raw, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = StreamKeys::new("swarm");
        assert_eq!(keys.global().unwrap().as_str(), "swarm:global");
        assert_eq!(keys.thread("t-1").unwrap().as_str(), "swarm:threads:t-1");
        assert_eq!(
            keys.inbox(&AgentId::from("agent-9")).unwrap().as_str(),
            "swarm:inbox:agent-9"
        );
    }

    #[test]
    fn free_form_ids_are_encoded() {
        let keys = StreamKeys::new("swarm");
        let thread = keys.thread("design review").unwrap();
        assert_eq!(thread.as_str(), "swarm:threads:design%20review");
        assert_eq!(
            urlencoding::decode(thread.as_str().trim_start_matches("swarm:threads:")).unwrap(),
            "design review"
        );

        // A separator inside an id cannot alias another stream family.
        let inbox = keys.inbox(&AgentId::from("a:b")).unwrap();
        assert_eq!(inbox.as_str(), "swarm:inbox:a%3Ab");
        assert_ne!(keys.thread("x").unwrap(), keys.thread("x ").unwrap());
    }
}
