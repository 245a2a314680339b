use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabricError>;

#[derive(Debug, Error)]
pub enum FabricError {
    /// Graph-store failure. `message` is safe to show to a client; the raw
    /// driver error has already been logged under the query name.
    #[error("graph query failed: {message}")]
    Graph { message: String, transient: bool },
    #[error("analytics query failed: {0}")]
    Columnar(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("deadline exceeded after {0:?}")]
    Deadline(Duration),
    #[error("configuration error: {0}")]
    Config(String),
}

impl FabricError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FabricError::Graph { transient: true, .. })
    }

    /// Message suitable for a response body. Driver errors keep their
    /// pre-stripped message; everything else uses the display form.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Translates a raw graph driver error into a user-safe message. Query text
/// and bolt-level detail never leave the process.
pub fn translate_graph_error(err: &neo4rs::Error) -> (String, bool) {
    let raw = err.to_string();
    let lowered = raw.to_lowercase();
    let transient = lowered.contains("timeout")
        || lowered.contains("timed out")
        || lowered.contains("connection reset")
        || lowered.contains("connection refused")
        || lowered.contains("session expired")
        || lowered.contains("serviceunavailable")
        || lowered.contains("broken pipe");
    let message = if transient {
        "topology store temporarily unavailable".to_string()
    } else if lowered.contains("authentication") {
        "topology store rejected credentials".to_string()
    } else {
        "topology query failed".to_string()
    };
    (message, transient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_flag_only_for_graph_errors() {
        let err = FabricError::Graph {
            message: "unreachable".into(),
            transient: true,
        };
        assert!(err.is_transient());
        assert!(!FabricError::Columnar("boom".into()).is_transient());
        assert!(!FabricError::NotFound("device").is_transient());
    }

    #[test]
    fn user_message_never_embeds_query_text() {
        let err = FabricError::Graph {
            message: "topology query failed".into(),
            transient: false,
        };
        assert!(!err.user_message().contains("MATCH"));
    }
}
