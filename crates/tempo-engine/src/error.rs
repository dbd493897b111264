use tempo_core::store::StoreError;

/// The closed error taxonomy surfaced to callers of the engine.
///
/// Validation and illegal-transition failures carry user-facing messages;
/// storage failures wrap the underlying error. LLM failures never appear
/// here; they are absorbed by fallbacks inside the components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    IllegalTransition(String),
    #[error("task {0} not found")]
    NotFound(i64),
    #[error("task was deleted by another session")]
    Gone,
    #[error("storage failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Gone => EngineError::Gone,
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyCompleted { .. }
            | StoreError::ActiveConflict { .. }
            | StoreError::NotStarted { .. } => EngineError::IllegalTransition(err.to_string()),
            StoreError::Db(_) => EngineError::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_keep_their_message() {
        let err: EngineError = StoreError::ActiveConflict {
            active_title: "deep work".into(),
        }
        .into();
        match &err {
            EngineError::IllegalTransition(msg) => assert!(msg.contains("deep work")),
            other => panic!("expected IllegalTransition, got {other:?}"),
        }
    }

    #[test]
    fn gone_maps_to_gone() {
        assert!(matches!(
            EngineError::from(StoreError::Gone),
            EngineError::Gone
        ));
    }
}
