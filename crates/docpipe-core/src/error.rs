//! Pipeline-fatal error types.
//!
//! Component-internal errors are logged and tolerated; only the failures
//! below escape to the embedder through `check_active`.

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("task store unreachable: {0}")]
    StoreUnavailable(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("component '{component}' failed: {message}")]
    ComponentFailed { component: String, message: String },

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    pub fn component(component: impl Into<String>, message: impl ToString) -> Self {
        Self::ComponentFailed {
            component: component.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_error_names_the_component() {
        let err = PipelineError::component("enqueuer", "no workers");
        assert_eq!(err.to_string(), "component 'enqueuer' failed: no workers");
    }
}
