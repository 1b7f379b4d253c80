use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
