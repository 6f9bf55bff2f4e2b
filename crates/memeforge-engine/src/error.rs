use thiserror::Error;

use crate::cache::CachedImage;

/// Missing or unusable configuration. Fatal: no meme can be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("missing credential {name}")]
    MissingCredential { name: &'static str },
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// The LLM could not turn the request into a plan. Callers recover with
/// the fallback plan.
#[derive(Debug, Error)]
pub enum InterpretationError {
    #[error("{provider} is not configured: {source}")]
    MissingCredential {
        provider: String,
        #[source]
        source: ConfigurationError,
    },
    #[error("{provider} request failed")]
    Transport {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{provider} returned an unusable plan: {reason}")]
    Malformed { provider: String, reason: String },
    #[error("no text provider named '{0}' is registered")]
    UnknownProvider(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Fewer images than panels requested. `images` holds what was found,
    /// in query order, and may be empty.
    #[error("retrieved {} of {requested} requested images", images.len())]
    Shortfall {
        requested: usize,
        images: Vec<CachedImage>,
        warnings: Vec<String>,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("image cache unavailable")]
    Cache(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("none of the {attempted} retrieved images could be decoded")]
    NoPanels { attempted: usize },
    #[error("failed encoding the composed meme")]
    Encode(#[source] anyhow::Error),
}

/// Fatal outcome of one meme request.
#[derive(Debug, Error)]
pub enum MemeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl MemeError {
    /// Short message shown to the chat user in place of a meme.
    pub fn friendly_message(&self) -> String {
        match self {
            MemeError::Configuration(err) => {
                format!("I can't make memes until I'm set up properly ({err}).")
            }
            MemeError::Retrieval(_) => {
                "I couldn't find a good image for your meme. Try a different subject or description!"
                    .to_string()
            }
            MemeError::Composition(_) => {
                "The images I found refused to become a meme. Try a simpler idea!".to_string()
            }
            MemeError::Io(_) => {
                "Oops! Something unexpected happened. Please try again with a simpler meme idea!"
                    .to_string()
            }
        }
    }
}
