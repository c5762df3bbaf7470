//! Error types for tile reassembly.

use thiserror::Error;

/// Failures while rebuilding a page from its tile pyramid.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// No level between the ceiling and the floor served its first tile.
    #[error(
        "no tile found for {template} between levels {min_level} and {max_level}\n  \
         Suggestion: the page may not exist or the host changed its tile layout"
    )]
    LevelsExhausted {
        /// The descriptor's URL template.
        template: String,
        /// Lowest level tried.
        min_level: u32,
        /// Highest level tried.
        max_level: u32,
    },

    /// The caller cancelled the page.
    #[error("tile assembly cancelled")]
    Cancelled,

    /// None of the fetched tiles could be decoded.
    #[error("could not decode tiles for {template}: {message}")]
    Decode {
        /// The descriptor's URL template.
        template: String,
        /// Decoder message for the last failure.
        message: String,
    },

    /// The stitched canvas could not be encoded.
    #[error("could not encode stitched page: {message}")]
    Encode {
        /// Encoder message.
        message: String,
    },
}

impl TileError {
    #[must_use]
    pub fn decode(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            template: template.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }
}
