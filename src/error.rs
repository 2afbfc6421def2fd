//! Error types for template expansion and MLLP transport.
//!
//! The codec itself still speaks `std::io::Error` (tokio's `Framed` needs that), everything
//! above it reports one of the enums below so a caller can tell "the template is broken"
//! apart from "the remote end is silent" apart from "the remote end replied with garbage".

use std::io;
use std::time::Duration;
use thiserror::Error;

/// A template could not be expanded. Expansion never yields partial output alongside one of these.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The document isn't valid JSON, or a key has the wrong JSON type
    #[error("Malformed template document: {0}")]
    Json(#[from] serde_json::Error),

    /// The template file couldn't be found on any search directory, or couldn't be read
    #[error("Unable to load template '{name}': {reason}")]
    NotFound { name: String, reason: String },

    #[error("Template is missing a valid integer 'argCount'")]
    MissingArgCount,

    #[error("Template expects {expected} argument(s) but {supplied} were supplied")]
    ArgumentCount { expected: usize, supplied: usize },

    #[error("Template defines no segments")]
    NoSegments,

    #[error("Segment {index} is missing its 'name'")]
    MissingSegmentName { index: usize },

    #[error("Segment '{segment}' is missing its 'fieldCount'")]
    MissingFieldCount { segment: String },

    /// A field addresses a position beyond what the segment declared
    #[error("Segment '{segment}' declares {field_count} field(s) but field id {id} lies beyond that")]
    FieldOutOfRange {
        segment: String,
        field_count: usize,
        id: usize,
    },

    /// Field (or subfield) ids must be strictly ascending so that gaps can be padded
    #[error("Segment '{segment}' field id {id} is out of order (previous id was {previous})")]
    FieldOrder {
        segment: String,
        id: usize,
        previous: usize,
    },

    #[error("Segment '{segment}' nests subfields deeper than {max_depth} levels")]
    SubfieldDepth { segment: String, max_depth: usize },

    #[error("Invalid repeat policy on MSH: {0}")]
    Repeat(String),

    /// `$VARk` with k outside 1..=argCount
    #[error("Argument reference $VAR{index} is outside the {supplied} supplied argument(s)")]
    ArgumentIndex { index: usize, supplied: usize },

    #[error(transparent)]
    Directive(#[from] DirectiveError),
}

/// A single variable directive is missing parameters or refers to something unusable.
#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("{directive} requires the '{parameter}' parameter")]
    MissingParameter {
        directive: &'static str,
        parameter: &'static str,
    },

    #[error("{directive} parameter '{parameter}' is invalid: {reason}")]
    InvalidParameter {
        directive: &'static str,
        parameter: &'static str,
        reason: String,
    },

    #[error("Unable to read data file '{path}': {source}")]
    DataFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Data file '{path}' contains no lines")]
    EmptyDataFile { path: String },
}

/// Sending or receiving over MLLP failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Resolution or connect failed, nothing was sent. Never retried automatically.
    #[error("Unable to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// The message went out but nothing came back in time; it's unacknowledged, not un-sent
    #[error("No acknowledgement received within {0:?}")]
    AckTimeout(Duration),

    /// Something came back, but it didn't carry a recognisable two character ack code
    #[error("Unrecognised acknowledgement: {0}")]
    AckParse(String),

    #[error("Nothing to send, the payload holds no message")]
    EmptyPayload,

    #[error("Connection closed by peer before an acknowledgement arrived")]
    ConnectionClosed,

    #[error("Listener failed: {0}")]
    Accept(#[source] io::Error),

    #[error("I/O error on MLLP transport: {0}")]
    Io(#[from] io::Error),
}

/// The settings file exists but couldn't be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
