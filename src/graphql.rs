//! GraphQL-over-HTTP wire types as they cross the transport boundary.
//!
//! The transport never parses, validates, or executes GraphQL documents; it
//! only carries requests to the [`Executor`](crate::Executor) and relays the
//! responses it yields. These types model exactly that surface.

use std::collections::BTreeMap;

use nonempty::{nonempty, NonEmpty};
use serde::{Deserialize, Serialize};

/// The request as we receive it from the client, before the query string is
/// parsed by the executor.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<BTreeMap<String, serde_json::Value>>,
}

/// A line/column pair pointing into the request document.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// A path segment is either a field name or an index into a list.
/// <https://spec.graphql.org/October2021/#sel-HAPHRPJABABEyoB>
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A GraphQL error as defined by the spec.
/// <https://spec.graphql.org/October2021/#sec-Errors.Error-result-format>
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GraphQLError {
    /// A string describing the error.
    pub message: String,
    /// Locations in the request document associated with the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    /// The path of the response field which experienced the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// Extensions to the error with additional information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQLError {
    /// An error carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

/// A single execution result payload.
///
/// Serialized as the payload of a `data`/`next` frame. The `errors` entry is
/// absent when no errors were raised.
/// <https://spec.graphql.org/October2021/#sec-Response-Format>
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Response {
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<NonEmpty<GraphQLError>>,
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    pub fn partial(data: serde_json::Value, errors: NonEmpty<GraphQLError>) -> Self {
        Self {
            data: Some(data),
            errors: Some(errors),
        }
    }

    pub fn error(error: GraphQLError) -> Self {
        Self {
            data: None,
            errors: Some(nonempty![error]),
        }
    }

    pub fn errors(errors: NonEmpty<GraphQLError>) -> Self {
        Self {
            data: None,
            errors: Some(errors),
        }
    }
}
