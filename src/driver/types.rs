//! Input and output types of the driver operations
//!
//! Every output carries an optional [`DriverError`]. Values the engine does
//! not interpret (sources, arguments, responses) stay as `serde_json::Value`.

use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type Arguments = Map<String, Value>;
pub type Secrets = HashMap<String, String>;

/// Message-only error returned inside an operation output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<PluginError> for DriverError {
    fn from(err: PluginError) -> Self {
        Self::new(err.to_string())
    }
}

/// Reference to the user function that implements a resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_null: Option<Box<TypeRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Box<TypeRef>>,
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePath {
    #[serde(
        default,
        rename = "responsePath",
        skip_serializing_if = "Option::is_none"
    )]
    pub prev: Option<Box<ResponsePath>>,
    pub key: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDefinition {
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Query state shared by the type-resolution and stream operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveInfo {
    #[serde(default)]
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ResponsePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_values: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldResolveInfo {
    #[serde(flatten)]
    pub resolve: ResolveInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_values: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeOutput {
    #[serde(default)]
    pub response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetSecretsInput {
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetSecretsOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldResolveInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub arguments: Arguments,
    #[serde(default)]
    pub info: FieldResolveInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldResolveOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceResolveTypeInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub info: ResolveInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceResolveTypeOutput {
    #[serde(default, rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarParseInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarParseOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarSerializeInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarSerializeOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnionResolveTypeInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub info: ResolveInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnionResolveTypeOutput {
    #[serde(default, rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub arguments: Arguments,
    #[serde(default)]
    pub info: ResolveInfo,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub secrets: Secrets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
}

/// One message pushed by a plugin on an open stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Default)]
pub struct StreamOutput {
    pub error: Option<DriverError>,
    pub reader: Option<StreamReader>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConnectionInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_values: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConnectionOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionListenInput {
    #[serde(default)]
    pub function: Function,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_values: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationDefinition>,
}

#[derive(Debug, Default)]
pub struct SubscriptionListenOutput {
    pub error: Option<DriverError>,
    pub reader: Option<SubscriptionListenReader>,
}

pub type StreamReader = Reader<StreamMessage>;
pub type SubscriptionListenReader = Reader<Value>;

/// Receiving end of a message stream opened by a plugin.
///
/// `next` yields `None` once the plugin closes the stream cleanly; a
/// terminal failure arrives as a final `Err` item.
pub struct Reader<T> {
    rx: mpsc::Receiver<Result<T, DriverError>>,
}

impl<T> Reader<T> {
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<T, DriverError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<Result<T, DriverError>> {
        self.rx.recv().await
    }

    /// Stops accepting new messages. Buffered ones can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn into_stream(self) -> ReceiverStream<Result<T, DriverError>> {
        ReceiverStream::new(self.rx)
    }
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("closed", &self.rx.is_closed())
            .finish()
    }
}

/// Outputs that can be produced from an error alone.
pub trait WithError: Default {
    fn with_error(error: DriverError) -> Self;
}

macro_rules! impl_with_error {
    ($($output:ty),* $(,)?) => {
        $(
            impl WithError for $output {
                fn with_error(error: DriverError) -> Self {
                    Self {
                        error: Some(error),
                        ..Default::default()
                    }
                }
            }
        )*
    };
}

impl_with_error!(
    AuthorizeOutput,
    SetSecretsOutput,
    FieldResolveOutput,
    InterfaceResolveTypeOutput,
    ScalarParseOutput,
    ScalarSerializeOutput,
    UnionResolveTypeOutput,
    StreamOutput,
    SubscriptionConnectionOutput,
    SubscriptionListenOutput,
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_resolve_input_wire_names() {
        let input = FieldResolveInput {
            function: Function {
                name: "resolver".to_string(),
            },
            arguments: json!({"id": 1}).as_object().cloned().unwrap(),
            info: FieldResolveInfo {
                resolve: ResolveInfo {
                    field_name: "hero".to_string(),
                    return_type: Some(TypeRef {
                        non_null: Some(Box::new(TypeRef::named("Hero"))),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                root_value: Some(json!({"root": true})),
            },
            ..Default::default()
        };

        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["function"]["name"], "resolver");
        assert_eq!(value["info"]["fieldName"], "hero");
        assert_eq!(value["info"]["returnType"]["nonNull"]["name"], "Hero");
        assert_eq!(value["info"]["rootValue"]["root"], true);
        assert!(value.get("source").is_none());
    }

    #[test]
    fn test_type_output_uses_type_key() {
        let output: InterfaceResolveTypeOutput =
            serde_json::from_value(json!({"type": {"name": "Droid"}})).unwrap();
        assert_eq!(output.type_ref, TypeRef::named("Droid"));
        assert!(output.error.is_none());
    }

    #[test]
    fn test_with_error_keeps_other_fields_default() {
        let output = FieldResolveOutput::with_error(DriverError::new("boom"));
        assert_eq!(output.response, None);
        assert_eq!(output.error.unwrap().message, "boom");

        let output = StreamOutput::with_error(DriverError::new("closed"));
        assert!(output.reader.is_none());
    }

    #[tokio::test]
    async fn test_reader_yields_until_sender_dropped() {
        let (tx, mut reader) = StreamReader::channel(4);
        tx.send(Ok(StreamMessage {
            response: Some(json!(1)),
            error: None,
        }))
        .await
        .unwrap();
        tx.send(Err(DriverError::new("eof"))).await.unwrap();
        drop(tx);

        assert_eq!(reader.next().await.unwrap().unwrap().response, Some(json!(1)));
        assert_eq!(reader.next().await.unwrap().unwrap_err().message, "eof");
        assert!(reader.next().await.is_none());
    }
}
