//! Operation envelope shared by the worker pool, the transport sessions and
//! the plugin-side server.

use super::types::*;
use super::Driver;
use serde::{Deserialize, Serialize};

/// One driver call routed through a plugin's worker pool.
///
/// `set_secrets` is absent: it never reaches the plugin process and is
/// applied to the handle itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    Authorize(AuthorizeInput),
    FieldResolve(FieldResolveInput),
    InterfaceResolveType(InterfaceResolveTypeInput),
    ScalarParse(ScalarParseInput),
    ScalarSerialize(ScalarSerializeInput),
    UnionResolveType(UnionResolveTypeInput),
    Stream(StreamInput),
    SubscriptionConnection(SubscriptionConnectionInput),
    SubscriptionListen(SubscriptionListenInput),
}

#[derive(Debug)]
pub enum Response {
    Authorize(AuthorizeOutput),
    FieldResolve(FieldResolveOutput),
    InterfaceResolveType(InterfaceResolveTypeOutput),
    ScalarParse(ScalarParseOutput),
    ScalarSerialize(ScalarSerializeOutput),
    UnionResolveType(UnionResolveTypeOutput),
    Stream(StreamOutput),
    SubscriptionConnection(SubscriptionConnectionOutput),
    SubscriptionListen(SubscriptionListenOutput),
}

impl Request {
    /// Wire name of the operation.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Authorize(_) => "authorize",
            Request::FieldResolve(_) => "fieldResolve",
            Request::InterfaceResolveType(_) => "interfaceResolveType",
            Request::ScalarParse(_) => "scalarParse",
            Request::ScalarSerialize(_) => "scalarSerialize",
            Request::UnionResolveType(_) => "unionResolveType",
            Request::Stream(_) => "stream",
            Request::SubscriptionConnection(_) => "subscriptionConnection",
            Request::SubscriptionListen(_) => "subscriptionListen",
        }
    }

    /// Whether the plugin answers with a message stream instead of a
    /// single reply.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Request::Stream(_) | Request::SubscriptionListen(_))
    }

    /// Runs the request against an in-process driver.
    pub async fn execute(self, driver: &dyn Driver) -> Response {
        match self {
            Request::Authorize(input) => Response::Authorize(driver.authorize(input).await),
            Request::FieldResolve(input) => {
                Response::FieldResolve(driver.field_resolve(input).await)
            }
            Request::InterfaceResolveType(input) => {
                Response::InterfaceResolveType(driver.interface_resolve_type(input).await)
            }
            Request::ScalarParse(input) => Response::ScalarParse(driver.scalar_parse(input).await),
            Request::ScalarSerialize(input) => {
                Response::ScalarSerialize(driver.scalar_serialize(input).await)
            }
            Request::UnionResolveType(input) => {
                Response::UnionResolveType(driver.union_resolve_type(input).await)
            }
            Request::Stream(input) => Response::Stream(driver.stream(input).await),
            Request::SubscriptionConnection(input) => {
                Response::SubscriptionConnection(driver.subscription_connection(input).await)
            }
            Request::SubscriptionListen(input) => {
                Response::SubscriptionListen(driver.subscription_listen(input).await)
            }
        }
    }
}

impl Response {
    pub fn method(&self) -> &'static str {
        match self {
            Response::Authorize(_) => "authorize",
            Response::FieldResolve(_) => "fieldResolve",
            Response::InterfaceResolveType(_) => "interfaceResolveType",
            Response::ScalarParse(_) => "scalarParse",
            Response::ScalarSerialize(_) => "scalarSerialize",
            Response::UnionResolveType(_) => "unionResolveType",
            Response::Stream(_) => "stream",
            Response::SubscriptionConnection(_) => "subscriptionConnection",
            Response::SubscriptionListen(_) => "subscriptionListen",
        }
    }

    /// Decodes a single-reply result for `method`.
    ///
    /// Streaming methods are rejected here; their outputs are assembled by
    /// the session from the individual stream frames.
    pub fn decode(method: &str, result: serde_json::Value) -> Result<Self, serde_json::Error> {
        use serde::de::Error;

        Ok(match method {
            "authorize" => Response::Authorize(serde_json::from_value(result)?),
            "fieldResolve" => Response::FieldResolve(serde_json::from_value(result)?),
            "interfaceResolveType" => {
                Response::InterfaceResolveType(serde_json::from_value(result)?)
            }
            "scalarParse" => Response::ScalarParse(serde_json::from_value(result)?),
            "scalarSerialize" => Response::ScalarSerialize(serde_json::from_value(result)?),
            "unionResolveType" => Response::UnionResolveType(serde_json::from_value(result)?),
            "subscriptionConnection" => {
                Response::SubscriptionConnection(serde_json::from_value(result)?)
            }
            other => {
                return Err(serde_json::Error::custom(format!(
                    "method {other} has no single reply"
                )))
            }
        })
    }

    /// Encodes a single-reply result. `None` for streaming outputs.
    pub fn encode(&self) -> Option<Result<serde_json::Value, serde_json::Error>> {
        Some(match self {
            Response::Authorize(out) => serde_json::to_value(out),
            Response::FieldResolve(out) => serde_json::to_value(out),
            Response::InterfaceResolveType(out) => serde_json::to_value(out),
            Response::ScalarParse(out) => serde_json::to_value(out),
            Response::ScalarSerialize(out) => serde_json::to_value(out),
            Response::UnionResolveType(out) => serde_json::to_value(out),
            Response::SubscriptionConnection(out) => serde_json::to_value(out),
            Response::Stream(_) | Response::SubscriptionListen(_) => return None,
        })
    }
}

macro_rules! impl_from_response {
    ($($variant:ident => $output:ty),* $(,)?) => {
        $(
            impl TryFrom<Response> for $output {
                type Error = Response;

                fn try_from(response: Response) -> Result<Self, Response> {
                    match response {
                        Response::$variant(output) => Ok(output),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_from_response!(
    Authorize => AuthorizeOutput,
    FieldResolve => FieldResolveOutput,
    InterfaceResolveType => InterfaceResolveTypeOutput,
    ScalarParse => ScalarParseOutput,
    ScalarSerialize => ScalarSerializeOutput,
    UnionResolveType => UnionResolveTypeOutput,
    Stream => StreamOutput,
    SubscriptionConnection => SubscriptionConnectionOutput,
    SubscriptionListen => SubscriptionListenOutput,
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_method_and_params() {
        let request = Request::ScalarParse(ScalarParseInput {
            function: Function {
                name: "parseDate".to_string(),
            },
            value: json!("2020-01-01"),
        });
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "scalarParse");
        assert_eq!(value["params"]["function"]["name"], "parseDate");
        assert_eq!(request.method(), "scalarParse");

        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_decode_rejects_streaming_methods() {
        assert!(Response::decode("stream", json!({})).is_err());
        assert!(Response::decode("subscriptionListen", json!({})).is_err());
        assert!(Response::decode("unknown", json!({})).is_err());
    }

    #[test]
    fn test_mismatched_response_is_returned_back() {
        let response = Response::Authorize(AuthorizeOutput {
            response: true,
            error: None,
        });
        let err = FieldResolveOutput::try_from(response).unwrap_err();
        assert_eq!(err.method(), "authorize");
    }
}
