//! Reference driver plugin.
//!
//! Serves `local/echo` by reflecting its inputs back. A few function names
//! trigger special behavior so the host can be exercised end to end:
//! `env` reads a variable from the plugin's environment, `fail` returns a
//! driver error and `log` writes through the plugin logger.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use stucco_host::driver::*;
use stucco_host::plugin::{PluginLogger, Server};

const MAX_STREAM_COUNT: u64 = 1000;

struct EchoDriver {
    logger: PluginLogger,
}

impl EchoDriver {
    fn type_name(value: Option<&Value>) -> Result<TypeRef, DriverError> {
        value
            .and_then(|v| v.get("__typename"))
            .and_then(Value::as_str)
            .map(TypeRef::named)
            .ok_or_else(|| DriverError::new("value has no __typename"))
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn authorize(&self, input: AuthorizeInput) -> AuthorizeOutput {
        AuthorizeOutput {
            response: input.function.name != "deny",
            error: None,
        }
    }

    async fn set_secrets(&self, _input: SetSecretsInput) -> SetSecretsOutput {
        // Secrets arrive through the environment at spawn time.
        SetSecretsOutput::default()
    }

    async fn field_resolve(&self, input: FieldResolveInput) -> FieldResolveOutput {
        match input.function.name.as_str() {
            "" => FieldResolveOutput::default(),
            "env" => {
                let name = input
                    .arguments
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match std::env::var(name) {
                    Ok(value) => FieldResolveOutput {
                        response: Some(json!(value)),
                        error: None,
                    },
                    Err(_) => FieldResolveOutput::with_error(DriverError::new(format!(
                        "{name} is not set"
                    ))),
                }
            }
            "fail" => FieldResolveOutput::with_error(DriverError::new("echo: resolver failed")),
            "log" => {
                let line = input
                    .arguments
                    .get("line")
                    .and_then(Value::as_str)
                    .unwrap_or("hello from echo");
                self.logger.stderr(line);
                FieldResolveOutput {
                    response: Some(json!(true)),
                    error: None,
                }
            }
            name => FieldResolveOutput {
                response: Some(json!({
                    "function": name,
                    "arguments": input.arguments,
                    "source": input.source,
                })),
                error: None,
            },
        }
    }

    async fn interface_resolve_type(
        &self,
        input: InterfaceResolveTypeInput,
    ) -> InterfaceResolveTypeOutput {
        match Self::type_name(input.value.as_ref()) {
            Ok(type_ref) => InterfaceResolveTypeOutput {
                type_ref,
                error: None,
            },
            Err(e) => InterfaceResolveTypeOutput::with_error(e),
        }
    }

    async fn scalar_parse(&self, input: ScalarParseInput) -> ScalarParseOutput {
        ScalarParseOutput {
            response: Some(input.value),
            error: None,
        }
    }

    async fn scalar_serialize(&self, input: ScalarSerializeInput) -> ScalarSerializeOutput {
        ScalarSerializeOutput {
            response: Some(input.value),
            error: None,
        }
    }

    async fn union_resolve_type(&self, input: UnionResolveTypeInput) -> UnionResolveTypeOutput {
        match Self::type_name(input.value.as_ref()) {
            Ok(type_ref) => UnionResolveTypeOutput {
                type_ref,
                error: None,
            },
            Err(e) => UnionResolveTypeOutput::with_error(e),
        }
    }

    async fn stream(&self, input: StreamInput) -> StreamOutput {
        let count = input
            .arguments
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(3);
        if count > MAX_STREAM_COUNT {
            return StreamOutput::with_error(DriverError::new(format!(
                "count must not exceed {MAX_STREAM_COUNT}"
            )));
        }

        let (tx, reader) = StreamReader::channel(16);
        tokio::spawn(async move {
            for i in 0..count {
                let message = StreamMessage {
                    response: Some(json!({ "seq": i })),
                    error: None,
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        });
        StreamOutput {
            error: None,
            reader: Some(reader),
        }
    }

    async fn subscription_connection(
        &self,
        input: SubscriptionConnectionInput,
    ) -> SubscriptionConnectionOutput {
        SubscriptionConnectionOutput {
            response: Some(json!({
                "query": input.query,
                "operationName": input.operation_name,
            })),
            error: None,
        }
    }

    async fn subscription_listen(&self, input: SubscriptionListenInput) -> SubscriptionListenOutput {
        let (tx, reader) = SubscriptionListenReader::channel(4);
        let operation = input.operation_name;
        tokio::spawn(async move {
            for i in 0..3 {
                let event = json!({ "operation": operation, "event": i });
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        SubscriptionListenOutput {
            error: None,
            reader: Some(reader),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the handshake line
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let logger = PluginLogger::new();
    let driver = EchoDriver {
        logger: logger.clone(),
    };

    Server::new(driver)
        .config(DriverConfig::new("local", "echo"))
        .logger(logger)
        .run()
        .await?;
    Ok(())
}
