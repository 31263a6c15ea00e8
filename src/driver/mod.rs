//! Driver capability interface
//!
//! A [`Driver`] implements the resolution operations the GraphQL router
//! needs. Plugin-backed drivers ([`crate::plugin::Plugin`]) and in-process
//! ones satisfy the same contract. No method returns a `Result`: failures
//! are reported through the `error` field of each output so the router
//! always receives a well-formed value.

use async_trait::async_trait;

pub mod registry;
pub mod request;
pub mod types;

pub use registry::{DriverConfig, Registry};
pub use request::{Request, Response};
pub use types::*;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Runs custom authorization code for an operation.
    async fn authorize(&self, input: AuthorizeInput) -> AuthorizeOutput;

    /// Passes user secrets to the runtime.
    async fn set_secrets(&self, input: SetSecretsInput) -> SetSecretsOutput;

    async fn field_resolve(&self, input: FieldResolveInput) -> FieldResolveOutput;

    async fn interface_resolve_type(
        &self,
        input: InterfaceResolveTypeInput,
    ) -> InterfaceResolveTypeOutput;

    async fn scalar_parse(&self, input: ScalarParseInput) -> ScalarParseOutput;

    async fn scalar_serialize(&self, input: ScalarSerializeInput) -> ScalarSerializeOutput;

    async fn union_resolve_type(&self, input: UnionResolveTypeInput) -> UnionResolveTypeOutput;

    /// Opens a message stream between router and runner.
    async fn stream(&self, input: StreamInput) -> StreamOutput;

    /// Builds the connection payload for a subscription.
    async fn subscription_connection(
        &self,
        input: SubscriptionConnectionInput,
    ) -> SubscriptionConnectionOutput;

    /// Listens for events that trigger a subscription.
    async fn subscription_listen(&self, input: SubscriptionListenInput)
        -> SubscriptionListenOutput;
}
