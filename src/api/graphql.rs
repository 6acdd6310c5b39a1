use async_graphql::{Context, EmptySubscription, InputObject, Object, Schema};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::error::RegistryError;
use crate::domain::fleet_service::FleetService;
use crate::domain::node::{CredentialsRef, Node, NodeSpec, NodeUpdate, OsFamily};
use crate::domain::types::{DaemonHealth, HealthResult, ScrapeTarget};
use crate::reconciler::{PassReport, Reconciler};

pub type FleetwatchSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

fn gql_error(e: RegistryError) -> async_graphql::Error {
    async_graphql::Error::new(e.to_string())
}

#[derive(InputObject)]
pub struct LabelInput {
    pub name: String,
    pub value: String,
}

fn label_map(labels: Vec<LabelInput>) -> BTreeMap<String, String> {
    labels.into_iter().map(|l| (l.name, l.value)).collect()
}

#[derive(InputObject)]
pub struct AddNodeInput {
    pub display_name: Option<String>,
    pub address: String,
    pub os_family: OsFamily,
    pub management_port: Option<u16>,
    pub metrics_port: Option<u16>,
    #[graphql(default)]
    pub labels: Vec<LabelInput>,
    /// Opaque handle understood by the provisioning tooling.
    pub credentials: Option<String>,
}

impl From<AddNodeInput> for NodeSpec {
    fn from(input: AddNodeInput) -> Self {
        NodeSpec {
            display_name: input.display_name,
            address: input.address,
            os_family: input.os_family,
            management_port: input.management_port,
            metrics_port: input.metrics_port,
            labels: label_map(input.labels),
            credentials: input.credentials.map(CredentialsRef::new),
        }
    }
}

#[derive(InputObject)]
pub struct UpdateNodeInput {
    pub display_name: Option<String>,
    /// Replaces the user labels when present.
    pub labels: Option<Vec<LabelInput>>,
}

impl From<UpdateNodeInput> for NodeUpdate {
    fn from(input: UpdateNodeInput) -> Self {
        NodeUpdate {
            display_name: input.display_name,
            labels: input.labels.map(label_map),
        }
    }
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn health(&self, ctx: &Context<'_>) -> async_graphql::Result<DaemonHealth> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        Ok(fleet.health().await)
    }

    async fn nodes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<Node>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        Ok(fleet.list_nodes().await)
    }

    /// `null` for unknown or deleted nodes.
    async fn node(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<Node>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        match fleet.get_node(&id).await {
            Ok(node) => Ok(Some(node)),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(gql_error(e)),
        }
    }

    async fn node_health(
        &self,
        ctx: &Context<'_>,
        id: String,
    ) -> async_graphql::Result<Option<HealthResult>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.get_health(&id).await.map_err(gql_error)
    }

    async fn scrape_targets(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<ScrapeTarget>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet
            .scrape_targets()
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    async fn add_node(&self, ctx: &Context<'_>, input: AddNodeInput) -> async_graphql::Result<Node> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.add_node(input.into()).await.map_err(gql_error)
    }

    async fn update_node(
        &self,
        ctx: &Context<'_>,
        id: String,
        input: UpdateNodeInput,
    ) -> async_graphql::Result<Node> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.update_node(&id, input.into()).await.map_err(gql_error)
    }

    async fn delete_node(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<bool> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.delete_node(&id).await.map_err(gql_error)?;
        Ok(true)
    }

    async fn reprovision_node(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Node> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.reprovision(&id).await.map_err(gql_error)
    }

    /// Run one reconciliation pass now.
    async fn reconcile(&self, ctx: &Context<'_>) -> async_graphql::Result<PassReport> {
        let reconciler = ctx.data::<Arc<Reconciler>>()?;
        Ok(reconciler.run_pass().await)
    }
}

pub fn build_schema(fleet: Arc<FleetService>, reconciler: Arc<Reconciler>) -> FleetwatchSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(fleet)
        .data(reconciler)
        .finish()
}
