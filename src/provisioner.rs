//! Resource Provisioner (spec §4.C): ensures each declared PushTopic or
//! StreamingChannel exists, binding to an existing record or creating one.

use crate::auth::SalesforceAuth;
use crate::config::ResourceSpec;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("salesforce API rejected request: {status} {body}")]
    Rejected { status: u16, body: String },
    #[error("resource lookup by Name returned no record: {0}")]
    NotFound(String),
    #[error("response missing expected field '{0}'")]
    MissingField(String),
}

/// Used for a resource whose `spec` carries no `ApiVersion` field (§6: "API
/// version is taken from each resource's `ApiVersion` field").
pub const DEFAULT_API_VERSION: &str = "59.0";

/// A resource bound (existing or newly created) at startup, ready for the
/// CometD client to subscribe to its Bayeux channel.
#[derive(Debug, Clone)]
pub struct ProvisionedResource {
    pub object_id: String,
    pub channel: String,
    pub durable: bool,
    pub sobject_name: &'static str,
    pub api_version: String,
}

pub struct ResourceProvisioner {
    http: reqwest::Client,
}

impl ResourceProvisioner {
    pub fn new(http: reqwest::Client) -> Self {
        ResourceProvisioner { http }
    }

    /// Bind or create every resource declared for one org. A failure here is
    /// fatal before the pipeline starts (§4.C). Each resource is provisioned
    /// against its own `ApiVersion` (§6), not a single org-wide version.
    pub async fn provision_org(
        &self,
        auth: &Arc<SalesforceAuth>,
        resources: &[ResourceSpec],
    ) -> Result<Vec<ProvisionedResource>, ProvisionError> {
        let mut provisioned = Vec::with_capacity(resources.len());
        for resource in resources {
            provisioned.push(self.provision_one(auth, resource).await?);
        }
        Ok(provisioned)
    }

    async fn provision_one(
        &self,
        auth: &Arc<SalesforceAuth>,
        resource: &ResourceSpec,
    ) -> Result<ProvisionedResource, ProvisionError> {
        let sobject = resource.sobject_name();
        let api_version = resource_api_version(resource);
        let api_version = api_version.as_str();
        let (access_token, instance_url) = auth.access_token().await?;

        let (object_id, name) = if resource.names_existing() {
            if let Some(id) = resource.spec().get("Id").and_then(|v| v.as_str()) {
                let name = self
                    .lookup_name_by_id(&instance_url, &access_token, api_version, sobject, id)
                    .await?;
                (id.to_owned(), name)
            } else {
                let name = resource
                    .spec()
                    .get("Name")
                    .and_then(|v| v.as_str())
                    .expect("names_existing() guarantees Name or Id is present")
                    .to_owned();
                let id = self
                    .lookup_id_by_name(&instance_url, &access_token, api_version, sobject, &name)
                    .await?;
                (id, name)
            }
        } else {
            self.create(&instance_url, &access_token, api_version, sobject, resource.spec())
                .await?
        };

        let channel = resource.bayeux_channel(&name);
        info!(sobject, %object_id, %channel, durable = resource.durable(), "resource provisioned");

        Ok(ProvisionedResource {
            object_id,
            channel,
            durable: resource.durable(),
            sobject_name: sobject,
            api_version: api_version.to_owned(),
        })
    }

    async fn lookup_id_by_name(
        &self,
        instance_url: &str,
        access_token: &str,
        api_version: &str,
        sobject: &str,
        name: &str,
    ) -> Result<String, ProvisionError> {
        let soql = format!("SELECT Id FROM {sobject} WHERE Name = '{}'", escape_soql(name));
        let url = format!("{instance_url}/services/data/v{api_version}/query");
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("q", soql)])
            .send()
            .await?;
        let body = self.check_status(response).await?;
        let records = body
            .get("records")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProvisionError::MissingField("records".to_owned()))?;
        let record = records
            .first()
            .ok_or_else(|| ProvisionError::NotFound(name.to_owned()))?;
        record
            .get("Id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ProvisionError::MissingField("Id".to_owned()))
    }

    async fn lookup_name_by_id(
        &self,
        instance_url: &str,
        access_token: &str,
        api_version: &str,
        sobject: &str,
        id: &str,
    ) -> Result<String, ProvisionError> {
        let url = format!("{instance_url}/services/data/v{api_version}/sobjects/{sobject}/{id}");
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("fields", "Name")])
            .send()
            .await?;
        let body = self.check_status(response).await?;
        body.get("Name")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| ProvisionError::MissingField("Name".to_owned()))
    }

    async fn create(
        &self,
        instance_url: &str,
        access_token: &str,
        api_version: &str,
        sobject: &str,
        spec: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(String, String), ProvisionError> {
        let url = format!("{instance_url}/services/data/v{api_version}/sobjects/{sobject}");
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(spec)
            .send()
            .await?;
        let body = self.check_status(response).await?;
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProvisionError::MissingField("id".to_owned()))?
            .to_owned();
        let name = spec
            .get("Name")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| id.clone());
        Ok((id, name))
    }

    /// Delete every non-durable resource on clean shutdown (§4.C). Errors
    /// here are logged but non-fatal.
    pub async fn teardown(&self, auth: &Arc<SalesforceAuth>, resources: &[ProvisionedResource]) {
        for resource in resources {
            if resource.durable {
                continue;
            }
            if let Err(e) = self.delete_one(auth, resource).await {
                error!(sobject = resource.sobject_name, object_id = %resource.object_id, error = %e, "failed to tear down non-durable resource");
            }
        }
    }

    async fn delete_one(&self, auth: &Arc<SalesforceAuth>, resource: &ProvisionedResource) -> Result<(), ProvisionError> {
        let (access_token, instance_url) = auth.access_token().await?;
        let url = format!(
            "{instance_url}/services/data/v{}/sobjects/{}/{}",
            resource.api_version, resource.sobject_name, resource.object_id
        );
        let response = self.http.delete(&url).bearer_auth(access_token).send().await?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Rejected { status, body });
        }
        Ok(())
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<serde_json::Value, ProvisionError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Rejected { status, body });
        }
        Ok(response.json().await?)
    }
}

fn escape_soql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Reads a resource's own `ApiVersion` field (§6), falling back to
/// [`DEFAULT_API_VERSION`] when the operator didn't set one.
fn resource_api_version(resource: &ResourceSpec) -> String {
    resource
        .spec()
        .get("ApiVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_API_VERSION)
        .to_owned()
}

/// The Bayeux session version for an org: the newest `ApiVersion` used by
/// any of its provisioned resources, or [`DEFAULT_API_VERSION`] if the org
/// declares none (§6: "the Bayeux version defaults to the newest used
/// across resources").
pub fn highest_api_version(resources: &[ProvisionedResource]) -> String {
    resources
        .iter()
        .max_by(|a, b| {
            let pa: f64 = a.api_version.parse().unwrap_or(0.0);
            let pb: f64 = b.api_version.parse().unwrap_or(0.0);
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|r| r.api_version.clone())
        .unwrap_or_else(|| DEFAULT_API_VERSION.to_owned())
}
