//! Blueprint support: resolves `jobName` scopes to a job's full name.

use async_trait::async_trait;
use serde_json::{Map, json};

use lakeflow_core::Connection;
use lakeflow_core::error::CompileError;
use lakeflow_core::fetcher::{ApiAuth, ApiClient, Headers, classify_response};
use lakeflow_core::plan::{BlueprintScope, ResolvedScope, ScopePlanner};

use super::{jenkins_auth, job_path};
use super::models::ApiJob;

#[derive(Debug, Default)]
pub struct JenkinsScopePlanner;

#[async_trait]
impl ScopePlanner for JenkinsScopePlanner {
    fn auth(&self, connection: &Connection) -> ApiAuth {
        jenkins_auth(connection)
    }

    fn scope_key(&self, scope: &BlueprintScope) -> Result<String, CompileError> {
        scope
            .option_str("jobFullName")
            .or_else(|| scope.option_str("jobName"))
            .map(|name| name.trim_matches('/'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CompileError::InvalidOptions {
                message: "jenkins scopes need a non-empty 'jobName'".into(),
            })
    }

    async fn resolve_scope(
        &self,
        scope: &BlueprintScope,
        _connection: &Connection,
        client: &dyn ApiClient,
    ) -> Result<ResolvedScope, CompileError> {
        let key = self.scope_key(scope)?;
        let lookup_failed = |message: String| CompileError::Lookup {
            scope: key.clone(),
            message,
        };

        let response = client
            .get(
                &format!("{}/api/json", job_path(&key)),
                &[("tree".to_string(), "name,fullName,url,color".to_string())],
                &Headers::new(),
            )
            .await
            .and_then(classify_response)
            .map_err(|e| lookup_failed(e.to_string()))?;
        let job: ApiJob = response.json().map_err(|e| lookup_failed(e.to_string()))?;

        let mut options = Map::new();
        options.insert(
            "jobFullName".into(),
            json!(job.full_name.unwrap_or(key.clone())),
        );
        Ok(ResolvedScope {
            options,
            repository: None,
        })
    }
}
