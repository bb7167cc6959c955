//! Azure Batch REST implementation of [`BatchService`].

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Response};
use serde::Serialize;
use tracing::debug;

use crate::account::Account;

use super::auth::{AzureCredentials, TokenSource};
use super::wire::{
    CloudTask, ErrorBody, JobAddBody, NodeListPage, PoolAddBody, PoolInfo, TaskAddBody,
};
use super::{BatchError, BatchFuture, BatchService, ComputeNode, PoolSpec, TaskSnapshot, TaskSpec};

const API_VERSION: &str = "2017-09-01.6.0";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// The service rejects plain `application/json` on several add operations.
const ODATA_JSON: &str = "application/json; odata=minimalmetadata";

/// Talks to each account's Batch endpoint over HTTPS.
#[derive(Debug)]
pub struct RestBatchService {
    http: reqwest::Client,
    tokens: TokenSource,
}

impl RestBatchService {
    /// Creates a service authenticating with the given service principal.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn new(credentials: AzureCredentials) -> Result<Self, BatchError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| BatchError::transport("build http client", err.to_string()))?;
        Ok(Self {
            tokens: TokenSource::new(http.clone(), credentials),
            http,
        })
    }

    fn url(account: &Account, path: &str) -> String {
        format!("{}{path}?api-version={API_VERSION}", account.endpoint())
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, BatchError> {
        let token = self.tokens.bearer().await?;
        let mut request = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {token}"));
        if let Some(payload) = body {
            request = request.header(CONTENT_TYPE, ODATA_JSON).body(payload);
        }

        let response = request
            .send()
            .await
            .map_err(|err| BatchError::transport(operation, err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| BatchError::transport(operation, err.to_string()))?;
        let (code, message) = match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(parsed) => (
                parsed.code,
                parsed
                    .message
                    .map_or_else(|| String::from_utf8_lossy(&bytes).into_owned(), |msg| msg.value),
            ),
            Err(_) => (None, String::from_utf8_lossy(&bytes).into_owned()),
        };
        Err(BatchError::Status {
            operation: operation.to_owned(),
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn post_json<T: Serialize + Sync>(
        &self,
        operation: &str,
        url: &str,
        payload: &T,
    ) -> Result<(), BatchError> {
        let body = serde_json::to_vec(payload).map_err(|err| BatchError::Decode {
            operation: operation.to_owned(),
            message: err.to_string(),
        })?;
        self.send(operation, Method::POST, url, Some(body)).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: Response,
    ) -> Result<T, BatchError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|err| BatchError::transport(operation, err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| BatchError::Decode {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
    }
}

impl BatchService for RestBatchService {
    fn create_pool<'a>(
        &'a self,
        account: &'a Account,
        pool: &'a PoolSpec,
    ) -> BatchFuture<'a, ()> {
        Box::pin(async move {
            let url = Self::url(account, "/pools");
            self.post_json("create pool", &url, &PoolAddBody::from(pool))
                .await
        })
    }

    fn create_job<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        pool_id: &'a str,
    ) -> BatchFuture<'a, ()> {
        Box::pin(async move {
            let url = Self::url(account, "/jobs");
            let body = JobAddBody {
                id: job_id,
                pool_info: PoolInfo { pool_id },
            };
            self.post_json("create job", &url, &body).await
        })
    }

    fn add_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task: &'a TaskSpec,
    ) -> BatchFuture<'a, ()> {
        Box::pin(async move {
            let url = Self::url(account, &format!("/jobs/{job_id}/tasks"));
            self.post_json("add task", &url, &TaskAddBody::from(task))
                .await
        })
    }

    fn get_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task_id: &'a str,
    ) -> BatchFuture<'a, TaskSnapshot> {
        Box::pin(async move {
            let url = Self::url(account, &format!("/jobs/{job_id}/tasks/{task_id}"));
            let response = self.send("get task", Method::GET, &url, None).await?;
            let task: CloudTask = Self::read_json("get task", response).await?;
            Ok(task.into())
        })
    }

    fn delete_task<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task_id: &'a str,
    ) -> BatchFuture<'a, ()> {
        Box::pin(async move {
            let url = Self::url(account, &format!("/jobs/{job_id}/tasks/{task_id}"));
            self.send("delete task", Method::DELETE, &url, None).await?;
            Ok(())
        })
    }

    fn list_pool_nodes<'a>(
        &'a self,
        account: &'a Account,
        pool_id: &'a str,
    ) -> BatchFuture<'a, Vec<ComputeNode>> {
        Box::pin(async move {
            let mut nodes = Vec::new();
            let mut next = Some(Self::url(account, &format!("/pools/{pool_id}/nodes")));
            while let Some(url) = next {
                let response = self.send("list nodes", Method::GET, &url, None).await?;
                let page: NodeListPage = Self::read_json("list nodes", response).await?;
                nodes.extend(page.value.into_iter().map(ComputeNode::from));
                next = page.next_link;
            }
            debug!(account = %account.name, count = nodes.len(), "listed pool nodes");
            Ok(nodes)
        })
    }

    fn task_file<'a>(
        &'a self,
        account: &'a Account,
        job_id: &'a str,
        task_id: &'a str,
        file_name: &'a str,
    ) -> BatchFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let url = Self::url(
                account,
                &format!("/jobs/{job_id}/tasks/{task_id}/files/{file_name}"),
            );
            let response = self.send("get task file", Method::GET, &url, None).await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|err| BatchError::transport("get task file", err.to_string()))?;
            Ok(bytes.to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_targets_account_endpoint_with_api_version() {
        let account = Account::new("fleet", "westeurope");
        assert_eq!(
            RestBatchService::url(&account, "/jobs/GameServers/tasks"),
            "https://fleet.westeurope.batch.azure.com/jobs/GameServers/tasks?api-version=2017-09-01.6.0"
        );
    }

    #[test]
    fn new_builds_client_with_request_timeout() {
        let service = RestBatchService::new(AzureCredentials {
            tenant_id: String::from("tenant"),
            client_id: String::from("client"),
            client_secret: String::from("secret"),
        });
        assert!(service.is_ok(), "client should build: {service:?}");
    }
}
