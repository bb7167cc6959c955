//! JSON payloads exchanged with the Azure Batch REST API.

use serde::{Deserialize, Serialize};

use super::{ComputeNode, InboundEndpoint, PoolSpec, TaskSnapshot, TaskSpec, TaskState};

const AUTO_USER_SCOPE_TASK: &str = "task";
const ELEVATION_ADMIN: &str = "admin";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PoolAddBody<'a> {
    id: &'a str,
    vm_size: &'a str,
    virtual_machine_configuration: VirtualMachineConfiguration<'a>,
    max_tasks_per_node: u32,
    target_dedicated_nodes: u32,
    start_task: StartTaskBody<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachineConfiguration<'a> {
    image_reference: ImageReferenceBody<'a>,
    #[serde(rename = "nodeAgentSKUId")]
    node_agent_sku_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ImageReferenceBody<'a> {
    publisher: &'a str,
    offer: &'a str,
    sku: &'a str,
    version: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskBody<'a> {
    command_line: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    resource_files: Vec<ResourceFileBody<'a>>,
    user_identity: UserIdentity,
    wait_for_success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceFileBody<'a> {
    blob_source: &'a str,
    file_path: &'a str,
    file_mode: &'a str,
}

/// Task-scoped elevated identity, so privileges end with the task.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserIdentity {
    auto_user: AutoUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoUser {
    scope: &'static str,
    elevation_level: &'static str,
}

impl UserIdentity {
    const fn task_admin() -> Self {
        Self {
            auto_user: AutoUser {
                scope: AUTO_USER_SCOPE_TASK,
                elevation_level: ELEVATION_ADMIN,
            },
        }
    }
}

impl<'a> From<&'a PoolSpec> for PoolAddBody<'a> {
    fn from(pool: &'a PoolSpec) -> Self {
        let start = &pool.start_task;
        Self {
            id: &pool.id,
            vm_size: &pool.vm_size,
            virtual_machine_configuration: VirtualMachineConfiguration {
                image_reference: ImageReferenceBody {
                    publisher: &pool.image.publisher,
                    offer: &pool.image.offer,
                    sku: &pool.image.sku,
                    version: &pool.image.version,
                },
                node_agent_sku_id: &pool.node_agent_sku_id,
            },
            max_tasks_per_node: pool.max_tasks_per_node,
            target_dedicated_nodes: pool.target_dedicated_nodes,
            start_task: StartTaskBody {
                command_line: &start.command_line,
                resource_files: start
                    .resource
                    .iter()
                    .map(|file| ResourceFileBody {
                        blob_source: &file.source_url,
                        file_path: &file.file_path,
                        file_mode: &file.file_mode,
                    })
                    .collect(),
                user_identity: UserIdentity::task_admin(),
                wait_for_success: start.wait_for_success,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct JobAddBody<'a> {
    pub(super) id: &'a str,
    pub(super) pool_info: PoolInfo<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PoolInfo<'a> {
    pub(super) pool_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TaskAddBody<'a> {
    id: &'a str,
    command_line: &'a str,
    user_identity: UserIdentity,
}

impl<'a> From<&'a TaskSpec> for TaskAddBody<'a> {
    fn from(task: &'a TaskSpec) -> Self {
        Self {
            id: &task.id,
            command_line: &task.command_line,
            user_identity: UserIdentity::task_admin(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CloudTask {
    id: String,
    state: String,
    #[serde(default)]
    node_info: Option<TaskNodeInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskNodeInfo {
    #[serde(default)]
    node_id: Option<String>,
}

impl From<CloudTask> for TaskSnapshot {
    fn from(task: CloudTask) -> Self {
        Self {
            id: task.id,
            state: TaskState::parse(&task.state),
            node_id: task.node_info.and_then(|info| info.node_id),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct NodeListPage {
    #[serde(default)]
    pub(super) value: Vec<CloudNode>,
    #[serde(rename = "odata.nextLink", default)]
    pub(super) next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CloudNode {
    id: String,
    #[serde(default)]
    endpoint_configuration: Option<EndpointConfiguration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointConfiguration {
    #[serde(default)]
    inbound_endpoints: Vec<CloudInboundEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudInboundEndpoint {
    #[serde(rename = "publicIPAddress", default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    frontend_port: Option<u16>,
}

impl From<CloudNode> for ComputeNode {
    fn from(node: CloudNode) -> Self {
        Self {
            id: node.id,
            inbound_endpoints: node
                .endpoint_configuration
                .map(|config| config.inbound_endpoints)
                .unwrap_or_default()
                .into_iter()
                .map(|endpoint| InboundEndpoint {
                    public_ip: endpoint.public_ip_address.unwrap_or_default(),
                    frontend_port: endpoint.frontend_port,
                })
                .collect(),
        }
    }
}

/// Error body returned by the service on failure.
#[derive(Debug, Deserialize)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub(super) code: Option<String>,
    #[serde(default)]
    pub(super) message: Option<ErrorMessage>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorMessage {
    #[serde(default)]
    pub(super) value: String,
}
