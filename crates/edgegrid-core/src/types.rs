//! Resource keys and objects of the edgegrid control plane.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::object::{InfoObject, NotifyTagged, ObjKey, StoredObject, TrackedObject};
use crate::ports::AppPort;

/// Cluster names with this prefix are reserved for clusters created
/// implicitly on behalf of an app instance.
pub const AUTO_CLUSTER_PREFIX: &str = "autocluster";

static NAME_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\- ]*$"));

fn validate_name(kind: &'static str, name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::Missing(kind));
    }
    let re = NAME_RE
        .as_ref()
        .map_err(|e| CoreError::Pattern(e.to_string()))?;
    if !re.is_match(name) {
        return Err(CoreError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

// ── States and enums ───────────────────────────────────────────────

/// Lifecycle state of a tracked object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedState {
    #[default]
    Unknown,
    NotPresent,
    CreateRequested,
    Creating,
    CreateError,
    Ready,
    UpdateRequested,
    Updating,
    UpdateError,
    DeleteRequested,
    Deleting,
    DeleteError,
    /// Controller-internal: children are being removed before the
    /// delete request is sent to the agent.
    DeletePrepare,
}

impl TrackedState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TrackedState::CreateError | TrackedState::UpdateError | TrackedState::DeleteError
        )
    }

    /// States in which an operation is in flight.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TrackedState::CreateRequested
                | TrackedState::Creating
                | TrackedState::UpdateRequested
                | TrackedState::Updating
                | TrackedState::DeleteRequested
                | TrackedState::Deleting
                | TrackedState::DeletePrepare
        )
    }
}

impl fmt::Display for TrackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackedState::Unknown => "Unknown",
            TrackedState::NotPresent => "NotPresent",
            TrackedState::CreateRequested => "CreateRequested",
            TrackedState::Creating => "Creating",
            TrackedState::CreateError => "CreateError",
            TrackedState::Ready => "Ready",
            TrackedState::UpdateRequested => "UpdateRequested",
            TrackedState::Updating => "Updating",
            TrackedState::UpdateError => "UpdateError",
            TrackedState::DeleteRequested => "DeleteRequested",
            TrackedState::Deleting => "Deleting",
            TrackedState::DeleteError => "DeleteError",
            TrackedState::DeletePrepare => "DeletePrepare",
        };
        f.write_str(s)
    }
}

/// Caller-supplied switches that relax agent handling for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmOverride {
    #[default]
    NoOverride,
    IgnoreCrmErrors,
    IgnoreCrm,
    IgnoreTransientState,
    IgnoreCrmAndTransientState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Unknown,
    /// Explicitly requested by a user.
    Static,
    /// Created implicitly as a dependency.
    Dynamic,
    Autoprov,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpAccess {
    #[default]
    Unknown,
    Dedicated,
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSupport {
    #[default]
    Unknown,
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    #[default]
    Fake,
    Openstack,
    Vsphere,
    Azure,
    Gcp,
    Edgebox,
}

impl PlatformType {
    /// Platforms whose load balancer hands out one IP per service, so the
    /// cloudlet does not count dynamic IPs for them.
    pub fn ip_allocated_per_service(self) -> bool {
        matches!(self, PlatformType::Azure | PlatformType::Gcp)
    }

    /// Public cloud platforms that only run managed kubernetes.
    pub fn is_managed_kubernetes(self) -> bool {
        matches!(self, PlatformType::Azure | PlatformType::Gcp)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    #[default]
    Kubernetes,
    Docker,
    Helm,
    Vm,
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Deployment::Kubernetes => "kubernetes",
            Deployment::Docker => "docker",
            Deployment::Helm => "helm",
            Deployment::Vm => "vm",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudletState {
    #[default]
    Unknown,
    Ready,
    Offline,
}

/// Whether instances of an app may be removed along with their cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteType {
    #[default]
    NoAutoDelete,
    AutoDelete,
}

// ── Keys ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CloudletKey {
    pub organization: String,
    pub name: String,
}

impl CloudletKey {
    pub fn new(organization: &str, name: &str) -> Self {
        Self {
            organization: organization.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CloudletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.name)
    }
}

impl ObjKey for CloudletKey {
    fn validate(&self) -> CoreResult<()> {
        validate_name("cloudlet organization", &self.organization)?;
        validate_name("cloudlet", &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlavorKey {
    pub name: String,
}

impl FlavorKey {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for FlavorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl ObjKey for FlavorKey {
    fn validate(&self) -> CoreResult<()> {
        validate_name("flavor", &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppKey {
    pub organization: String,
    pub name: String,
    pub version: String,
}

impl AppKey {
    pub fn new(organization: &str, name: &str, version: &str) -> Self {
        Self {
            organization: organization.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.organization, self.name, self.version)
    }
}

impl ObjKey for AppKey {
    fn validate(&self) -> CoreResult<()> {
        validate_name("app organization", &self.organization)?;
        validate_name("app", &self.name)?;
        validate_name("app version", &self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub name: String,
}

/// Identifies a cluster on a cloudlet, owned by an organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterInstKey {
    pub cluster_key: ClusterKey,
    pub cloudlet_key: CloudletKey,
    pub organization: String,
}

impl ClusterInstKey {
    pub fn new(cluster: &str, cloudlet_key: CloudletKey, organization: &str) -> Self {
        Self {
            cluster_key: ClusterKey {
                name: cluster.to_string(),
            },
            cloudlet_key,
            organization: organization.to_string(),
        }
    }

    pub fn is_auto_cluster(&self) -> bool {
        self.cluster_key.name.starts_with(AUTO_CLUSTER_PREFIX)
    }

    /// Partial comparison: empty fields of `filter` match anything.
    pub fn matches(&self, filter: &ClusterInstKey) -> bool {
        let field = |want: &str, have: &str| want.is_empty() || want == have;
        field(&filter.cluster_key.name, &self.cluster_key.name)
            && field(&filter.cloudlet_key.organization, &self.cloudlet_key.organization)
            && field(&filter.cloudlet_key.name, &self.cloudlet_key.name)
            && field(&filter.organization, &self.organization)
    }
}

impl fmt::Display for ClusterInstKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.organization, self.cluster_key.name, self.cloudlet_key
        )
    }
}

impl ObjKey for ClusterInstKey {
    fn validate(&self) -> CoreResult<()> {
        validate_name("cluster", &self.cluster_key.name)?;
        validate_name("cluster organization", &self.organization)?;
        self.cloudlet_key.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppInstKey {
    pub app_key: AppKey,
    pub cluster_inst_key: ClusterInstKey,
}

impl AppInstKey {
    pub fn new(app_key: AppKey, cluster_inst_key: ClusterInstKey) -> Self {
        Self {
            app_key,
            cluster_inst_key,
        }
    }

    pub fn cloudlet_key(&self) -> &CloudletKey {
        &self.cluster_inst_key.cloudlet_key
    }
}

impl fmt::Display for AppInstKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.app_key, self.cluster_inst_key)
    }
}

impl ObjKey for AppInstKey {
    fn validate(&self) -> CoreResult<()> {
        self.app_key.validate()?;
        self.cluster_inst_key.validate()
    }
}

/// Identifies the progress stream of one operation on one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub type_name: String,
    pub key_id: String,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.key_id)
    }
}

impl ObjKey for StreamKey {
    fn validate(&self) -> CoreResult<()> {
        if self.type_name.is_empty() || self.key_id.is_empty() {
            return Err(CoreError::Missing("stream key"));
        }
        Ok(())
    }
}

// ── Catalog objects ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub key: FlavorKey,
    pub ram_mb: u64,
    pub vcpus: u64,
    pub disk_gb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cloudlet {
    pub key: CloudletKey,
    pub platform_type: PlatformType,
    pub ip_support: IpSupport,
    /// Size of the dynamic IP pool, including the root LB's own address.
    pub num_dynamic_ips: i32,
}

/// Agent-reported readiness of a cloudlet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudletInfo {
    pub key: CloudletKey,
    pub state: CloudletState,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub notify_id: u64,
}

/// Reservation accounting for everything placed on one cloudlet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudletRefs {
    pub key: CloudletKey,
    #[serde(default)]
    pub clusters: Vec<ClusterInstKey>,
    #[serde(default)]
    pub used_ram: u64,
    #[serde(default)]
    pub used_vcores: u64,
    #[serde(default)]
    pub used_disk: u64,
    /// External port on the shared root LB to its protocol bitmask.
    #[serde(default)]
    pub root_lb_ports: BTreeMap<i32, i32>,
    #[serde(default)]
    pub used_dynamic_ips: i32,
}

impl CloudletRefs {
    pub fn new(key: CloudletKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub key: AppKey,
    pub deployment: Deployment,
    #[serde(default)]
    pub image_path: String,
    /// Comma separated `proto:port` list, see [`crate::parse_app_ports`].
    #[serde(default)]
    pub access_ports: String,
    pub default_flavor: FlavorKey,
    /// Ports are only reachable from inside the cluster.
    #[serde(default)]
    pub internal_ports: bool,
    #[serde(default)]
    pub del_opt: DeleteType,
}

// ── Tracked objects ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInst {
    pub key: ClusterInstKey,
    pub flavor: FlavorKey,
    pub liveness: Liveness,
    /// Created implicitly for an app instance.
    #[serde(default)]
    pub auto: bool,
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub crm_override: CrmOverride,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub num_masters: u32,
    #[serde(default)]
    pub num_nodes: u32,
    #[serde(default)]
    pub ip_access: IpAccess,
    #[serde(default)]
    pub allocated_ip: String,
    #[serde(default)]
    pub node_flavor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInst {
    pub key: AppInstKey,
    #[serde(default)]
    pub uri: String,
    pub liveness: Liveness,
    #[serde(default)]
    pub mapped_ports: Vec<AppPort>,
    pub flavor: FlavorKey,
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub crm_override: CrmOverride,
    #[serde(default)]
    pub created_at: u64,
}

// ── Info objects ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInstInfo {
    pub key: ClusterInstKey,
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub notify_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInstInfo {
    pub key: AppInstKey,
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub notify_id: u64,
}

// ── Stream objects ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Active,
    Done,
    Error,
}

/// Lease-bound progress log of one long-running operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamObj {
    pub key: StreamKey,
    #[serde(default)]
    pub msgs: Vec<String>,
    pub state: StreamState,
    #[serde(default)]
    pub error: String,
}

// ── Trait wiring ───────────────────────────────────────────────────

macro_rules! stored {
    ($ty:ty, $key:ty, $name:literal, $tag:literal) => {
        impl StoredObject for $ty {
            type Key = $key;
            const TYPE_NAME: &'static str = $name;
            const TYPE_TAG: u16 = $tag;

            fn key(&self) -> &$key {
                &self.key
            }
        }
    };
}

stored!(Flavor, FlavorKey, "Flavor", 10);
stored!(Cloudlet, CloudletKey, "Cloudlet", 20);
stored!(CloudletInfo, CloudletKey, "CloudletInfo", 21);
stored!(CloudletRefs, CloudletKey, "CloudletRefs", 22);
stored!(App, AppKey, "App", 30);
stored!(ClusterInst, ClusterInstKey, "ClusterInst", 40);
stored!(AppInst, AppInstKey, "AppInst", 50);
stored!(StreamObj, StreamKey, "StreamObj", 60);
// Info objects are local to each controller and never stored; their tags
// only keep the type table complete.
stored!(ClusterInstInfo, ClusterInstKey, "ClusterInstInfo", 41);
stored!(AppInstInfo, AppInstKey, "AppInstInfo", 51);

macro_rules! tracked {
    ($ty:ty) => {
        impl TrackedObject for $ty {
            fn state(&self) -> TrackedState {
                self.state
            }

            fn set_state(&mut self, state: TrackedState) {
                self.state = state;
            }

            fn errors(&self) -> &[String] {
                &self.errors
            }

            fn set_errors(&mut self, errors: Vec<String>) {
                self.errors = errors;
            }

            fn status(&self) -> &str {
                &self.status
            }

            fn set_status(&mut self, status: String) {
                self.status = status;
            }
        }
    };
}

tracked!(ClusterInst);
tracked!(AppInst);

macro_rules! info_object {
    ($ty:ty) => {
        impl NotifyTagged for $ty {
            fn notify_id(&self) -> u64 {
                self.notify_id
            }
        }

        impl InfoObject for $ty {
            fn state(&self) -> TrackedState {
                self.state
            }

            fn errors(&self) -> &[String] {
                &self.errors
            }

            fn status(&self) -> &str {
                &self.status
            }
        }
    };
}

info_object!(ClusterInstInfo);
info_object!(AppInstInfo);

impl NotifyTagged for CloudletInfo {
    fn notify_id(&self) -> u64 {
        self.notify_id
    }
}
