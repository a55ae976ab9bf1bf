use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::ServerPhase;

pub type ServerId = String;
pub type DatabaseId = String;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningAction {
    #[default]
    None,
    Provision,
    Reconfigure,
    Deprovision,
}

impl ProvisioningAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningAction::None => "none",
            ProvisioningAction::Provision => "provision",
            ProvisioningAction::Reconfigure => "reconfigure",
            ProvisioningAction::Deprovision => "deprovision",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            ProvisioningAction::None => "None",
            ProvisioningAction::Provision => "Provisioning",
            ProvisioningAction::Reconfigure => "Reconfiguration",
            ProvisioningAction::Deprovision => "De-provisioning",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "provision" | "create" => ProvisioningAction::Provision,
            "reconfigure" | "configure" => ProvisioningAction::Reconfigure,
            "deprovision" | "delete" | "destroy" => ProvisioningAction::Deprovision,
            _ => ProvisioningAction::None,
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, ProvisioningAction::None)
    }
}

impl std::fmt::Display for ProvisioningAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    #[default]
    Pending,
    Processing,
    Ready,
    Error,
    Deprovisioned,
}

impl ProvisioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStatus::Pending => "pending",
            ProvisioningStatus::Processing => "processing",
            ProvisioningStatus::Ready => "ready",
            ProvisioningStatus::Error => "error",
            ProvisioningStatus::Deprovisioned => "deprovisioned",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            ProvisioningStatus::Pending => "Pending",
            ProvisioningStatus::Processing => "Processing",
            ProvisioningStatus::Ready => "Ready",
            ProvisioningStatus::Error => "Error",
            ProvisioningStatus::Deprovisioned => "De-provisioned",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "processing" | "provisioning" | "reconfiguring" | "deprovisioning" => {
                ProvisioningStatus::Processing
            }
            "ready" | "ok" => ProvisioningStatus::Ready,
            "error" | "failed" => ProvisioningStatus::Error,
            "deprovisioned" => ProvisioningStatus::Deprovisioned,
            _ => ProvisioningStatus::Pending,
        }
    }
}

impl std::fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseServerKind {
    #[default]
    SqlServer,
    #[serde(rename = "ravendb")]
    RavenDb,
}

impl DatabaseServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseServerKind::SqlServer => "sql_server",
            DatabaseServerKind::RavenDb => "ravendb",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            DatabaseServerKind::SqlServer => "SQL Server",
            DatabaseServerKind::RavenDb => "RavenDB",
        }
    }
}

/// A tenant's database server and the state the engine has observed for it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatabaseServer {
    pub id: ServerId,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: DatabaseServerKind,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub storage_mb: Option<u32>,
    #[serde(default)]
    pub action: ProvisioningAction,
    #[serde(default)]
    pub phase: ServerPhase,
    #[serde(default)]
    pub status: ProvisioningStatus,
    #[serde(default)]
    pub ingress_ip: Option<String>,
    #[serde(default)]
    pub ingress_port: Option<u16>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseServer {
    /// A freshly requested server: `Provision` pending from phase `None`.
    pub fn new(
        id: impl Into<ServerId>,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        kind: DatabaseServerKind,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            kind,
            admin_password: String::new(),
            storage_mb: None,
            action: ProvisioningAction::Provision,
            phase: ServerPhase::None,
            status: ProvisioningStatus::Pending,
            ingress_ip: None,
            ingress_port: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_admin_password(mut self, password: impl Into<String>) -> Self {
        self.admin_password = password.into();
        self
    }

    pub fn with_storage_mb(mut self, storage_mb: u32) -> Self {
        self.storage_mb = Some(storage_mb);
        self
    }

    pub fn with_action(mut self, action: ProvisioningAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_phase(mut self, phase: ServerPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_status(mut self, status: ProvisioningStatus) -> Self {
        self.status = status;
        self
    }

    pub fn touch(mut self) -> Self {
        self.updated_at = Utc::now();
        self
    }

    pub fn is_ready(&self) -> bool {
        self.status == ProvisioningStatus::Ready
    }

    pub fn is_halted(&self) -> bool {
        self.status == ProvisioningStatus::Error
    }

    /// `Ready` implies the server sits in `Done` with nothing left to do.
    pub fn upholds_invariants(&self) -> bool {
        self.status != ProvisioningStatus::Ready
            || (self.phase == ServerPhase::Done && self.action == ProvisioningAction::None)
    }

    /// Externally reachable `host,port` pair, once the ingress reported one.
    pub fn public_endpoint(&self) -> Option<String> {
        match (&self.ingress_ip, self.ingress_port) {
            (Some(ip), Some(port)) => Some(format!("{ip},{port}")),
            _ => None,
        }
    }
}

/// A database hosted on a [`DatabaseServer`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatabaseInstance {
    pub id: DatabaseId,
    pub server_id: ServerId,
    pub tenant_id: String,
    pub name: String,
    pub database_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database_password: String,
    #[serde(default)]
    pub storage_mb: Option<u32>,
    #[serde(default)]
    pub action: ProvisioningAction,
    #[serde(default)]
    pub status: ProvisioningStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseInstance {
    pub fn new(
        id: impl Into<DatabaseId>,
        server_id: impl Into<ServerId>,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            server_id: server_id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            database_user: String::new(),
            database_password: String::new(),
            storage_mb: None,
            action: ProvisioningAction::Provision,
            status: ProvisioningStatus::Pending,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.database_user = user.into();
        self.database_password = password.into();
        self
    }

    pub fn with_action(mut self, action: ProvisioningAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_status(mut self, status: ProvisioningStatus) -> Self {
        self.status = status;
        self
    }

    pub fn touch(mut self) -> Self {
        self.updated_at = Utc::now();
        self
    }
}
