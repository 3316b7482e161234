//! Enterprise context attached to a session and synchronized with the peer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Employee,
    Client,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::Employee => write!(f, "employee"),
            UserRole::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(UserRole::Admin),
            "employee" => Ok(UserRole::Employee),
            "client" => Ok(UserRole::Client),
            other => Err(format!("'{}' is not one of admin, employee, client", other)),
        }
    }
}

/// Identity, role and permission bundle of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseContext {
    pub user_id: String,
    pub user_role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    pub session_id: String,
}

impl EnterpriseContext {
    pub fn new(user_id: impl Into<String>, user_role: UserRole, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_role,
            company_id: None,
            company_name: None,
            permissions: BTreeSet::new(),
            session_id: session_id.into(),
        }
    }

    /// Shallow merge: every field present in the patch replaces the held one.
    pub fn merge(&mut self, patch: ContextPatch) {
        if let Some(user_id) = patch.user_id {
            self.user_id = user_id;
        }
        if let Some(user_role) = patch.user_role {
            self.user_role = user_role;
        }
        if let Some(company_id) = patch.company_id {
            self.company_id = Some(company_id);
        }
        if let Some(company_name) = patch.company_name {
            self.company_name = Some(company_name);
        }
        if let Some(permissions) = patch.permissions {
            self.permissions = permissions;
        }
        if let Some(session_id) = patch.session_id {
            self.session_id = session_id;
        }
    }
}

/// A partial [`EnterpriseContext`]; absent fields are left untouched by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<UserRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ContextPatch {
    pub fn company_name(name: impl Into<String>) -> Self {
        Self {
            company_name: Some(name.into()),
            ..Default::default()
        }
    }
}

impl From<&EnterpriseContext> for ContextPatch {
    fn from(ctx: &EnterpriseContext) -> Self {
        Self {
            user_id: Some(ctx.user_id.clone()),
            user_role: Some(ctx.user_role),
            company_id: ctx.company_id.clone(),
            company_name: ctx.company_name.clone(),
            permissions: Some(ctx.permissions.clone()),
            session_id: Some(ctx.session_id.clone()),
        }
    }
}
