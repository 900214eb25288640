//! 身份实体定义
//!
//! 身份由外部用户存储维护，核心只在认证时读取并缓存到连接上。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::value_objects::{CommunityId, UserId};

/// 用户角色标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 普通居民
    Resident,
    /// 版主
    Moderator,
    /// 管理员
    Admin,
}

impl Role {
    /// 是否具备审核举报的权限
    pub fn can_moderate(&self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Resident => write!(f, "resident"),
            Role::Moderator => write!(f, "moderator"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resident" => Ok(Role::Resident),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// 认证后的身份快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// 用户ID
    pub user_id: UserId,
    /// 邮箱
    pub email: String,
    /// 角色集合
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    /// 所属社区
    #[serde(default)]
    pub communities: BTreeSet<CommunityId>,
}

impl Identity {
    pub fn new(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
            roles: BTreeSet::new(),
            communities: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn with_community(mut self, community_id: CommunityId) -> Self {
        self.communities.insert(community_id);
        self
    }

    pub fn can_moderate(&self) -> bool {
        self.roles.iter().any(Role::can_moderate)
    }
}

/// 密码哈希值，内容对核心不透明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
