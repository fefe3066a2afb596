use serde::{Deserialize, Serialize};
use std::fmt;

/// Application role carried by tickets and session tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Developer,
    Tenant,
    Accountant,
    Vendor,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Provider,
        Role::Developer,
        Role::Tenant,
        Role::Accountant,
        Role::Vendor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Developer => "developer",
            Role::Tenant => "tenant",
            Role::Accountant => "accountant",
            Role::Vendor => "vendor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provider" => Ok(Role::Provider),
            "developer" => Ok(Role::Developer),
            "tenant" => Ok(Role::Tenant),
            "accountant" => Ok(Role::Accountant),
            "vendor" => Ok(Role::Vendor),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("Provider".parse::<Role>().unwrap(), Role::Provider);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Accountant).unwrap(), "\"accountant\"");
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }
}
