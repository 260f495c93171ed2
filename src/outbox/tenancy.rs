//! Tenant scoping of outbox operations.

use std::collections::BTreeSet;

use super::error::TenantError;

/// Which tenant identifiers outbox operations accept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenancyPolicy {
    enabled: bool,
    tenant_ids: BTreeSet<String>,
}

impl TenancyPolicy {
    /// Single-tenant deployment: tenant identifiers are rejected
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Multi-tenant deployment with a fixed set of tenants
    pub fn enabled<I, S>(tenant_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            tenant_ids: tenant_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Configured tenants, sorted
    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.tenant_ids.iter().map(String::as_str)
    }

    /// Validate a tenant argument and return the scope it selects
    pub fn resolve<'a>(&self, tenant_id: Option<&'a str>) -> Result<Option<&'a str>, TenantError> {
        match (self.enabled, tenant_id) {
            (false, None) => Ok(None),
            (false, Some(id)) => Err(TenantError::TenantNotSupported(id.to_string())),
            (true, None) => Err(TenantError::MissingTenant),
            (true, Some(id)) if self.tenant_ids.contains(id) => Ok(Some(id)),
            (true, Some(id)) => Err(TenantError::UnknownTenant {
                tenant_id: id.to_string(),
                valid: self.tenant_ids.iter().cloned().collect(),
            }),
        }
    }

    /// Scopes a poller walks through on every round
    pub fn polling_scopes(&self) -> Vec<Option<String>> {
        if self.enabled {
            self.tenant_ids.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_disabled_rejects_tenant() {
        let policy = TenancyPolicy::disabled();
        assert_eq!(policy.resolve(None), Ok(None));
        assert_eq!(
            policy.resolve(Some("acme")),
            Err(TenantError::TenantNotSupported("acme".to_string()))
        );
    }

    #[test]
    fn test_enabled_requires_tenant() {
        let policy = TenancyPolicy::enabled(["acme"]);
        assert_eq!(policy.resolve(None), Err(TenantError::MissingTenant));
        assert_eq!(policy.resolve(Some("acme")), Ok(Some("acme")));
    }

    #[test]
    fn test_unknown_tenant_lists_valid_ids() {
        let policy = TenancyPolicy::enabled(["globex", "acme"]);
        let err = policy.resolve(Some("initech")).unwrap_err();
        assert_eq!(
            err,
            TenantError::UnknownTenant {
                tenant_id: "initech".to_string(),
                valid: vec!["acme".to_string(), "globex".to_string()],
            }
        );
        assert_eq!(
            err.to_string(),
            "unknown tenant identifier 'initech', valid identifiers are: [acme, globex]"
        );
    }

    #[test]
    fn test_polling_scopes() {
        assert_eq!(TenancyPolicy::disabled().polling_scopes(), vec![None]);
        assert_eq!(
            TenancyPolicy::enabled(["b", "a"]).polling_scopes(),
            vec![Some("a".to_string()), Some("b".to_string())]
        );
    }
}
