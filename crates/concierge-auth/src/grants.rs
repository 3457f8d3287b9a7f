/// Static role → permission table.
///
/// Unknown roles get nothing, so a typo in a seeded role fails closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleGrants;

const ADMIN: &[&str] = &[
    "read",
    "write",
    "view_sensitive_data",
    "view_financial_data",
    "view_revenue_data",
    "view_sales_data",
    "analyze_data",
    "analyze_sales_data",
    "create_document",
    "create_documents",
    "access_admin_tools",
];

const ANALYST: &[&str] = &[
    "read",
    "view_financial_data",
    "view_revenue_data",
    "view_sales_data",
    "analyze_data",
    "analyze_sales_data",
];

const EDITOR: &[&str] = &["read", "write", "create_document", "create_documents"];

const VIEWER: &[&str] = &["read"];

impl RoleGrants {
    pub fn permissions_for(&self, role: &str) -> Vec<String> {
        let grants: &[&str] = match role.trim().to_ascii_lowercase().as_str() {
            "admin" => ADMIN,
            "analyst" => ANALYST,
            "editor" => EDITOR,
            "viewer" => VIEWER,
            _ => &[],
        };
        grants.iter().map(|p| p.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_holds_every_planner_permission() {
        let perms = RoleGrants.permissions_for("admin");
        for p in ["read", "view_financial_data", "create_document", "access_admin_tools"] {
            assert!(perms.iter().any(|x| x == p), "missing {p}");
        }
    }

    #[test]
    fn viewer_can_only_read() {
        assert_eq!(RoleGrants.permissions_for("viewer"), vec!["read".to_string()]);
    }

    #[test]
    fn analyst_cannot_write() {
        let perms = RoleGrants.permissions_for("Analyst");
        assert!(perms.iter().any(|p| p == "analyze_data"));
        assert!(!perms.iter().any(|p| p == "write"));
    }

    #[test]
    fn unknown_role_has_no_permissions() {
        assert!(RoleGrants.permissions_for("superuser").is_empty());
        assert!(RoleGrants.permissions_for("").is_empty());
    }
}
