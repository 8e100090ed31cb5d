//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Workloads
// =============================================================================

define_id!(AppId, "app");

// =============================================================================
// Hosts
// =============================================================================

define_id!(AgentId, "agent");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_app_id_roundtrip() {
        let id = AppId::new();
        let parsed: AppId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("app_"));
    }

    #[test]
    fn test_app_id_invalid_prefix() {
        let result: Result<AppId, _> = "agent_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { expected: "app", .. }
        ));
    }

    #[test]
    fn test_app_id_missing_separator() {
        let result: Result<AppId, _> = "app01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_app_id_empty() {
        let result: Result<AppId, _> = "".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_app_id_rejects_path_characters() {
        let result: Result<AppId, _> = "app_../../etc/passwd".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_slug_parses_back() {
        let id = AppId::new();
        let slug = id.slug();
        assert_eq!(slug, slug.to_ascii_lowercase());
        assert_eq!(AppId::parse(&slug).unwrap(), id);
    }

    #[test]
    fn test_app_id_json() {
        let id = AppId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: AppId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_prefixes_unique() {
        assert_ne!(AppId::PREFIX, AgentId::PREFIX);
    }

    proptest! {
        #[test]
        fn rendered_ids_are_safe_tokens(raw in any::<u128>()) {
            let id = AppId::from_ulid(crate::Ulid::from(raw));
            let rendered = id.to_string();
            prop_assert!(rendered.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            prop_assert_eq!(AppId::parse(&rendered).unwrap(), id);
        }
    }
}
