use std::collections::HashMap;

use crate::error::SwitchboardError;
use crate::settings::{KnowledgeBaseConfig, RouteConfig};

/// Stateless lookup from the dialed number to its configuration: knowledge
/// base selection, human agent target and system-prompt persona. An
/// unmapped number is a normal `NotConfigured` outcome, never a panic or a
/// null field.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBaseRouter {
    routes: HashMap<String, RouteConfig>,
}

impl KnowledgeBaseRouter {
    pub fn new(routes: HashMap<String, RouteConfig>) -> Self {
        Self { routes }
    }

    pub fn knowledge_base(
        &self,
        service_number: &str,
    ) -> Result<&KnowledgeBaseConfig, SwitchboardError> {
        self.routes
            .get(service_number)
            .and_then(|r| r.knowledge_base.as_ref())
            .ok_or_else(|| SwitchboardError::NotConfigured(service_number.to_string()))
    }

    pub fn agent_number(&self, service_number: &str) -> Result<&str, SwitchboardError> {
        self.routes
            .get(service_number)
            .and_then(|r| r.agent_number.as_deref())
            .ok_or_else(|| SwitchboardError::NotConfigured(service_number.to_string()))
    }

    /// Persona blurb for the system prompt; callers fall back to a generic
    /// assistant when absent.
    pub fn system_blurb(&self, service_number: &str) -> Option<&str> {
        self.routes
            .get(service_number)
            .and_then(|r| r.system_blurb.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> KnowledgeBaseRouter {
        let mut routes = HashMap::new();
        routes.insert(
            "+15559990000".to_string(),
            RouteConfig {
                system_blurb: Some("Cricket Expert".into()),
                agent_number: Some("+15557770000".into()),
                knowledge_base: Some(KnowledgeBaseConfig {
                    search_index: "cricket-index".into(),
                    search_semantic_configuration: "cricket-semantic".into(),
                }),
            },
        );
        routes.insert("+15558880000".to_string(), RouteConfig::default());
        KnowledgeBaseRouter::new(routes)
    }

    #[test]
    fn resolves_full_route() {
        let r = router();
        let kb = r.knowledge_base("+15559990000").unwrap();
        assert_eq!(kb.search_index, "cricket-index");
        assert_eq!(r.agent_number("+15559990000").unwrap(), "+15557770000");
        assert_eq!(r.system_blurb("+15559990000"), Some("Cricket Expert"));
    }

    #[test]
    fn unmapped_number_is_not_configured() {
        let r = router();
        assert!(matches!(
            r.knowledge_base("+10000000000"),
            Err(SwitchboardError::NotConfigured(_))
        ));
        assert!(matches!(
            r.agent_number("+10000000000"),
            Err(SwitchboardError::NotConfigured(_))
        ));
        assert_eq!(r.system_blurb("+10000000000"), None);
    }

    #[test]
    fn partial_route_reports_missing_pieces() {
        let r = router();
        // number is mapped but carries no knowledge base or agent
        assert!(r.knowledge_base("+15558880000").is_err());
        assert!(r.agent_number("+15558880000").is_err());
    }
}
