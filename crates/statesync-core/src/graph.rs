//! Graph documents: states, processors, providers and routes to import
//! into a store.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::types::{Processor, ProcessorProvider, ProcessorStateRoute, StateConfig};

/// A state declaration. Only the header is imported; rows arrive via sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDeclaration {
    pub id: String,
    pub config: StateConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphDocument {
    pub states: Vec<StateDeclaration>,
    pub providers: Vec<ProcessorProvider>,
    pub processors: Vec<Processor>,
    pub routes: Vec<ProcessorStateRoute>,
}

impl GraphDocument {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let doc: GraphDocument = toml::from_str(content)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Every route must reference a declared processor, and every processor
    /// a declared provider.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for processor in &self.processors {
            if !self.providers.iter().any(|p| p.id == processor.provider_id) {
                return Err(ConfigError::Invalid(format!(
                    "processor {} references unknown provider {}",
                    processor.id, processor.provider_id
                )));
            }
        }
        for route in &self.routes {
            if !self.processors.iter().any(|p| p.id == route.processor_id) {
                return Err(ConfigError::Invalid(format!(
                    "route {} references unknown processor {}",
                    route.id, route.processor_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessorStateDirection;

    const GRAPH: &str = r#"
[[states]]
id = "S1"
config = { name = "questions", flag_auto_route_output_state_after_save = true, primary_key = ["query"] }

[[providers]]
id = "V1"
name = "openai"
version = "gpt-4"

[[processors]]
id = "P1"
provider_id = "V1"

[[routes]]
id = "R2"
state_id = "S1"
processor_id = "P1"
direction = "INPUT"
"#;

    #[test]
    fn parse_graph() {
        let doc = GraphDocument::parse(GRAPH).unwrap();
        assert_eq!(doc.states.len(), 1);
        assert!(doc.states[0].config.flag_auto_route_output_state_after_save);
        assert_eq!(doc.states[0].config.primary_key, vec!["query"]);
        assert_eq!(doc.routes[0].direction, ProcessorStateDirection::Input);
    }

    #[test]
    fn reject_route_with_unknown_processor() {
        let broken = GRAPH.replace("processor_id = \"P1\"", "processor_id = \"P9\"");
        assert!(matches!(
            GraphDocument::parse(&broken),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn empty_document_is_valid() {
        let doc = GraphDocument::parse("").unwrap();
        assert_eq!(doc, GraphDocument::default());
    }
}
